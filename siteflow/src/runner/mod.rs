//! Stage execution through the external tool.

mod invoker;
mod stage_runner;

#[cfg(test)]
pub use invoker::MockToolInvoker;
pub use invoker::{ExternalTool, Interruption, ToolInvocation, ToolInvoker, ToolOutput};
pub use stage_runner::StageRunner;
