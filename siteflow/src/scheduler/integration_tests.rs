//! End-to-end scheduler scenarios over a temporary storage root.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::config::{ConfigGenerator, ConfigTemplate};
    use crate::core::{JobOutcome, Job, JobStatus, Stage, Target};
    use crate::errors::SiteflowError;
    use crate::events::CollectingEventSink;
    use crate::layout::StorageLayout;
    use crate::registry::{SiteCode, SiteRegistry, SiteSpec};
    use crate::runner::{StageRunner, ToolInvocation, ToolInvoker, ToolOutput};
    use crate::scheduler::{
        JobRequest, JitterStrategy, PipelineExecutor, RetryConfig, Scheduler, StageExecutor, StateTable,
    };
    use crate::settings::ToolSettings;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeSet, HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const EXTRACTOR: &str = "ctp";
    const SPLITS: u32 = 2;

    /// Stands in for the external tool: preprocessing writes one feature
    /// file per raw slide, training writes a checkpoint, cross-validation
    /// writes prediction tables.
    #[derive(Default)]
    struct FakeTool {
        failing: HashSet<String>,
        left_missing: HashMap<String, usize>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeTool {
        fn calls_for(&self, command: &str) -> usize {
            self.calls.lock().iter().filter(|(_, c)| c == command).count()
        }
    }

    #[async_trait]
    impl ToolInvoker for FakeTool {
        async fn invoke(
            &self,
            invocation: &ToolInvocation,
            _cancel: Arc<CancellationToken>,
        ) -> std::io::Result<ToolOutput> {
            let command = invocation.args[invocation.args.len() - 1].clone();
            let document = PathBuf::from(&invocation.args[invocation.args.len() - 2]);
            let ns_dir = document.ancestors().nth(3).unwrap().to_path_buf();
            let ns = ns_dir.file_name().unwrap().to_string_lossy().into_owned();
            self.calls.lock().push((ns.clone(), command.clone()));

            match command.as_str() {
                "preprocess" if self.failing.contains(&ns) => {
                    return Ok(ToolOutput::exited(1, "", "RuntimeError: CUDA out of memory\n"));
                }
                "preprocess" => {
                    let mut slides: Vec<PathBuf> = std::fs::read_dir(ns_dir.join("raw"))?
                        .map(|e| e.map(|e| e.path()))
                        .collect::<Result<_, _>>()?;
                    slides.sort();
                    let keep = slides.len() - self.left_missing.get(&ns).copied().unwrap_or(0);
                    let out = ns_dir.join("features").join(EXTRACTOR);
                    std::fs::create_dir_all(&out)?;
                    for slide in &slides[..keep] {
                        let stem = slide.file_stem().unwrap().to_string_lossy();
                        std::fs::write(out.join(format!("{stem}.h5")), format!("features of {stem}"))?;
                    }
                }
                "train" => {
                    let dir = ns_dir.join("results/train");
                    std::fs::create_dir_all(&dir)?;
                    std::fs::write(dir.join("model.ckpt"), b"weights")?;
                }
                "crossval" => {
                    for fold in 0..SPLITS {
                        let dir = ns_dir.join(format!("results/crossval/fold-{fold}"));
                        std::fs::create_dir_all(&dir)?;
                        std::fs::write(dir.join("patient-preds.csv"), "PATIENT,pred\n")?;
                    }
                }
                _ => {}
            }
            Ok(ToolOutput::exited(0, format!("{command} done\n"), ""))
        }
    }

    struct Project {
        _tmp: tempfile::TempDir,
        layout: StorageLayout,
        generator: Arc<ConfigGenerator>,
    }

    impl Project {
        /// Sites with their raw slide counts; slide tables are written too.
        fn new(sites: &[(&str, usize)]) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let layout = StorageLayout::new(tmp.path(), 2);
            let specs: Vec<SiteSpec> = sites.iter().map(|(code, _)| SiteSpec::new(*code)).collect();
            let registry = SiteRegistry::new(&specs, &layout, EXTRACTOR, "cpu").unwrap();
            std::fs::create_dir_all(layout.tables_dir()).unwrap();

            for (code, slides) in sites {
                let raw = layout.raw_dir(code);
                std::fs::create_dir_all(&raw).unwrap();
                let mut clinical = String::from("PATIENT,isMSIH\n");
                let mut slide_table = String::from("PATIENT,FILENAME\n");
                for i in 0..*slides {
                    let name = format!("{code}{}", i + 1);
                    std::fs::write(raw.join(format!("{name}.svs")), b"wsi").unwrap();
                    clinical.push_str(&format!("{name}-p,MSIH\n"));
                    slide_table.push_str(&format!("{name}-p,{name}\n"));
                }
                std::fs::write(layout.clinical_table(code), clinical).unwrap();
                std::fs::write(layout.slide_table(code), slide_table).unwrap();
            }

            let template = ConfigTemplate::default()
                .with_extractor(EXTRACTOR)
                .with_n_splits(SPLITS);
            let generator = Arc::new(ConfigGenerator::new(registry, layout.clone(), template));
            Self {
                _tmp: tmp,
                layout,
                generator,
            }
        }

        fn state(&self) -> StateTable {
            StateTable::new(self.generator.registry().codes().into_iter().cloned().collect())
        }

        fn scheduler(&self, tool: Arc<FakeTool>, retry: RetryConfig) -> Scheduler {
            let runner = StageRunner::new(tool, ToolSettings::default());
            let executor = Arc::new(PipelineExecutor::new(self.generator.clone(), runner));
            Scheduler::new(executor)
                .with_retry(retry)
                .with_max_parallel(3)
                .with_state_file(self.layout.state_file())
        }

        fn aggregate_stems(&self) -> BTreeSet<String> {
            let dir = self.layout.aggregate_features_dir().join(EXTRACTOR);
            match std::fs::read_dir(dir) {
                Ok(entries) => entries
                    .map(|e| e.unwrap().path().file_stem().unwrap().to_string_lossy().into_owned())
                    .collect(),
                Err(_) => BTreeSet::new(),
            }
        }
    }

    fn site(code: &str) -> Target {
        Target::Site(SiteCode::new(code).unwrap())
    }

    fn immediate_retry(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(0)
            .with_jitter(JitterStrategy::None)
    }

    fn token() -> Arc<CancellationToken> {
        Arc::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_two_sites_merge_and_rerun_is_idempotent() {
        let project = Project::new(&[("a", 2), ("b", 1)]);
        let tool = Arc::new(FakeTool::default());
        let scheduler = project
            .scheduler(tool.clone(), RetryConfig::no_retry())
            .with_until(Stage::Consolidate);
        let mut state = project.state();

        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert!(summary.is_success(), "{summary:?}");
        assert_eq!(state.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Complete);
        let expected: BTreeSet<String> = ["a1", "a2", "b1"].into_iter().map(String::from).collect();
        assert_eq!(project.aggregate_stems(), expected);
        assert!(!state.status(&Target::Aggregate, Stage::Train).is_terminal());
        assert_eq!(tool.calls_for("train"), 0);

        state.reopen(&Target::Aggregate, Stage::Consolidate).unwrap();
        let rerun = scheduler.run(&mut state, token()).await.unwrap();
        assert!(rerun.is_success());
        assert_eq!(rerun.completed.len(), 1);
        assert_eq!(project.aggregate_stems(), expected);
        assert_eq!(tool.calls_for("preprocess"), 2);

        let merged = std::fs::read_to_string(project.layout.slide_table("all")).unwrap();
        assert_eq!(merged, "PATIENT,FILENAME\na1-p,a1\na2-p,a2\nb1-p,b1\n");
    }

    #[tokio::test]
    async fn test_failed_site_blocks_barrier_without_affecting_others() {
        let project = Project::new(&[("a", 2), ("b", 1), ("c", 1)]);
        let tool = Arc::new(FakeTool {
            failing: HashSet::from(["c".to_string()]),
            ..FakeTool::default()
        });
        let events = Arc::new(CollectingEventSink::new());
        let scheduler = project
            .scheduler(tool, RetryConfig::no_retry())
            .with_event_sink(events.clone());
        let mut state = project.state();

        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert!(!summary.is_success());
        assert_eq!(state.status(&site("c"), Stage::Preprocess), JobStatus::Failed);
        assert_eq!(state.status(&site("a"), Stage::Validate), JobStatus::Complete);
        assert_eq!(state.status(&site("b"), Stage::Validate), JobStatus::Complete);
        assert_eq!(state.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Pending);
        assert!(project.aggregate_stems().is_empty());

        assert_eq!(summary.unresolved, vec![(site("c"), Stage::Preprocess)]);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].code, "SITEFLOW-STAGE-FAILED");
        assert!(summary.failures[0].error.contains("CUDA out of memory"));
        let barrier = summary
            .blocked
            .iter()
            .find(|b| b.stage == Stage::Consolidate)
            .unwrap();
        assert!(barrier.waiting_on.contains(&"c/preprocess".to_string()));

        assert!(events.events_of_type("barrier.released").is_empty());
        let last_blocked = events.events_of_type("barrier.blocked").pop().unwrap();
        assert_eq!(last_blocked.data["waiting_on"], serde_json::json!(["c"]));
        assert_eq!(events.events_of_type("job.failed").len(), 1);

        state.exclude(&SiteCode::new("c").unwrap()).unwrap();
        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert!(summary.is_success(), "{summary:?}");
        assert_eq!(state.status(&Target::Aggregate, Stage::Statistics), JobStatus::Complete);
        assert_eq!(project.aggregate_stems().len(), 3);
        assert_eq!(events.events_of_type("barrier.released").len(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_site_is_not_eligible() {
        let project = Project::new(&[("d", 10)]);
        let tool = Arc::new(FakeTool {
            left_missing: HashMap::from([("d".to_string(), 2)]),
            ..FakeTool::default()
        });
        let scheduler = project
            .scheduler(tool.clone(), immediate_retry(2))
            .with_until(Stage::Consolidate);
        let mut state = project.state();

        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert_eq!(state.status(&site("d"), Stage::Validate), JobStatus::Failed);
        assert_eq!(state.status(&site("d"), Stage::Preprocess), JobStatus::Complete);
        assert_eq!(state.get(&site("d"), Stage::Preprocess).unwrap().attempt, 2);
        assert_eq!(tool.calls_for("preprocess"), 2);
        assert_eq!(state.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Pending);

        let incomplete: Vec<_> = summary
            .failures
            .iter()
            .filter(|f| f.code == "SITEFLOW-OUTPUT-INCOMPLETE")
            .collect();
        assert_eq!(incomplete.len(), 2);
        assert!(incomplete[0].will_retry);
        assert!(!incomplete[1].will_retry);
        assert!(incomplete[1].error.contains("2 of 10 artifacts missing"));
        assert!(project.aggregate_stems().is_empty());
    }

    #[tokio::test]
    async fn test_full_pipeline_orders_stages() {
        let project = Project::new(&[("a", 2), ("b", 2)]);
        let tool = Arc::new(FakeTool::default());
        let events = Arc::new(CollectingEventSink::new());
        let scheduler = project
            .scheduler(tool.clone(), RetryConfig::no_retry())
            .with_event_sink(events.clone());
        let mut state = project.state();

        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert!(summary.is_success(), "{summary:?}");
        for (target, stage, entry) in state.iter() {
            assert_eq!(entry.status, JobStatus::Complete, "{target}/{stage}");
        }
        assert_eq!(tool.calls_for("heatmap"), 2);
        assert_eq!(tool.calls_for("statistics"), 1);

        let submitted: Vec<(String, String)> = events
            .events_of_type("job.submitted")
            .iter()
            .map(|e| {
                (
                    e.data["target"].as_str().unwrap().to_string(),
                    e.data["stage"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        let pos = |t: &str, s: &str| {
            submitted
                .iter()
                .position(|(pt, ps)| pt == t && ps == s)
                .unwrap()
        };
        let consolidate = pos("all", "consolidate");
        for s in ["a", "b"] {
            assert!(pos(s, "validate") < consolidate);
            assert!(pos(s, "heatmap") > pos("all", "train"));
        }
        assert!(pos("all", "statistics") > pos("all", "crossval"));

        let saved = StateTable::load(&project.layout.state_file(), state.sites().to_vec()).unwrap();
        assert_eq!(saved.status(&site("b"), Stage::Heatmap), JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_missing_input_is_rejected_not_retried() {
        let project = Project::new(&[("a", 1)]);
        std::fs::remove_dir_all(project.layout.raw_dir("a")).unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let scheduler = project
            .scheduler(Arc::new(FakeTool::default()), immediate_retry(3))
            .with_event_sink(events.clone())
            .with_until(Stage::Preprocess);
        let mut state = project.state();

        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert_eq!(state.status(&site("a"), Stage::Preprocess), JobStatus::Failed);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].code, "SITEFLOW-CONFIG-MISSING_INPUT");
        assert!(!summary.failures[0].will_retry);
        assert_eq!(events.events_of_type("job.rejected").len(), 1);
    }

    /// Counts concurrent executions; optionally waits for cancellation.
    #[derive(Default)]
    struct GaugeExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
        block_until_cancelled: bool,
    }

    #[async_trait]
    impl StageExecutor for GaugeExecutor {
        async fn execute(&self, request: JobRequest, cancel: Arc<CancellationToken>) -> JobOutcome {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let job = Job::start(request.target, request.stage, request.attempt);

            let outcome = if self.block_until_cancelled {
                cancel.cancelled().await;
                JobOutcome::failed(job, None, SiteflowError::Cancelled("stopped".to_string()))
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                JobOutcome::completed(job.complete(Some(0)))
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    /// Site `s0` prepares slowly; every other site fails its first prepare.
    struct SlowAndFlakyExecutor {
        slow: Duration,
        started: Mutex<Vec<(Target, u32, Instant)>>,
    }

    #[async_trait]
    impl StageExecutor for SlowAndFlakyExecutor {
        async fn execute(&self, request: JobRequest, _cancel: Arc<CancellationToken>) -> JobOutcome {
            self.started
                .lock()
                .push((request.target.clone(), request.attempt, Instant::now()));
            let slow = request.target == site("s0");
            let job = Job::start(request.target, request.stage, request.attempt);
            if slow {
                tokio::time::sleep(self.slow).await;
            } else if request.attempt == 1 {
                let error = SiteflowError::Io(std::io::Error::other("transient"));
                return JobOutcome::failed(job, Some(1), error);
            }
            JobOutcome::completed(job.complete(Some(0)))
        }
    }

    fn codes(n: usize) -> Vec<SiteCode> {
        (0..n).map(|i| SiteCode::new(format!("s{i}")).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let executor = Arc::new(GaugeExecutor::default());
        let scheduler = Scheduler::new(executor.clone())
            .with_max_parallel(2)
            .with_until(Stage::Preprocess);
        let mut state = StateTable::new(codes(6));

        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.completed.len(), 12);
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_jobs_end_failed() {
        let executor = Arc::new(GaugeExecutor {
            block_until_cancelled: true,
            ..GaugeExecutor::default()
        });
        let scheduler = Scheduler::new(executor).with_retry(immediate_retry(3));
        let mut state = StateTable::new(codes(2));
        let cancel = token();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel("operator interrupt");
        });
        let summary = scheduler.run(&mut state, cancel).await.unwrap();

        assert!(summary.cancelled);
        assert!(!summary.is_success());
        for code in codes(2) {
            let target = Target::Site(code);
            assert_eq!(state.status(&target, Stage::Prepare), JobStatus::Failed);
            assert_eq!(state.get(&target, Stage::Prepare).unwrap().retry_at, None);
        }
        assert!(summary.failures.iter().all(|f| !f.will_retry));
    }

    #[tokio::test]
    async fn test_resume_after_interruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let mut state = StateTable::new(codes(1));
        state.promote_ready();
        state.mark_running(&site("s0"), Stage::Prepare).unwrap();
        state.save(&path).unwrap();

        let mut resumed = StateTable::load(&path, codes(1)).unwrap();
        assert_eq!(resumed.status(&site("s0"), Stage::Prepare), JobStatus::Failed);
        resumed.reopen(&site("s0"), Stage::Prepare).unwrap();

        let scheduler = Scheduler::new(Arc::new(GaugeExecutor::default())).with_until(Stage::Validate);
        let summary = scheduler.run(&mut resumed, token()).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(resumed.get(&site("s0"), Stage::Prepare).unwrap().attempt, 2);
        assert!(Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_due_retry_does_not_wait_for_unrelated_job() {
        let executor = Arc::new(SlowAndFlakyExecutor {
            slow: Duration::from_millis(1500),
            started: Mutex::new(Vec::new()),
        });
        let retry = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay_ms(10)
            .with_jitter(JitterStrategy::None);
        let scheduler = Scheduler::new(executor.clone())
            .with_retry(retry)
            .with_max_parallel(4)
            .with_until(Stage::Prepare);
        let mut state = StateTable::new(codes(2));

        let began = Instant::now();
        let summary = scheduler.run(&mut state, token()).await.unwrap();
        assert!(summary.is_success());

        let started = executor.started.lock().clone();
        let retried = started
            .iter()
            .find(|(target, attempt, _)| *target == site("s1") && *attempt == 2)
            .map(|(_, _, at)| at.duration_since(began))
            .unwrap();
        assert!(retried < Duration::from_millis(750), "retry started after {retried:?}");
        assert_eq!(state.get(&site("s1"), Stage::Prepare).unwrap().attempt, 2);
    }
}
