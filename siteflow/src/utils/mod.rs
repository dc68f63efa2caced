//! Small helpers shared across modules: timestamps, file publishing and locking.

pub mod fs;
pub mod timestamps;

pub use fs::{append_to_file, write_atomic, FileLock};
pub use timestamps::{format_iso8601, iso_timestamp};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        // RFC3339: YYYY-MM-DDTHH:MM:SS.ssssss+00:00
        assert!(ts.contains('T'));
        assert!(ts.contains(':'));
    }
}
