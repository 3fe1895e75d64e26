//! Test log evaluation.

use regex::RegexBuilder;
use runnel_config::ResultPatterns;
use runnel_core::BuildResult;
use std::path::Path;
use tracing::warn;

/// Result of a finished test run from its log content.
///
/// No success marker means the run never got far enough: `ko`.
pub fn evaluate(patterns: &ResultPatterns, content: &str) -> BuildResult {
    if !content.contains(&patterns.success) {
        return BuildResult::Ko;
    }
    if matches(&patterns.error, content) {
        BuildResult::Ko
    } else if matches(&patterns.warning, content) {
        BuildResult::Warn
    } else {
        BuildResult::Ok
    }
}

/// Evaluate a log file; a missing or unreadable log is `ko`.
pub async fn evaluate_log(patterns: &ResultPatterns, path: &Path) -> BuildResult {
    match tokio::fs::read(path).await {
        Ok(bytes) => evaluate(patterns, &String::from_utf8_lossy(&bytes)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read test log");
            BuildResult::Ko
        }
    }
}

fn matches(pattern: &str, content: &str) -> bool {
    match RegexBuilder::new(pattern).multi_line(true).build() {
        Ok(re) => re.is_match(content),
        Err(e) => {
            warn!(pattern, error = %e, "Invalid result pattern");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOADED: &str = "2024-01-01 10:00:00,000 42 INFO db odoo.modules.loading: Modules loaded.\n";

    #[test]
    fn test_clean_log_is_ok() {
        let patterns = ResultPatterns::default();
        assert_eq!(evaluate(&patterns, LOADED), BuildResult::Ok);
    }

    #[test]
    fn test_missing_marker_is_ko() {
        let patterns = ResultPatterns::default();
        assert_eq!(evaluate(&patterns, "nothing useful\n"), BuildResult::Ko);
        assert_eq!(evaluate(&patterns, ""), BuildResult::Ko);
    }

    #[test]
    fn test_error_beats_warning() {
        let patterns = ResultPatterns::default();
        let log = format!(
            "{}2024-01-01 10:00:01,000 42 WARNING db x: careful\n2024-01-01 10:00:02,000 42 ERROR db x: boom\n",
            LOADED
        );
        assert_eq!(evaluate(&patterns, &log), BuildResult::Ko);
    }

    #[test]
    fn test_traceback_is_ko() {
        let patterns = ResultPatterns::default();
        let log = format!("{}Traceback (most recent call last):\n", LOADED);
        assert_eq!(evaluate(&patterns, &log), BuildResult::Ko);
    }

    #[test]
    fn test_warning_only_is_warn() {
        let patterns = ResultPatterns::default();
        let log = format!("{}2024-01-01 10:00:01,000 42 WARNING db x: careful\n", LOADED);
        assert_eq!(evaluate(&patterns, &log), BuildResult::Warn);
    }

    #[tokio::test]
    async fn test_missing_file_is_ko() {
        let patterns = ResultPatterns::default();
        let result = evaluate_log(&patterns, Path::new("/nonexistent/runnel/test.txt")).await;
        assert_eq!(result, BuildResult::Ko);
    }
}
