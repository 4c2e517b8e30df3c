//! Shared helper utilities used across Stagecoach components.

use std::env;
use std::path::Path;

const DIAGNOSTIC_ENV: &str = "STAGECOACH_DIAGNOSTIC";
const DEFAULT_LOG_LIMIT: usize = 160;
const DIAGNOSTIC_LOG_LIMIT: usize = 2048;

/// Check whether a program exists, either as a path or somewhere on $PATH.
pub fn program_in_path(program: &str) -> bool {
    if program.is_empty() {
        return false;
    }
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(program).is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Returns true when diagnostics are explicitly enabled via environment.
pub fn diagnostic_mode() -> bool {
    diagnostic_mode_from(env::var(DIAGNOSTIC_ENV).ok().as_deref())
}

fn diagnostic_mode_from(value: Option<&str>) -> bool {
    matches!(
        value
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Returns the effective log snippet limit for the current mode.
pub fn log_limit() -> usize {
    log_limit_for(diagnostic_mode())
}

fn log_limit_for(diagnostic: bool) -> usize {
    if diagnostic {
        DIAGNOSTIC_LOG_LIMIT
    } else {
        DEFAULT_LOG_LIMIT
    }
}

/// Strips newlines and caps length so remote output stays on one log line.
pub fn sanitize_log_value(value: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    let mut cleaned = String::with_capacity(max_len.min(value.len()));
    let mut truncated = false;
    for (count, ch) in value.chars().enumerate() {
        if count >= max_len {
            truncated = true;
            break;
        }
        cleaned.push(if ch == '\n' || ch == '\r' { ' ' } else { ch });
    }
    let trimmed = cleaned.trim();
    if truncated {
        format!("{trimmed}...")
    } else {
        trimmed.to_string()
    }
}

/// Produces a safe log snippet honoring diagnostic mode limits.
pub fn log_snippet(value: &str) -> String {
    sanitize_log_value(value, log_limit())
}

/// Snippet of the last non-empty captured lines, most useful for failures.
pub fn tail_snippet(lines: &[String]) -> String {
    let limit = log_limit();
    let mut selected: Vec<&str> = Vec::new();
    let mut budget = 0usize;
    for line in lines.iter().rev().map(|line| line.trim()) {
        if line.is_empty() {
            continue;
        }
        budget += line.len() + 3;
        selected.push(line);
        if budget >= limit {
            break;
        }
    }
    selected.reverse();
    let joined = selected.join(" | ");
    let skip = joined.chars().count().saturating_sub(limit);
    if skip == 0 {
        joined
    } else {
        format!("...{}", joined.chars().skip(skip).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_log_value_strips_newlines_and_caps() {
        assert_eq!(sanitize_log_value("ab\ncd\rEF", 5), "ab cd...");
        assert_eq!(sanitize_log_value("ok", 5), "ok");
        assert_eq!(sanitize_log_value("anything", 0), "");
    }

    #[test]
    fn diagnostic_mode_parses_expected_values() {
        assert!(diagnostic_mode_from(Some("1")));
        assert!(diagnostic_mode_from(Some("YES")));
        assert!(diagnostic_mode_from(Some(" on ")));
        assert!(!diagnostic_mode_from(Some("0")));
        assert!(!diagnostic_mode_from(None));
    }

    #[test]
    fn log_limit_respects_mode() {
        assert_eq!(log_limit_for(false), DEFAULT_LOG_LIMIT);
        assert_eq!(log_limit_for(true), DIAGNOSTIC_LOG_LIMIT);
    }

    #[test]
    fn tail_snippet_keeps_last_lines_in_order() {
        let lines = vec![
            "starting".to_string(),
            String::new(),
            "step two".to_string(),
            "failed: disk full".to_string(),
        ];
        assert_eq!(tail_snippet(&lines), "starting | step two | failed: disk full");

        let long = vec!["x".repeat(DEFAULT_LOG_LIMIT * 2)];
        let snippet = tail_snippet(&long);
        assert!(snippet.starts_with("..."));
        assert!(snippet.chars().count() <= DEFAULT_LOG_LIMIT + 3);
    }

    #[test]
    fn program_lookup_handles_paths() {
        assert!(!program_in_path(""));
        assert!(!program_in_path("/definitely/not/here/ssh"));
    }
}
