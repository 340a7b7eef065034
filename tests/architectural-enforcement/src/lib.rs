//! Architectural Enforcement Integration Tests
//!
//! Shared scanning helpers for the tests in `tests/`, which enforce:
//! - No sleep() calls in production code (wait on I/O or timeouts instead)
//! - No unwrap()/expect() in production code (errors are propagated)
//!
//! Production code is everything in a source file before its first
//! `#[cfg(test)]` item. Comment text is ignored.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories that count as production code, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["conductor/core/src", "conductor/cli/src"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line_number: usize,
    /// The trimmed line
    pub line: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line_number, self.line)
    }
}

/// Workspace root (two levels above this package)
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Code part of a line, with any `//` comment removed
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Production lines of a source text as `(line_number, line)` pairs
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| (idx + 1, line))
        .collect()
}

/// Scan every `.rs` file under the production directories
///
/// `is_violation` receives the comment-free code part of each production line.
pub fn scan_production<F>(is_violation: F) -> Vec<Violation>
where
    F: Fn(&str) -> bool,
{
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let content = match fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(_) => continue,
            };
            for (line_number, line) in production_lines(&content) {
                if is_violation(code_part(line)) {
                    violations.push(Violation {
                        path: entry.path().to_path_buf(),
                        line_number,
                        line: line.trim().to_string(),
                    });
                }
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_part_strips_comments() {
        assert_eq!(code_part("let x = 1; // x.unwrap()"), "let x = 1; ");
        assert_eq!(code_part("/// docs"), "");
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\nfn b() {}\n#[cfg(test)]\nmod tests {\n    fn c() { x.unwrap(); }\n}\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}"), (2, "fn b() {}")]);
    }

    #[test]
    fn test_production_dirs_exist() {
        for dir in PRODUCTION_DIRS {
            assert!(workspace_root().join(dir).exists(), "{dir} missing");
        }
    }
}
