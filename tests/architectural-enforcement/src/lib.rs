//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce source rules on the
//! `switchboard-core` library:
//! - No sleeping outside the rate limiter and backoff
//! - No printing to stdout/stderr from library code
//! - No blocking network I/O
//!
//! Helpers here walk the library sources and yield production lines only:
//! comments are stripped and everything from the first `#[cfg(test)]` of a
//! file onward is ignored.

use std::fs;
use std::path::{Path, PathBuf};

/// One line of production source
#[derive(Debug)]
pub struct SourceLine {
    /// File the line is in
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text with any `//` comment removed
    pub code: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.code.trim())
    }
}

/// Root of the library sources under test
#[must_use]
pub fn library_src() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../switchboard/core/src")
}

/// Every production line of every `.rs` file under `dir`
#[must_use]
pub fn production_lines(dir: &Path) -> Vec<SourceLine> {
    let mut lines = Vec::new();

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };

        for (idx, line) in content.lines().enumerate() {
            if line.trim_start().starts_with("#[cfg(test)]") {
                break;
            }
            let code = line.split("//").next().unwrap_or(line);
            if code.trim().is_empty() {
                continue;
            }
            lines.push(SourceLine {
                path: entry.path().to_path_buf(),
                number: idx + 1,
                code: code.to_string(),
            });
        }
    }

    lines
}

/// Production lines under `dir` containing any of `patterns`
#[must_use]
pub fn find_violations(dir: &Path, patterns: &[&str]) -> Vec<SourceLine> {
    production_lines(dir)
        .into_iter()
        .filter(|line| patterns.iter().any(|p| line.code.contains(p)))
        .collect()
}

/// Production lines that bind a `Channel::push` acknowledgement to `_`
///
/// The acknowledgement is a future, so `let _ =` reads like it was awaited.
/// Fire-and-forget pushes spell it `drop(..)`.
#[must_use]
pub fn discarded_futures(dir: &Path) -> Vec<SourceLine> {
    production_lines(dir)
        .into_iter()
        .filter(|line| line.code.contains("let _ =") && line.code.contains(".push("))
        .collect()
}

/// Panic with a readable report if `violations` is not empty
pub fn report(rule: &str, violations: &[SourceLine]) {
    if violations.is_empty() {
        return;
    }
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!("\nFound {} violation(s) of: {rule}", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_sources_are_found() {
        let lines = production_lines(&library_src());
        assert!(
            lines.iter().any(|l| l.path.ends_with("lib.rs")),
            "expected to scan switchboard/core/src"
        );
    }

    #[test]
    fn test_comments_and_test_modules_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(
            dir.path().join("sample.rs"),
            "fn a() {} // println!(\"x\")\n#[cfg(test)]\nmod tests { fn b() { println!(\"y\"); } }\n",
        )
        .unwrap();

        assert!(find_violations(dir.path(), &["println!"]).is_empty());
        assert_eq!(production_lines(dir.path()).len(), 1);
    }

    #[test]
    fn test_discarded_push_is_found_but_explicit_drop_is_not() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(
            dir.path().join("sample.rs"),
            "fn a() {\n    let _ = queue.push(1);\n    drop(queue.push(2));\n}\n",
        )
        .unwrap();

        let violations = discarded_futures(dir.path());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].number, 2);
    }
}
