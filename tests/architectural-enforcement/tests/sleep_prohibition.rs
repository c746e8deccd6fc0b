//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Library code waits on I/O, signals and channels, never on the
//! clock. **Exceptions**: the token bucket (sleeps until the next token is
//! due) and backoff (sleeps the retry delay). Timeouts use
//! `tokio::time::timeout`.

use architectural_enforcement::{find_violations, library_src, report};

const ALLOWED: &[&str] = &["limit/rate.rs", "limit/backoff.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<_> = find_violations(&library_src(), &["::sleep(", ".sleep("])
        .into_iter()
        .filter(|line| !ALLOWED.iter().any(|allowed| line.path.ends_with(allowed)))
        .collect();

    report("no sleep outside limit/ (use signals, channels or timeout)", &violations);
}

#[test]
fn test_no_blocking_thread_sleep_anywhere() {
    let violations = find_violations(&library_src(), &["std::thread::sleep", "thread::sleep("]);
    report("no blocking std::thread::sleep", &violations);
}
