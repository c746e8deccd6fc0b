//! Integration Test: Library Hygiene
//!
//! **Policy**: the library reports through `tracing`, never stdout/stderr,
//! uses `tokio::net` rather than blocking sockets, and propagates errors
//! instead of unwrapping them.

use architectural_enforcement::{discarded_futures, find_violations, library_src, report};

#[test]
fn test_no_printing_in_library_code() {
    let violations = find_violations(
        &library_src(),
        &["println!", "eprintln!", "print!(", "eprint!(", "dbg!("],
    );
    report("no printing from library code (use tracing)", &violations);
}

#[test]
fn test_no_blocking_network_io() {
    let violations = find_violations(
        &library_src(),
        &["std::net::", "std::os::unix::net::"],
    );
    report("no blocking sockets (use tokio::net)", &violations);
}

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = find_violations(&library_src(), &[".unwrap()", ".expect("]);
    report("no unwrap/expect outside tests (propagate errors)", &violations);
}

#[test]
fn test_no_discarded_push_acknowledgements() {
    let violations = discarded_futures(&library_src());
    report("no `let _ =` on Channel::push (use drop(..))", &violations);
}
