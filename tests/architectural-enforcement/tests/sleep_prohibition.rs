//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. The read loop
//! waits on the stream, a cancellation token or an idle timeout; nothing
//! polls.
//! **Exceptions**: test code (`#[cfg(test)]` modules and `tests/`)

use architectural_enforcement::scan_production;

#[test]
fn test_no_sleep_in_production_code() {
    let violations =
        scan_production(|code| code.contains("::sleep(") || code.contains(".sleep("));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Instead:");
        eprintln!("  - tokio::time::timeout() around the awaited I/O");
        eprintln!("  - CancellationToken::cancelled() in a select!");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
