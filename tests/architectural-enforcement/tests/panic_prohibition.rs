//! Integration Test: Unwrap/Expect Prohibition
//!
//! **Policy**: Production code propagates errors with `?` (thiserror in the
//! core, anyhow in the CLI). `unwrap()` and `expect()` are for tests only.
//! `unwrap_or`, `unwrap_or_else` and `unwrap_or_default` are fine.

use architectural_enforcement::scan_production;

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations =
        scan_production(|code| code.contains(".unwrap()") || code.contains(".expect("));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: unwrap()/expect() found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        panic!(
            "\nFound {} unwrap/expect violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
