//! Constant-time comparison for secrets pulled from requests.
//!
//! API keys, CSRF tokens and MCP signatures must never be compared with `==`.
//! A length mismatch still costs a full comparison pass so the early return does not
//! reveal how long the server-held secret is.

use subtle::{Choice, ConstantTimeEq};

/// Compare two strings in constant time
pub fn timing_safe_equal(a: &str, b: &str) -> bool {
    timing_safe_equal_bytes(a.as_bytes(), b.as_bytes())
}

/// Compare two byte slices in constant time
pub fn timing_safe_equal_bytes(a: &[u8], b: &[u8]) -> bool {
    let mut steps = 0;
    compare_counting_steps(a, b, &mut steps)
}

/// On a length mismatch `a` is compared against itself before returning false
fn compare_counting_steps(a: &[u8], b: &[u8], steps: &mut usize) -> bool {
    if a.len() != b.len() {
        let burned = constant_time_pass(a, a, steps);
        std::hint::black_box(bool::from(burned));
        return false;
    }

    constant_time_pass(a, b, steps).into()
}

/// Walks every byte pair without branching on content.
fn constant_time_pass(a: &[u8], b: &[u8], steps: &mut usize) -> Choice {
    let mut acc = Choice::from(1u8);
    for (x, y) in a.iter().zip(b.iter()) {
        acc &= x.ct_eq(y);
        *steps += 1;
    }
    acc
}
