//! Shared time budget helpers for bounded waits.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("deadline elapsed"));
    }
    Ok(remaining)
}

/// Sleep for `interval`, or less if the deadline is closer. False once the deadline passed.
pub fn sleep_within(deadline: Instant, interval: Duration) -> bool {
    match remaining_budget(deadline) {
        Ok(remaining) => {
            std::thread::sleep(interval.min(remaining));
            true
        }
        Err(_) => false,
    }
}
