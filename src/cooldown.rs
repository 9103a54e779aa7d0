//! Wall-clock cooldown after a rate-limit detection.
//!
//! The finish time is computed once as `now + wait_secs`; each lap
//! re-reads the system clock and sleeps at most 60 seconds. Counting down
//! a decremented remainder would drift across system sleeps and suspend
//! cycles; re-reading the clock cannot.

use std::time::{Duration, SystemTime};

use crate::errors::CooldownError;

/// Longest single sleep chunk.
const SLEEP_CHUNK_SECS: u64 = 60;

/// Sleep until wall-clock time has advanced by `wait_secs`.
///
/// `wait_cycle` is the zero-based count of cooldowns already taken this
/// run; it must be strictly below `max_cycles` or the cooldown fails
/// terminally. A zero wait returns immediately.
pub async fn wait_for_rate_limit_reset(
    wait_secs: u64,
    wait_cycle: u32,
    max_cycles: u32,
) -> Result<(), CooldownError> {
    if wait_cycle >= max_cycles {
        return Err(CooldownError::WaitCyclesExhausted {
            cycle: wait_cycle,
            max: max_cycles,
        });
    }
    if wait_secs == 0 {
        return Ok(());
    }

    let target = SystemTime::now() + Duration::from_secs(wait_secs);
    tracing::info!(
        wait_secs,
        wait_cycle,
        max_cycles,
        "rate limited, cooling down"
    );
    sleep_until_wall_clock(target).await;
    tracing::info!("cooldown finished");
    Ok(())
}

/// Chunked sleep toward an absolute wall-clock target.
///
/// Successive calls with the same target converge on the same finish
/// time regardless of how many chunks each slept.
pub async fn sleep_until_wall_clock(target: SystemTime) {
    loop {
        let remaining = match target.duration_since(SystemTime::now()) {
            Ok(d) if !d.is_zero() => d,
            _ => return,
        };
        let minutes = (remaining.as_secs() + 59) / 60;
        tracing::info!(minutes_remaining = minutes, "cooldown countdown");
        let chunk = remaining.min(Duration::from_secs(SLEEP_CHUNK_SECS));
        tokio::time::sleep(chunk).await;
    }
}
