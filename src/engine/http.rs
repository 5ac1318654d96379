// ── Intercessio Engine: HTTP & Reconnect Helpers ───────────────────────────
// Shared utilities for the notifier and the relay WebSocket loops:
//   • One lazily built reqwest client with sane timeouts
//   • Bridge reconnect helper with escalating backoff + jitter + cap

use std::sync::OnceLock;
use std::time::Duration;

// ── Constants ──────────────────────────────────────────────────────────────

/// Initial relay reconnect delay in milliseconds (doubles each attempt).
const INITIAL_RECONNECT_DELAY_MS: u64 = 1_000;

/// Maximum relay reconnect delay cap in milliseconds (5 minutes).
const MAX_RECONNECT_DELAY_MS: u64 = 300_000;

/// Outbound HTTP request timeout.
const HTTP_TIMEOUT_SECS: u64 = 10;

// ── Shared client ──────────────────────────────────────────────────────────

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

pub fn shared_client() -> &'static reqwest::Client {
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .unwrap_or_default()
    })
}

// ── Reconnect backoff ──────────────────────────────────────────────────────

/// Compute the escalating reconnect delay for `attempt` (0-based), with
/// ±25% jitter so a fleet of relay loops does not thunder in lockstep.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = INITIAL_RECONNECT_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt.min(16)));
    let capped_ms = base_ms.min(MAX_RECONNECT_DELAY_MS);
    Duration::from_millis(apply_jitter(capped_ms))
}

fn apply_jitter(delay_ms: u64) -> u64 {
    let jitter_range = delay_ms / 4;
    if jitter_range == 0 {
        return delay_ms;
    }
    let offset = rand::random::<u64>() % (jitter_range * 2);
    delay_ms - jitter_range + offset
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_escalates_and_caps() {
        let first = reconnect_delay(0).as_millis() as u64;
        assert!((750..=1_250).contains(&first));

        let capped = reconnect_delay(30).as_millis() as u64;
        assert!(capped <= MAX_RECONNECT_DELAY_MS + MAX_RECONNECT_DELAY_MS / 4);
        assert!(capped >= MAX_RECONNECT_DELAY_MS - MAX_RECONNECT_DELAY_MS / 4);
    }
}
