//! Shared backoff schedule for transient failures: exponential from one
//! second, capped at thirty, with up to 250ms of jitter so parallel workers
//! do not stampede the server in lockstep.

use std::time::Duration;

use rand::Rng;

const BASE: Duration = Duration::from_secs(1);
const CAP: Duration = Duration::from_secs(30);

pub fn jittered_backoff(attempt: u32) -> Duration {
    let exp = BASE.saturating_mul(1u32 << attempt.min(5));
    let capped = exp.min(CAP);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = jittered_backoff(0);
        assert!(first >= Duration::from_secs(1));
        assert!(first < Duration::from_secs(2));

        let late = jittered_backoff(12);
        assert!(late >= Duration::from_secs(30));
        assert!(late < Duration::from_secs(31));
    }
}
