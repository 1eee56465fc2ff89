use alice_iot_link::backoff::{BackoffConfig, BackoffController, BackoffPhase, FixedJitter};
use proptest::prelude::*;
use std::time::Duration;

/// Backoff configuration with initial <= max
fn config_strategy() -> impl Strategy<Value = BackoffConfig> {
    (1u64..5_000, 0u32..8, 0u64..2_000).prop_map(|(initial_ms, doublings, jitter_ms)| {
        BackoffConfig {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(initial_ms << doublings),
            jitter: Duration::from_millis(jitter_ms),
        }
    })
}

proptest! {
    /// Base delays double from the initial delay until they pass the maximum,
    /// then give-up is signaled and stays signaled
    #[test]
    fn test_delays_double_until_give_up(config in config_strategy(), retries in 1usize..4) {
        let mut backoff = BackoffController::with_jitter(config.clone(), FixedJitter(Duration::ZERO));
        backoff.on_disconnect();

        let mut expected = config.initial;
        let mut delays = Vec::new();
        let give_up = loop {
            match backoff.next_delay() {
                Ok(delay) => {
                    prop_assert_eq!(delay, expected);
                    prop_assert!(delay <= config.max);
                    delays.push(delay);
                    expected *= 2;
                }
                Err(give_up) => break give_up,
            }
        };

        prop_assert!(!delays.is_empty());
        prop_assert_eq!(give_up.attempts as usize, delays.len());
        prop_assert!(backoff.state().current_delay > config.max);
        prop_assert_eq!(backoff.phase(), BackoffPhase::Exhausted);

        for _ in 0..retries {
            prop_assert!(backoff.next_delay().is_err());
        }
    }

    /// Random jitter always stays below the configured span
    #[test]
    fn test_jitter_bounds(config in config_strategy()) {
        let mut backoff = BackoffController::new(config.clone());
        backoff.on_disconnect();

        let mut base = config.initial;
        while let Ok(delay) = backoff.next_delay() {
            prop_assert!(delay >= base);
            prop_assert!(delay < base + config.jitter.max(Duration::from_millis(1)));
            base *= 2;
        }
    }

    /// A successful connect always restores the initial delay
    #[test]
    fn test_connect_success_resets(config in config_strategy(), failures in 0usize..12) {
        let mut backoff = BackoffController::with_jitter(config.clone(), FixedJitter(Duration::ZERO));
        backoff.on_disconnect();
        for _ in 0..failures {
            let _ = backoff.next_delay();
        }

        backoff.on_connect_success();
        prop_assert_eq!(backoff.phase(), BackoffPhase::Idle);
        prop_assert_eq!(backoff.next_delay(), Ok(Duration::ZERO));

        backoff.on_disconnect();
        prop_assert_eq!(backoff.next_delay(), Ok(config.initial));
    }
}

#[test]
fn test_default_schedule() {
    let mut backoff = BackoffController::with_jitter(
        BackoffConfig::default(),
        FixedJitter(Duration::from_millis(250)),
    );
    backoff.on_disconnect();

    let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay().ok()).collect();
    let expected: Vec<_> = [1u64, 2, 4, 8, 16, 32]
        .iter()
        .map(|s| Duration::from_secs(*s) + Duration::from_millis(250))
        .collect();
    assert_eq!(delays, expected);
}
