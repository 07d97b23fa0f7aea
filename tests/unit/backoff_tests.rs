//! Unit tests for the reconnect delay computation.

use std::time::Duration;

use agent_runner::stream::backoff::reconnect_delay;

const BASE: Duration = Duration::from_millis(5000);
const CAP: Duration = Duration::from_secs(60);

#[test]
fn first_attempt_uses_base_delay() {
    assert_eq!(reconnect_delay(BASE, CAP, 1), Duration::from_millis(5000));
}

#[test]
fn delay_doubles_per_attempt() {
    assert_eq!(reconnect_delay(BASE, CAP, 2), Duration::from_millis(10_000));
    assert_eq!(reconnect_delay(BASE, CAP, 3), Duration::from_millis(20_000));
    assert_eq!(reconnect_delay(BASE, CAP, 4), Duration::from_millis(40_000));
}

#[test]
fn delay_is_capped() {
    assert_eq!(reconnect_delay(BASE, CAP, 5), CAP);
    assert_eq!(reconnect_delay(BASE, CAP, 6), CAP);
    assert_eq!(reconnect_delay(BASE, CAP, 30), CAP);
}

#[test]
fn sequence_strictly_increases_until_cap() {
    let mut previous = Duration::ZERO;
    for attempt in 1..=5 {
        let delay = reconnect_delay(BASE, CAP, attempt);
        assert!(
            delay > previous || delay == CAP,
            "attempt {attempt}: {delay:?} should exceed {previous:?} or sit at the cap"
        );
        previous = delay;
    }
}

#[test]
fn attempt_zero_is_treated_as_first() {
    assert_eq!(reconnect_delay(BASE, CAP, 0), BASE);
}

#[test]
fn huge_attempt_does_not_overflow() {
    assert_eq!(reconnect_delay(BASE, CAP, u32::MAX), CAP);
}
