use aegis_modularity::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
use chrono::{Duration, Utc};

/// Five consecutive `BackendUnavailable`-shaped failures within the window
/// open the breaker; the next call is rejected without invoking the
/// backend; after cooldown a probe succeeds and the breaker closes.
#[tokio::test]
async fn five_failures_open_breaker_then_recovers() {
    let breaker = CircuitBreaker::new(
        "exchange",
        BreakerConfig {
            failure_threshold: 5,
            rolling_window: Duration::seconds(60),
            cooldown: Duration::seconds(30),
            success_threshold: 1,
        },
    );
    let t0 = Utc::now();
    let mut backend_invocations = 0;

    for i in 0..5 {
        let result: Result<(), BreakerError<&str>> = breaker
            .call(t0 + Duration::seconds(i), || async {
                backend_invocations += 1;
                Err("backend_unavailable")
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let blocked: Result<(), BreakerError<&str>> = breaker
        .call(t0 + Duration::seconds(6), || async {
            backend_invocations += 1;
            Ok(())
        })
        .await;
    assert!(matches!(blocked, Err(BreakerError::Open)));
    assert_eq!(backend_invocations, 5, "blocked call must not reach the backend");

    let probe_time = t0 + Duration::seconds(31);
    let probe: Result<(), BreakerError<&str>> = breaker.call(probe_time, || async { Ok(()) }).await;
    assert!(probe.is_ok());
    assert_eq!(breaker.state(), BreakerState::Closed);
}
