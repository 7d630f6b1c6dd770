//! Integration tests for the retry wrapper.

use agent_relay::retry::{RetryPolicy, RetryProvider};
use agent_relay::{
    Capabilities, Error, Event, Message, Provider, RateLimitInfo, Request, Result,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails `failures` times with the given error, then streams "hello".
struct FlakyProvider {
    failures: u32,
    attempts: AtomicU32,
    error: Box<dyn Fn() -> Error + Send + Sync>,
}

impl FlakyProvider {
    fn rate_limited(failures: u32, retry_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            failures,
            attempts: AtomicU32::new(0),
            error: Box::new(move || {
                Error::rate_limit(
                    "slow down",
                    RateLimitInfo {
                        retry_after: Some(retry_after),
                        plan: Some("pro".to_string()),
                        used_percent: Some(100.0),
                    },
                )
            }),
        })
    }
}

#[async_trait]
impl Provider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn stream(&self, _request: Request) -> Result<agent_relay::EventStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err((self.error)());
        }
        Ok(agent_relay::spawn_stream(8, |sink| async move {
            sink.send(Event::TextDelta("hello".to_string())).await;
            Ok(())
        }))
    }
}

#[tokio::test]
async fn rate_limit_retried_with_event_first() {
    let inner = FlakyProvider::rate_limited(1, Duration::from_millis(30));
    let wrapped = RetryProvider::new(inner.clone());

    let mut stream = wrapped
        .stream(Request::new("m", vec![Message::user("hi")]))
        .await
        .expect("retryable failure should still yield a stream");

    let mut events = Vec::new();
    while let Some(item) = stream.recv().await {
        events.push(item.unwrap());
    }

    // The retry event precedes every event of the retried attempt.
    match &events[0] {
        Event::Retry { attempt, wait, .. } => {
            assert_eq!(*attempt, 1);
            assert_eq!(*wait, Duration::from_millis(30));
        }
        other => panic!("expected retry event first, got {other:?}"),
    }
    assert_eq!(events[1], Event::TextDelta("hello".to_string()));
    assert_eq!(inner.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn attempts_exhaust_into_final_error() {
    let inner = FlakyProvider::rate_limited(10, Duration::from_millis(1));
    let wrapped = RetryProvider::with_policy(
        inner.clone(),
        RetryPolicy::new().with_max_attempts(3),
    );

    let mut stream = wrapped
        .stream(Request::new("m", vec![Message::user("hi")]))
        .await
        .unwrap();

    let mut last = None;
    let mut retries = 0;
    while let Some(item) = stream.recv().await {
        match item {
            Ok(Event::Retry { .. }) => retries += 1,
            Ok(_) => {}
            Err(e) => last = Some(e),
        }
    }
    assert_eq!(retries, 2);
    assert!(matches!(last, Some(Error::RateLimit { .. })));
    assert_eq!(inner.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn auth_errors_are_never_retried() {
    struct AuthFail(AtomicU32);

    #[async_trait]
    impl Provider for AuthFail {
        fn name(&self) -> &str {
            "authfail"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn stream(&self, _request: Request) -> Result<agent_relay::EventStream> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::auth("token expired"))
        }
    }

    let inner = Arc::new(AuthFail(AtomicU32::new(0)));
    let wrapped = RetryProvider::new(inner.clone());
    let outcome = wrapped
        .stream(Request::new("m", vec![Message::user("hi")]))
        .await;

    assert!(matches!(outcome, Err(Error::Auth(_))));
    assert_eq!(inner.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn long_reset_hint_fails_fast() {
    let inner = FlakyProvider::rate_limited(1, Duration::from_secs(3600));
    let wrapped = RetryProvider::new(inner.clone());

    let outcome = wrapped
        .stream(Request::new("m", vec![Message::user("hi")]))
        .await;
    let error = outcome.err().expect("should fail fast");
    assert!(error.to_string().contains("giving up"));
    assert_eq!(inner.attempts.load(Ordering::SeqCst), 1);
}
