// File: tests/gateway_scenarios.rs
use bilan_gateway::core::error::{GatewayError, ProviderError};
use bilan_gateway::gateway::{Gateway, RateLimitPolicy};
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn make_gateway(max_concurrency: usize) -> Arc<Gateway<String>> {
    Arc::new(Gateway::with_policy(
        RateLimitPolicy::default(),
        max_concurrency,
        Duration::from_secs(5),
    ))
}

fn quota_error() -> ProviderError {
    ProviderError::from_json(
        &json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED"}}),
        None,
    )
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Start(usize),
    End(usize),
}

#[tokio::test(start_paused = true)]
async fn test_five_jobs_two_slots() {
    let gw = make_gateway(2);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    for i in 1..=5usize {
        let gw = Arc::clone(&gw);
        let events = Arc::clone(&events);
        handles.push(tokio::spawn(async move {
            gw.call(
                move || {
                    let events = Arc::clone(&events);
                    async move {
                        events.lock().unwrap().push(Event::Start(i));
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        events.lock().unwrap().push(Event::End(i));
                        Ok(format!("job-{}", i))
                    }
                },
                &format!("distinct prompt {}", i),
                "gemini-1.5-flash",
                "questions",
            )
            .await
        }));
        tokio::task::yield_now().await;
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = gw.metrics();
    assert_eq!(snapshot.in_flight, 2);
    assert_eq!(snapshot.queue_length, 3);

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), format!("job-{}", i + 1));
    }

    let events = events.lock().unwrap().clone();
    let job5_start = events.iter().position(|e| *e == Event::Start(5)).unwrap();
    let first_end = events
        .iter()
        .position(|e| matches!(e, Event::End(1) | Event::End(2)))
        .unwrap();
    assert!(first_end < job5_start, "events: {:?}", events);

    let mut running = 0i32;
    for e in &events {
        match e {
            Event::Start(_) => running += 1,
            Event::End(_) => running -= 1,
        }
        assert!(running <= 2, "events: {:?}", events);
    }
    assert_eq!(gw.metrics().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_twice_then_ok() {
    let gw = make_gateway(2);
    let attempts = Arc::new(AtomicU32::new(0));
    let a = Arc::clone(&attempts);

    let result = gw
        .call(
            move || {
                let n = a.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(quota_error())
                    } else {
                        Ok("ok".to_string())
                    }
                }
            },
            "Génère la synthèse du profil",
            "gemini-1.5-flash",
            "synthesis",
        )
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let metrics = gw.metrics();
    assert_eq!(metrics.rate_limit_count, 2);
    assert_eq!(metrics.errors_by_operation.get("synthesis"), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_always_rate_limited_exhausts() {
    let gw = make_gateway(2);
    let attempts = Arc::new(AtomicU32::new(0));
    let a = Arc::clone(&attempts);

    let err = gw
        .call(
            move || {
                a.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>(quota_error()) }
            },
            "prompt",
            "gemini-1.5-flash",
            "questions",
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(err.code(), Some(429));
    assert!(err.retried());
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_not_retried() {
    let gw = make_gateway(2);
    let attempts = Arc::new(AtomicU32::new(0));
    let a = Arc::clone(&attempts);

    let err = gw
        .call(
            move || {
                a.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<String, _>(ProviderError::from_json(
                        &json!({"error": {"code": 401, "status": "UNAUTHENTICATED", "message": "bad key"}}),
                        None,
                    ))
                }
            },
            "prompt",
            "gemini-1.5-flash",
            "questions",
        )
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(err, GatewayError::Provider(ProviderError::Auth { .. })));
    assert_eq!(gw.metrics().rate_limit_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicates_share_one_execution() {
    let gw = make_gateway(2);
    let invocations = Arc::new(AtomicU32::new(0));

    let call = |suffix: &'static str| {
        let gw = Arc::clone(&gw);
        let invocations = Arc::clone(&invocations);
        async move {
            // Same model and same first 100 characters
            let prompt = format!("{}{}", "x".repeat(100), suffix);
            gw.call(
                move || {
                    let invocations = Arc::clone(&invocations);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(format!("answer{}", suffix))
                    }
                },
                &prompt,
                "gemini-1.5-flash",
                "questions",
            )
            .await
        }
    };

    let (a, b) = tokio::join!(call("-a"), call("-b"));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), "answer-a");
    assert_eq!(b.unwrap(), "answer-a");
}

#[tokio::test(start_paused = true)]
async fn test_duplicates_outside_window_run_twice() {
    let gw = make_gateway(2);
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let inv = Arc::clone(&invocations);
        gw.call(
            move || {
                let inv = Arc::clone(&inv);
                async move {
                    inv.fetch_add(1, Ordering::SeqCst);
                    Ok("same".to_string())
                }
            },
            "identical prompt",
            "gemini-1.5-flash",
            "questions",
        )
        .await
        .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delay_follows_hint() {
    let gw = make_gateway(1);
    let stamps = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let s = Arc::clone(&stamps);

    let result = gw
        .call(
            move || {
                let first = {
                    let mut s = s.lock().unwrap();
                    s.push(Instant::now());
                    s.len() == 1
                };
                async move {
                    if first {
                        Err(ProviderError::from_json(
                            &json!({"error": {
                                "code": 429,
                                "details": [{
                                    "@type": "type.googleapis.com/google.rpc.RetryInfo",
                                    "retryDelay": "2s"
                                }]
                            }}),
                            None,
                        ))
                    } else {
                        Ok("late".to_string())
                    }
                }
            },
            "prompt",
            "gemini-1.5-flash",
            "synthesis",
        )
        .await;

    assert_eq!(result.unwrap(), "late");
    let stamps = stamps.lock().unwrap();
    let waited = stamps[1] - stamps[0];
    assert!(waited >= Duration::from_secs(2), "waited {:?}", waited);
    assert!(waited <= Duration::from_millis(3_001), "waited {:?}", waited);
    assert_eq!(gw.metrics().last_retry_after_ms, Some(2_000));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_caller_frees_queue() {
    let gw = make_gateway(1);
    let ran = Arc::new(AtomicUsize::new(0));

    let blocker = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move {
            gw.call(
                || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok("blocker".to_string())
                },
                "first",
                "gemini-1.5-flash",
                "questions",
            )
            .await
        })
    };
    tokio::task::yield_now().await;

    let cancel = CancellationToken::new();
    let waiter = {
        let gw = Arc::clone(&gw);
        let cancel = cancel.clone();
        let ran = Arc::clone(&ran);
        tokio::spawn(async move {
            gw.call_with_cancel(
                move || {
                    let ran = Arc::clone(&ran);
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok("waiter".to_string())
                    }
                },
                "second",
                "gemini-1.5-flash",
                "questions",
                &cancel,
            )
            .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(gw.metrics().queue_length, 1);

    cancel.cancel();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(GatewayError::Cancelled { .. })
    ));
    assert_eq!(gw.metrics().queue_length, 0);
    assert_eq!(blocker.await.unwrap().unwrap(), "blocker");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_backoff() {
    let gw = make_gateway(1);

    let retrying = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move {
            gw.call(
                || async { Err::<String, _>(ProviderError::rate_limited("quota", Some(5_000))) },
                "prompt",
                "gemini-1.5-flash",
                "synthesis",
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    gw.shutdown();
    assert!(matches!(
        retrying.await.unwrap(),
        Err(GatewayError::Cancelled { .. })
    ));
    assert_eq!(gw.metrics().in_flight, 0);
}
