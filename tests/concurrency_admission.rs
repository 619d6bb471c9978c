mod common;

use common::{request_from, Downstream};
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneSyncService;
use tower::{service_fn, Layer, ServiceExt};
use turnstile::prelude::*;

/// Downstream that signals `entered` and then holds its slot until `gate` is notified.
fn gated(entered: Arc<Notify>, gate: Arc<Notify>) -> Downstream {
    BoxCloneSyncService::new(service_fn(move |_req: Request<String>| {
        let entered = entered.clone();
        let gate = gate.clone();
        async move {
            entered.notify_one();
            gate.notified().await;
            Ok::<_, Infallible>(Response::new(String::from("done")))
        }
    }))
}

fn concurrency_layer(pool: SemaphorePool, timeout: Duration) -> AdmissionLayer {
    AdmissionLayer::builder()
        .concurrency(ConcurrencyAdmissionService::new(pool).with_acquire_timeout(timeout))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn second_request_is_rejected_while_first_holds_the_only_slot() {
    let (entered, gate) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let pool = SemaphorePool::new(1).unwrap();
    let svc = concurrency_layer(pool.clone(), Duration::from_millis(50))
        .layer(gated(entered.clone(), gate.clone()));

    let first = tokio::spawn(svc.clone().oneshot(request_from("10.0.0.1:1")));
    entered.notified().await;
    assert_eq!(pool.in_flight(), 1);

    let second = svc.clone().oneshot(request_from("10.0.0.2:1")).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(second.body(), "Service Unavailable\n");

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(pool.available(), 1, "slot returns to the pool once the first request completes");

    // With the slot free again a new request is admitted.
    gate.notify_one();
    let third = svc.oneshot(request_from("10.0.0.3:1")).await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn waiter_is_admitted_when_a_slot_frees_before_the_timeout() {
    let (entered, gate) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let pool = SemaphorePool::new(1).unwrap();
    let svc = concurrency_layer(pool, Duration::from_secs(5))
        .layer(gated(entered.clone(), gate.clone()));

    let first = tokio::spawn(svc.clone().oneshot(request_from("10.0.0.1:1")));
    entered.notified().await;

    let second = tokio::spawn(svc.oneshot(request_from("10.0.0.2:1")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();
    assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);

    entered.notified().await;
    gate.notify_one();
    assert_eq!(second.await.unwrap().unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn cancellation_extension_releases_a_queued_request() {
    let (entered, gate) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let pool = SemaphorePool::new(1).unwrap();
    let svc = AdmissionLayer::builder()
        .concurrency(ConcurrencyAdmissionService::new(pool.clone()))
        .build()
        .unwrap()
        .layer(gated(entered.clone(), gate.clone()));

    let first = tokio::spawn(svc.clone().oneshot(request_from("10.0.0.1:1")));
    entered.notified().await;

    let shutdown = CancellationToken::new();
    let mut queued = request_from("10.0.0.2:1");
    queued.extensions_mut().insert(shutdown.clone());
    let second = tokio::spawn(svc.oneshot(queued));

    tokio::task::yield_now().await;
    shutdown.cancel();
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(pool.in_flight(), 1, "cancelled waiter must not hold a slot");

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn custom_concurrency_reject_status() {
    let (entered, gate) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let svc = AdmissionLayer::builder()
        .concurrency(
            ConcurrencyAdmissionService::new(SemaphorePool::new(1).unwrap())
                .with_acquire_timeout(Duration::from_millis(1)),
        )
        .concurrency_reject_status(StatusCode::TOO_MANY_REQUESTS)
        .build()
        .unwrap()
        .layer(gated(entered.clone(), gate.clone()));

    let first = tokio::spawn(svc.clone().oneshot(request_from("10.0.0.1:1")));
    entered.notified().await;

    let second = svc.oneshot(request_from("10.0.0.2:1")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().get(http::header::RETRY_AFTER).is_none());

    gate.notify_one();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn slot_is_released_when_downstream_fails() {
    let pool = SemaphorePool::new(1).unwrap();
    let svc = concurrency_layer(pool.clone(), Duration::from_millis(10)).layer(service_fn(
        |_req: Request<String>| async { Err::<Response<String>, _>(std::io::Error::other("upstream reset")) },
    ));

    let err = svc.clone().oneshot(request_from("10.0.0.1:1")).await.unwrap_err();
    assert_eq!(err.to_string(), "upstream reset");
    assert_eq!(pool.available(), 1);

    // A second failure proves the slot really came back.
    assert!(svc.oneshot(request_from("10.0.0.1:1")).await.is_err());
}

#[tokio::test]
async fn slot_is_released_when_downstream_panics() {
    let pool = SemaphorePool::new(1).unwrap();
    let svc = concurrency_layer(pool.clone(), Duration::from_millis(10)).layer(service_fn(
        |_req: Request<String>| async {
            if true {
                panic!("handler bug");
            }
            Ok::<_, Infallible>(Response::new(String::new()))
        },
    ));

    let outcome = tokio::spawn(svc.oneshot(request_from("10.0.0.1:1"))).await;
    assert!(outcome.unwrap_err().is_panic());
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn dropped_request_future_releases_its_slot() {
    let (entered, gate) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let pool = SemaphorePool::new(1).unwrap();
    let svc = concurrency_layer(pool.clone(), Duration::from_secs(1))
        .layer(gated(entered.clone(), gate));

    let abandoned = tokio::spawn(svc.oneshot(request_from("10.0.0.1:1")));
    entered.notified().await;
    assert_eq!(pool.in_flight(), 1);

    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());
    assert_eq!(pool.available(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_rejection_releases_the_concurrency_slot() {
    let pool = SemaphorePool::new(1).unwrap();
    let svc = AdmissionLayer::builder()
        .concurrency(ConcurrencyAdmissionService::new(pool.clone()))
        .rate_limit(RateDecisionService::new(MemoryLimiterStore::new(0.02, 1).unwrap()))
        .build()
        .unwrap()
        .layer(common::counting_ok(Arc::default()));

    assert_eq!(svc.clone().oneshot(request_from("10.0.0.1:1")).await.unwrap().status(), StatusCode::OK);
    for _ in 0..3 {
        let res = svc.clone().oneshot(request_from("10.0.0.1:1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(pool.available(), 1);
    }
}
