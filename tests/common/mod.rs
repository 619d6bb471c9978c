#![allow(dead_code)]

use http::{Request, Response};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::service_fn;
use tower::util::BoxCloneSyncService;
use turnstile::RemoteAddr;

pub const PATH: &str = "http://example/showTela";

/// A GET request arriving from `remote`.
pub fn request_from(remote: &str) -> Request<String> {
    Request::builder()
        .uri(PATH)
        .extension(RemoteAddr(remote.to_string()))
        .body(String::new())
        .unwrap()
}

/// A GET request carrying `X-Api-Key: key`, all from the same peer.
pub fn request_with_api_key(key: &str) -> Request<String> {
    Request::builder()
        .uri(PATH)
        .header("X-Api-Key", key)
        .extension(RemoteAddr("10.0.0.1:1234".to_string()))
        .body(String::new())
        .unwrap()
}

pub type Downstream = BoxCloneSyncService<Request<String>, Response<String>, Infallible>;

/// Downstream that answers `200 ok` and counts calls.
pub fn counting_ok(calls: Arc<AtomicUsize>) -> Downstream {
    BoxCloneSyncService::new(service_fn(move |_req: Request<String>| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(Response::new(String::from("ok")))
        }
    }))
}
