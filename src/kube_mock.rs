//! Scripted Kubernetes API server for unit tests.

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::Client;
use serde_json::json;

pub(crate) type ApiHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// A client whose requests are answered through the returned handle.
pub(crate) fn mock_client() -> (Client, ApiHandle) {
    let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), handle)
}

/// Answer the next request after checking its method and path. Returns the
/// request body.
pub(crate) async fn answer(
    api: &mut ApiHandle,
    method: Method,
    path: &str,
    status: StatusCode,
    body: Vec<u8>,
) -> Vec<u8> {
    let (request, send) = api.next_request().await.expect("client sent no request");
    assert_eq!(request.method(), &method);
    assert_eq!(request.uri().path(), path);

    let sent = request.into_body().collect_bytes().await.unwrap().to_vec();
    send.send_response(Response::builder().status(status).body(Body::from(body)).unwrap());
    sent
}

/// A `Status` failure body as the API server sends it.
pub(crate) fn status_body(code: u16, reason: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{reason} (test)"),
        "reason": reason,
        "code": code,
    }))
    .unwrap()
}
