#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use llm_gateway::test_utils::TEST_ADMIN_KEY;
use serde_json::Value;

/// Proxy request with a bearer key and JSON body.
pub fn proxy_request(path: &str, api_key: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .uri(path)
        .method("POST")
        .header("Authorization", format!("Bearer {api_key}"))
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Admin request authenticated with the test shared secret.
pub fn admin_request(method: &str, path: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder()
        .uri(path)
        .method(method)
        .header("Authorization", format!("Bearer {TEST_ADMIN_KEY}"))
        .header("Content-Type", "application/json");

    match body {
        Some(body) => builder
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Standard chat-completions request body against model `m1`.
pub fn chat_body(model: &str, stream: bool) -> Value {
    serde_json::json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": "Hello"}],
    })
}
