mod common;

use axum::http::StatusCode;
use common::{body_json, chat_body, proxy_request};
use llm_gateway::storage::Store;
use llm_gateway::test_utils::{TestServer, TestServerBuilder, account, api_key, model_cost};
use rust_decimal::Decimal;
use serde_json::json;
use tower::ServiceExt;

async fn seeded_server() -> TestServer {
    let server = TestServerBuilder::new().build().await;
    server
        .seed_account(&account("u1", Decimal::from(10), Decimal::ZERO))
        .await;
    server.seed_api_key(&api_key("sk-A", "u1")).await;
    server.seed_model_cost(&model_cost("m1", 3, 15, 0, 0)).await;
    server
}

#[tokio::test]
async fn test_happy_path_unary_debits_and_logs() {
    let server = seeded_server().await;
    server.openai.push_unary(
        StatusCode::OK,
        json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500},
        }),
    );

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Upstream body is relayed verbatim.
    let body = body_json(response).await;
    assert_eq!(body["id"], "chatcmpl-1");

    let account = server.store.get_account("u1").await.unwrap().unwrap();
    assert_eq!(account.spent_usd, "0.0105".parse::<Decimal>().unwrap());

    let logs = server.store.usage_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].cost_usd, "0.0105".parse::<Decimal>().unwrap());
    assert_eq!(logs[0].total_tokens, 1500);
    assert_eq!(logs[0].request_endpoint, "/v1/chat/completions");
    assert!(!logs[0].pricing_missing);
    assert_eq!(server.openai.call_count(), 1);
}

#[tokio::test]
async fn test_budget_denial_short_circuits() {
    let server = TestServerBuilder::new().build().await;
    server
        .seed_account(&account("u1", Decimal::from(10), Decimal::from(10)))
        .await;
    server.seed_api_key(&api_key("sk-A", "u1")).await;
    server.seed_model_cost(&model_cost("m1", 3, 15, 0, 0)).await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "budget_exceeded");

    // No dispatch, no debit, no audit row.
    assert_eq!(server.openai.call_count(), 0);
    let account = server.store.get_account("u1").await.unwrap().unwrap();
    assert_eq!(account.spent_usd, Decimal::from(10));
    assert!(server.store.usage_logs().await.is_empty());
}

#[tokio::test]
async fn test_zero_budget_is_default_deny() {
    let server = TestServerBuilder::new().build().await;
    server
        .seed_account(&account("u1", Decimal::ZERO, Decimal::ZERO))
        .await;
    server.seed_api_key(&api_key("sk-A", "u1")).await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(server.openai.call_count(), 0);
}

#[tokio::test]
async fn test_missing_pricing_logs_without_debit() {
    let server = seeded_server().await;
    server.openai.push_unary(
        StatusCode::OK,
        json!({
            "id": "chatcmpl-2",
            "usage": {"prompt_tokens": 100, "completion_tokens": 50},
        }),
    );

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m-unknown", false),
        ))
        .await
        .unwrap();

    // The call already happened; the client still gets the body.
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "chatcmpl-2");

    let account = server.store.get_account("u1").await.unwrap().unwrap();
    assert_eq!(account.spent_usd, Decimal::ZERO);

    let logs = server.store.usage_logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].pricing_missing);
    assert_eq!(logs[0].cost_usd, Decimal::ZERO);
    assert_eq!(logs[0].total_tokens, 150);
}

#[tokio::test]
async fn test_missing_authorization_header() {
    let server = seeded_server().await;

    let request = axum::http::Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(chat_body("m1", false).to_string()))
        .unwrap();

    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.openai.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_api_key() {
    let server = seeded_server().await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-nope",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.openai.call_count(), 0);
}

#[tokio::test]
async fn test_inactive_api_key_never_dispatches() {
    let server = seeded_server().await;
    let mut key = api_key("sk-B", "u1");
    key.is_active = false;
    server.seed_api_key(&key).await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-B",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.openai.call_count(), 0);
    assert!(server.store.usage_logs().await.is_empty());
}

#[tokio::test]
async fn test_inactive_account_never_dispatches() {
    let server = TestServerBuilder::new().build().await;
    let mut disabled = account("u1", Decimal::from(10), Decimal::ZERO);
    disabled.is_active = false;
    server.seed_account(&disabled).await;
    server.seed_api_key(&api_key("sk-A", "u1")).await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(server.openai.call_count(), 0);
}

#[tokio::test]
async fn test_orphaned_api_key_is_forbidden() {
    let server = TestServerBuilder::new().build().await;
    server.seed_api_key(&api_key("sk-A", "u-missing")).await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_model_restriction_enforced() {
    let server = seeded_server().await;
    let mut key = api_key("sk-R", "u1");
    key.allowed_models = Some(vec!["m2".to_string()]);
    server.seed_api_key(&key).await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-R",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "model_forbidden");
    assert_eq!(server.openai.call_count(), 0);

    // The same key may use its allowed model.
    server.seed_model_cost(&model_cost("m2", 1, 1, 0, 0)).await;
    server.openai.push_unary(
        StatusCode::OK,
        json!({"usage": {"prompt_tokens": 1, "completion_tokens": 1}}),
    );
    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-R",
            &chat_body("m2", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upstream_error_passes_through_without_settlement() {
    let server = seeded_server().await;
    server.openai.push_unary(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "rate limited", "type": "rate_limit_error"}}),
    );

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();

    // Status and body framing are preserved for native SDKs.
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");

    let account = server.store.get_account("u1").await.unwrap().unwrap();
    assert_eq!(account.spent_usd, Decimal::ZERO);
    assert!(server.store.usage_logs().await.is_empty());
}

#[tokio::test]
async fn test_upstream_unavailable_maps_to_502() {
    let server = seeded_server().await;
    server.openai.push_unavailable();

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "upstream_unavailable");
    assert!(server.store.usage_logs().await.is_empty());
}

#[tokio::test]
async fn test_invalid_json_body() {
    let server = seeded_server().await;

    let request = axum::http::Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("Authorization", "Bearer sk-A")
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from("not json"))
        .unwrap();

    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.openai.call_count(), 0);
}

#[tokio::test]
async fn test_missing_model_field() {
    let server = seeded_server().await;

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/chat/completions",
            "sk-A",
            &json!({"stream": false, "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_anthropic_endpoint_routes_to_anthropic_adapter() {
    let server = seeded_server().await;
    server.anthropic.push_unary(
        StatusCode::OK,
        json!({
            "id": "msg_1",
            "content": [{"type": "text", "text": "hi"}],
            "usage": {"input_tokens": 200, "output_tokens": 800},
        }),
    );

    let response = server
        .app()
        .oneshot(proxy_request(
            "/v1/messages",
            "sk-A",
            &chat_body("m1", false),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.anthropic.call_count(), 1);
    assert_eq!(server.openai.call_count(), 0);

    let account = server.store.get_account("u1").await.unwrap().unwrap();
    assert_eq!(account.spent_usd, "0.0126".parse::<Decimal>().unwrap());

    let logs = server.store.usage_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].request_endpoint, "/v1/messages");
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServerBuilder::new().build().await;

    let request = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["checks"]["store"].is_object());
    assert!(body["checks"]["bus"].is_object());
}

#[tokio::test]
async fn test_request_id_header_is_echoed() {
    let server = TestServerBuilder::new().build().await;

    let request = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = server.app().oneshot(request).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
