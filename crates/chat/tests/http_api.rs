use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use immix_chat::{AppState, router};
use immix_llm::{Fragment, Model, ModelHandle, ScriptedGenerator};
use immix_storage::{
    ConversationId, ConversationStore, MemoryStorage, MessageRole, MessageStore, NewConversation,
};
use immix_wire::{SseDecoder, WireRecord};
use serde_json::{Value, json};
use tower::ServiceExt;

struct Harness {
    store: Arc<MemoryStorage>,
    app: Router,
}

fn harness(generator: ScriptedGenerator) -> Harness {
    let store = Arc::new(MemoryStorage::new());
    let models = Arc::new(
        ModelHandle::new("gpt-4o-mini", vec![Model::from_id("gpt-4o")]).unwrap(),
    );
    let state = AppState::new(store.clone(), Arc::new(generator), models);
    Harness {
        store,
        app: router(state),
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn new_conversation(store: &MemoryStorage) -> ConversationId {
    store
        .create_conversation(NewConversation::new("owner-1", "t"))
        .await
        .unwrap()
        .id
}

fn chat_body(conversation_id: ConversationId) -> Value {
    json!({
        "conversationId": conversation_id.to_string(),
        "messages": [{"role": "user", "content": "Hello"}],
    })
}

#[tokio::test]
async fn chat_streams_event_records_and_persists_the_exchange() {
    let harness = harness(ScriptedGenerator::completing(["Hel", "lo!"]));
    let conversation_id = new_conversation(&harness.store).await;

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/agent/chat",
            chat_body(conversation_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        immix_wire::EVENT_STREAM_CONTENT_TYPE
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let mut decoder = SseDecoder::new();
    let records: Vec<WireRecord> = decoder
        .push(&bytes)
        .into_iter()
        .map(|record| record.unwrap())
        .collect();
    assert_eq!(
        records,
        vec![
            WireRecord::text("Hel"),
            WireRecord::text("lo!"),
            WireRecord::done()
        ]
    );

    // Persistence runs on its own task after the terminal record.
    let mut stored = Vec::new();
    for _ in 0..50 {
        stored = harness.store.list_messages(conversation_id).await.unwrap();
        if stored.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].role, MessageRole::Assistant);
    assert_eq!(stored[1].content, "Hello!");
}

#[tokio::test]
async fn chat_rejects_invalid_requests_with_400() {
    let harness = harness(ScriptedGenerator::completing(["x"]));
    let conversation_id = new_conversation(&harness.store).await;

    let bodies = vec![
        json!({"messages": [{"role": "user", "content": "Hello"}]}),
        json!({
            "conversationId": conversation_id.to_string(),
            "messages": [{"role": "assistant", "content": "Hello"}],
        }),
        json!({"conversationId": 7}),
    ];
    for body in bodies {
        let response = harness
            .app
            .clone()
            .oneshot(json_request("POST", "/api/agent/chat", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
    }

    assert!(
        harness
            .store
            .list_messages(conversation_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn chat_reports_unknown_conversations_and_store_outages() {
    let harness = harness(ScriptedGenerator::completing(["x"]));

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/agent/chat",
            chat_body(ConversationId::new_v7()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let conversation_id = new_conversation(&harness.store).await;
    harness.store.fail_message_writes(Some(MessageRole::User)).await;
    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/agent/chat",
            chat_body(conversation_id),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn conversation_and_message_endpoints_round_trip() {
    let harness = harness(ScriptedGenerator::new(vec![Fragment::Done]));

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/conversations",
            json!({"title": "", "owner": "u1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let conversation = body_json(response).await;
    assert_eq!(conversation["title"], "New Conversation");
    let id = conversation["id"].as_str().unwrap().to_string();

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/messages",
            json!({"conversation": id, "role": "user", "content": "note"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/messages?conversation={id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let messages = body_json(response).await;
    assert_eq!(messages[0]["content"], "note");
    assert_eq!(messages[0]["seq"], 1);

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/api/conversations/{id}"),
            json!({"archived": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["archived"], true);

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/conversations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn messages_require_a_valid_conversation_parameter() {
    let harness = harness(ScriptedGenerator::new(vec![Fragment::Done]));

    for uri in ["/api/messages", "/api/messages?conversation=C1"] {
        let response = harness
            .app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn models_can_be_listed_and_switched() {
    let harness = harness(ScriptedGenerator::new(vec![Fragment::Done]));

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/models/switch",
            json!({"model": "gpt-4o"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["current"], "gpt-4o");

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/models/switch",
            json!({"model": "unknown"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .app
        .clone()
        .oneshot(Request::builder().uri("/api/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let models = body_json(response).await;
    assert_eq!(models["current"], "gpt-4o");
    assert_eq!(models["models"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn health_answers_ok() {
    let harness = harness(ScriptedGenerator::new(vec![Fragment::Done]));
    let response = harness
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}
