use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use parley_api::attachments::AttachmentStore;
use parley_api::index::IndexConfig;
use parley_api::profiles::SqliteProfileDirectory;
use parley_api::{AppState, AppStateInner, router};
use parley_db::Database;
use parley_gateway::Hub;
use parley_types::api::Claims;
use parley_types::events::ServerEvent;

const SECRET: &str = "integration-test-secret";

struct TestApp {
    app: Router,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let state: AppState = Arc::new(AppStateInner {
            db: db.clone(),
            hub: Hub::default(),
            profiles: Arc::new(SqliteProfileDirectory::new(db)),
            attachments: AttachmentStore::new(
                std::env::temp_dir().join(format!("parley-http-{}", Uuid::new_v4())),
                "http://parley.test",
            ),
            jwt_secret: SECRET.into(),
            index: IndexConfig::default(),
        });
        Self {
            app: router(state.clone()),
            state,
        }
    }

    async fn call(&self, method: Method, uri: &str, user: Option<Uuid>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token_for(user)));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn send(&self, from: Uuid, to: Uuid, text: &str) -> Value {
        let (status, body) = self
            .call(
                Method::POST,
                &format!("/conversations/{}/messages", to),
                Some(from),
                Some(json!({ "content": { "type": "text", "text": text } })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body
    }

    async fn conversations(&self, viewer: Uuid) -> Vec<Value> {
        let (status, body) = self.call(Method::GET, "/conversations", Some(viewer), None).await;
        assert_eq!(status, StatusCode::OK);
        body["conversations"].as_array().cloned().unwrap_or_default()
    }
}

fn token_for(user: Uuid) -> String {
    let claims = Claims {
        sub: user,
        username: format!("user-{}", &user.to_string()[..8]),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

#[tokio::test]
async fn thread_list_and_read_scenario() {
    let t = TestApp::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    t.send(a, b, "hi").await;
    let hello = t.send(b, a, "hello").await;

    let (status, thread) = t
        .call(Method::GET, &format!("/conversations/{}/messages", b), Some(a), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let texts: Vec<&str> = thread
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"]["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["hi", "hello"]);

    let list = t.conversations(a).await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["last_message"]["content"]["text"], "hello");
    assert_eq!(list[0]["unread_count"], 1);

    let (status, body) = t
        .call(
            Method::POST,
            "/messages/read",
            Some(a),
            Some(json!({ "message_ids": [hello["id"]] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 1);
    assert_eq!(t.conversations(a).await[0]["unread_count"], 0);
}

#[tokio::test]
async fn hide_is_private_and_new_traffic_resurfaces() {
    let t = TestApp::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    t.send(b, a, "are you there").await;

    let (status, _) = t
        .call(Method::POST, &format!("/conversations/{}/hide", b), Some(a), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(t.conversations(a).await.is_empty());

    // B is unaffected and can keep writing.
    assert_eq!(t.conversations(b).await.len(), 1);
    t.send(b, a, "hello?").await;

    let list = t.conversations(a).await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["last_message"]["content"]["text"], "hello?");
    assert_eq!(list[0]["unread_count"], 2);
    assert_eq!(list[0]["is_hidden_for_viewer"], false);
}

#[tokio::test]
async fn archive_view_and_unhide() {
    let t = TestApp::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    t.send(a, b, "bye").await;
    t.call(Method::POST, &format!("/conversations/{}/hide", b), Some(a), None)
        .await;

    let (_, archive) = t
        .call(Method::GET, "/conversations?include_hidden=true", Some(a), None)
        .await;
    assert_eq!(archive["conversations"][0]["is_hidden_for_viewer"], true);

    let (status, _) = t
        .call(Method::DELETE, &format!("/conversations/{}/hide", b), Some(a), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(t.conversations(a).await.len(), 1);
}

#[tokio::test]
async fn marking_someone_elses_message_is_a_no_op() {
    let t = TestApp::new();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let to_b = t.send(a, b, "for b only").await;

    let (status, body) = t
        .call(
            Method::POST,
            "/messages/read",
            Some(c),
            Some(json!({ "message_ids": [to_b["id"]] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updated"], 0);
    assert_eq!(t.conversations(b).await[0]["unread_count"], 1);
}

#[tokio::test]
async fn rejects_missing_and_forged_tokens() {
    let t = TestApp::new();
    let (status, _) = t.call(Method::GET, "/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = encode(
        &Header::default(),
        &Claims {
            sub: Uuid::new_v4(),
            username: "mallory".into(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        },
        &EncodingKey::from_secret(b"some-other-secret"),
    )
    .unwrap();
    let request = Request::builder()
        .uri("/conversations")
        .header(header::AUTHORIZATION, format!("Bearer {}", forged))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri(format!("/conversations?access_token={}", token_for(Uuid::new_v4())))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_content_is_rejected_before_storage() {
    let t = TestApp::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let uri = format!("/conversations/{}/messages", b);

    let (status, _) = t
        .call(Method::POST, &uri, Some(a), Some(json!({ "content": { "type": "text", "text": "   " } })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let long = "x".repeat(4001);
    let (status, _) = t
        .call(Method::POST, &uri, Some(a), Some(json!({ "content": { "type": "text", "text": long } })))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, _) = t
        .call(
            Method::POST,
            &format!("/conversations/{}/messages", a),
            Some(a),
            Some(json!({ "content": { "type": "text", "text": "me" } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(t.conversations(a).await.is_empty());
}

#[tokio::test]
async fn mutations_fan_out_to_subscribers() {
    let t = TestApp::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let mut a_events = t.state.hub.bus.register(a).await;
    let mut b_events = t.state.hub.bus.register(b).await;

    let sent = t.send(a, b, "ping").await;
    for sub in [&mut a_events, &mut b_events] {
        let event = sub.events.try_recv().unwrap();
        assert!(matches!(
            event.event,
            ServerEvent::MessageCreated { ref message, .. } if message.id == sent["id"].as_i64().unwrap()
        ));
    }

    t.call(Method::POST, &format!("/conversations/{}/read", a), Some(b), None)
        .await;
    let read = a_events.events.try_recv().unwrap();
    assert!(matches!(read.event, ServerEvent::MessageRead { reader_id, .. } if reader_id == b));

    let (status, _) = t
        .call(Method::POST, &format!("/conversations/{}/typing", a), Some(b), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let typing = a_events.events.try_recv().unwrap();
    assert!(matches!(typing.event, ServerEvent::TypingStart { user_id, .. } if user_id == b));
}

#[tokio::test]
async fn listing_carries_partner_profiles() {
    let t = TestApp::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (status, _) = t
        .call(
            Method::PUT,
            "/profiles/me",
            Some(b),
            Some(json!({ "name": "Bea", "avatar_url": null })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    t.send(b, a, "hey").await;
    let list = t.conversations(a).await;
    assert_eq!(list[0]["partner_profile"]["name"], "Bea");

    let (_, profiles) = t
        .call(Method::GET, &format!("/profiles?ids={},{}", a, b), Some(a), None)
        .await;
    assert_eq!(profiles.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn heartbeat_drives_presence() {
    let t = TestApp::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let (_, before) = t
        .call(Method::GET, &format!("/users/{}/presence", b), Some(a), None)
        .await;
    assert_eq!(before["online"], false);

    let (status, _) = t.call(Method::POST, "/presence/heartbeat", Some(b), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, after) = t
        .call(Method::GET, &format!("/users/{}/presence", b), Some(a), None)
        .await;
    assert_eq!(after["online"], true);
}
