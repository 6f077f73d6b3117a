pub mod auth;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod message;
pub mod transport;

pub use engine::{Engine, EngineOptions, RequestContext, RequestOptions, TransportHandle};
pub use errors::RpcError;
pub use message::{ErrorObject, Message, Notification, Request, RequestId, Response};
pub use transport::{AuthInfo, MessageMeta, SendOptions, Transport, TransportCallbacks};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header, Request as HttpRequest, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::engine::{Engine, RequestOptions};
    use crate::message::{Message, RequestId};
    use crate::transport::http::{build_router, HttpServerTransport, HttpTransportState};
    use crate::transport::Transport;

    const TOKEN: &str = "token-1234567890ab";

    async fn app() -> (Router, Arc<HttpServerTransport>) {
        let transport = HttpServerTransport::new();
        transport.start().await.expect("start transport");
        let state = HttpTransportState::new(TOKEN.to_string(), Arc::clone(&transport));
        (build_router(state), transport)
    }

    async fn served_app() -> (Router, Arc<HttpServerTransport>, Engine) {
        let transport = HttpServerTransport::new();
        let engine = Engine::new();
        engine.register("echo", |request: crate::message::Request, _context| async move {
            Ok(request.params.unwrap_or(serde_json::Value::Null))
        });
        engine
            .connect(Arc::clone(&transport) as Arc<dyn Transport>)
            .await
            .expect("connect transport");
        let state = HttpTransportState::new(TOKEN.to_string(), Arc::clone(&transport));
        (build_router(state), transport, engine)
    }

    fn post_message(session: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(format!("/messages?session={session}"))
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from(body.to_string()))
            .expect("request build")
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        assert_eq!(body, "{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn discovery_is_public() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/.well-known/rpc")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let body_json: serde_json::Value =
            serde_json::from_slice(&body).expect("valid json response");
        assert_eq!(body_json["events_endpoint"], "/events");
        assert_eq!(body_json["messages_endpoint"], "/messages");
    }

    #[tokio::test]
    async fn events_requires_token() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/events")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn messages_requires_token() {
        let (app, transport) = app().await;
        let (session, _receiver) = transport.open_session();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/messages?session={session}"))
                    .method("POST")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","method":"ping"}"#))
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let (app, transport) = app().await;
        let (session, _receiver) = transport.open_session();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/messages?session={session}"))
                    .method("POST")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, "Bearer wrong-token")
                    .body(Body::from(r#"{"jsonrpc":"2.0","method":"ping"}"#))
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (app, _) = app().await;
        let response = app
            .oneshot(post_message(
                "00000000-0000-0000-0000-000000000000",
                r#"{"jsonrpc":"2.0","method":"ping"}"#,
            ))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_returns_parse_error() {
        let (app, transport) = app().await;
        let (session, _receiver) = transport.open_session();
        let response = app
            .oneshot(post_message(&session, "{"))
            .await
            .expect("request execution");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let body_json: serde_json::Value =
            serde_json::from_slice(&body).expect("valid json response");
        assert_eq!(body_json["code"], "parse_error");
    }

    #[tokio::test]
    async fn echo_reply_arrives_on_the_submitting_session() {
        let (app, transport, _engine) = served_app().await;
        let (session, mut receiver) = transport.open_session();

        let response = app
            .oneshot(post_message(
                &session,
                r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"hello":"world"}}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let reply = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("reply in time")
            .expect("session still open");
        let Message::Response(reply) = reply else {
            panic!("expected response");
        };
        assert_eq!(reply.id, RequestId::Number(1));
        assert_eq!(reply.outcome, Ok(json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn replies_never_cross_between_sessions() {
        let (app, transport, _engine) = served_app().await;
        let (session_a, mut receiver_a) = transport.open_session();
        let (session_b, mut receiver_b) = transport.open_session();

        // Same request id on both sessions; each reply must come back on
        // the session that submitted it.
        let first = app
            .clone()
            .oneshot(post_message(
                &session_a,
                r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"from":"a"}}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let second = app
            .oneshot(post_message(
                &session_b,
                r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"from":"b"}}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(second.status(), StatusCode::ACCEPTED);

        let reply_a = tokio::time::timeout(Duration::from_secs(1), receiver_a.recv())
            .await
            .expect("a reply in time")
            .expect("a open");
        let reply_b = tokio::time::timeout(Duration::from_secs(1), receiver_b.recv())
            .await
            .expect("b reply in time")
            .expect("b open");

        let Message::Response(reply_a) = reply_a else {
            panic!("expected response on a");
        };
        let Message::Response(reply_b) = reply_b else {
            panic!("expected response on b");
        };
        assert_eq!(reply_a.outcome, Ok(json!({"from": "a"})));
        assert_eq!(reply_b.outcome, Ok(json!({"from": "b"})));
        assert!(receiver_a.try_recv().is_err());
        assert!(receiver_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_reply() {
        let (app, transport, _engine) = served_app().await;
        let (session, mut receiver) = transport.open_session();

        let response = app
            .oneshot(post_message(
                &session,
                r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"step":1}}"#,
            ))
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn engine_can_push_requests_to_a_session() {
        let (_app, transport, engine) = served_app().await;
        let (session, mut receiver) = transport.open_session();

        let pushed = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .request(
                        "client/ask",
                        Some(json!({"question": "ready?"})),
                        RequestOptions::default(),
                    )
                    .await
            }
        });

        let outbound = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("outbound in time")
            .expect("session open");
        let Message::Request(outbound) = outbound else {
            panic!("expected request");
        };
        assert_eq!(outbound.method, "client/ask");

        // Answer through the transport the way the POST endpoint would.
        transport
            .receive(
                &session,
                None,
                Message::Response(crate::message::Response::success(
                    outbound.id,
                    json!({"answer": "yes"}),
                )),
            )
            .expect("submit response");

        let result = pushed.await.expect("join").expect("request result");
        assert_eq!(result, json!({"answer": "yes"}));
    }
}
