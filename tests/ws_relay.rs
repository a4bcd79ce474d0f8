//! End-to-end WebSocket relay tests against a bound listener, with
//! stub workers standing in for the Python scripts.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::StubWorkers;
use lesson_relay::server::create_app;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const START: &str = r#"{"type":"generate_lesson","data":{"topic":"Photosynthesis","age_group":"high school","knowledge_level":"beginner"}}"#;

async fn start_server(workers: &StubWorkers) -> String {
    let app = create_app(workers.state());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

async fn next_event(ws: &mut WsClient) -> Value {
    loop {
        match ws.next().await.expect("stream ended early").unwrap() {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// The relay drops the connection after the terminal event; accept any
/// of the ways that can look from the client side.
async fn assert_closed(ws: &mut WsClient) {
    match ws.next().await {
        None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected connection close, got {other:?}"),
    }
}

#[tokio::test]
async fn streams_workflow_events_in_order() {
    let workers = StubWorkers::new();
    workers.script(
        "workflow_runner.py",
        concat!(
            "printf '%s\\n' ",
            "'{\"type\":\"progress\",\"stage\":\"lesson_planning\",\"progress\":15,\"message\":\"planning\"}' ",
            "'{\"type\":\"content_chunk\",\"data\":{\"point_title\":\"Chlorophyll\",\"chunk\":\"Hello \",\"complete\":false}}' ",
            "'{\"type\":\"content_chunk\",\"data\":{\"point_title\":\"Chlorophyll\",\"chunk\":\"world\",\"complete\":true}}' ",
            "'{\"type\":\"complete\"}'\n",
        ),
    );
    let url = start_server(&workers).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(WsMessage::Text(START.to_string())).await.unwrap();

    let first = next_event(&mut ws).await;
    assert_eq!(first["type"], "progress");
    assert_eq!(first["data"]["stage"], "lesson_planning");
    assert_eq!(first["data"]["progress"], 15.0);

    let second = next_event(&mut ws).await;
    assert_eq!(second["type"], "content_chunk");
    assert_eq!(second["data"]["chunk"], "Hello ");

    let third = next_event(&mut ws).await;
    assert_eq!(third["type"], "content_chunk");
    assert_eq!(third["data"]["complete"], true);

    let fourth = next_event(&mut ws).await;
    assert_eq!(fourth["type"], "complete");
    assert_eq!(fourth["data"]["current_processing"], "complete");
    assert_eq!(fourth["data"]["content_data"]["Chlorophyll"], "Hello world");
    assert_eq!(fourth["data"]["topic"], "Photosynthesis");

    assert_closed(&mut ws).await;
}

#[tokio::test]
async fn failing_worker_yields_single_error_event() {
    let workers = StubWorkers::new();
    workers.script("workflow_runner.py", "echo boom >&2\nexit 1\n");
    let url = start_server(&workers).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(WsMessage::Text(START.to_string())).await.unwrap();

    let event = next_event(&mut ws).await;
    assert_eq!(event["type"], "error");
    let message = event["data"]["message"].as_str().unwrap();
    assert!(message.contains("exit code 1"));
    assert!(message.contains("boom"));

    // no complete event follows the error
    assert_closed(&mut ws).await;
}

#[tokio::test]
async fn partial_content_survives_worker_crash() {
    let workers = StubWorkers::new();
    workers.script(
        "workflow_runner.py",
        concat!(
            "printf '%s\\n' ",
            "'{\"type\":\"content_chunk\",\"data\":{\"point_title\":\"Roots\",\"chunk\":\"Water\",\"complete\":false}}'\n",
            "exit 1\n",
        ),
    );
    let url = start_server(&workers).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(WsMessage::Text(START.to_string())).await.unwrap();

    // the streamed chunk arrives before the terminal error, so the
    // client keeps its partial content
    let chunk = next_event(&mut ws).await;
    assert_eq!(chunk["type"], "content_chunk");
    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_closed(&mut ws).await;
}

#[tokio::test]
async fn invalid_request_leaves_connection_usable() {
    let workers = StubWorkers::new();
    workers.script(
        "workflow_runner.py",
        "printf '%s\\n' '{\"type\":\"complete\"}'\n",
    );
    let url = start_server(&workers).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    let blank_topic = r#"{"type":"generate_lesson","data":{"topic":"","age_group":"college","knowledge_level":"advanced"}}"#;
    ws.send(WsMessage::Text(blank_topic.to_string()))
        .await
        .unwrap();
    let rejection = next_event(&mut ws).await;
    assert_eq!(rejection["type"], "error");

    // the same connection can still start a valid workflow
    ws.send(WsMessage::Text(START.to_string())).await.unwrap();
    let event = next_event(&mut ws).await;
    assert_eq!(event["type"], "complete");
}

#[tokio::test]
async fn second_start_is_rejected_while_streaming() {
    let workers = StubWorkers::new();
    workers.script(
        "workflow_runner.py",
        concat!(
            "printf '%s\\n' '{\"type\":\"progress\",\"stage\":\"image_search\",\"progress\":30,\"message\":\"searching\"}'\n",
            "sleep 2\n",
            "printf '%s\\n' '{\"type\":\"complete\"}'\n",
        ),
    );
    let url = start_server(&workers).await;

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(WsMessage::Text(START.to_string())).await.unwrap();

    let first = next_event(&mut ws).await;
    assert_eq!(first["type"], "progress");

    ws.send(WsMessage::Text(START.to_string())).await.unwrap();
    let rejection = next_event(&mut ws).await;
    assert_eq!(rejection["type"], "error");
    assert!(rejection["data"]["message"]
        .as_str()
        .unwrap()
        .contains("already running"));

    // the original workflow still completes
    let event = next_event(&mut ws).await;
    assert_eq!(event["type"], "complete");
}
