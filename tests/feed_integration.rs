//! Integration tests for the live feeds: the monitor WebSocket and the
//! category SSE stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use event_relay::app::Pipeline;
use event_relay::broker::{BrokerConfig, MemoryLog};
use event_relay::config::PipelineConfig;
use event_relay::lookup::MemoryLookup;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_server() -> (u16, Pipeline) {
    let config = PipelineConfig {
        db_path: None,
        broker: BrokerConfig {
            idle_poll: Duration::from_millis(20),
            ..BrokerConfig::default()
        },
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::assemble(&config, Arc::new(MemoryLog::new()), Arc::new(MemoryLookup::new()))
        .await
        .unwrap();
    let app = pipeline.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, pipeline)
}

async fn post_message(port: u16, content: &str) {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/"))
        .json(&serde_json::json!({ "content": content }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
}

/// Read the next text frame as JSON.
async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for WS frame")
            .expect("WS stream ended")
            .expect("WS error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn monitor_ws_syncs_then_streams_live_events() {
    let (port, pipeline) = start_server().await;

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/monitor/ws"))
        .await
        .unwrap();

    let sync = next_json(&mut ws).await;
    assert_eq!(sync["type"], "sync");
    assert_eq!(sync["events"].as_array().unwrap().len(), 0);

    post_message(port, "I was overcharged on my invoice, a@b.com").await;

    let mut stages: Vec<String> = Vec::new();
    while !["received", "extracted", "validated", "unknown", "routed"]
        .iter()
        .all(|s| stages.iter().any(|seen| seen == s))
    {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "event");
        stages.push(frame["event"]["stage"].as_str().unwrap().to_string());
    }

    // A reconnecting client gets the history in its sync frame.
    ws.send(Message::Close(None)).await.unwrap();
    let (mut again, _) = connect_async(format!("ws://127.0.0.1:{port}/monitor/ws"))
        .await
        .unwrap();
    let resync = next_json(&mut again).await;
    assert_eq!(resync["type"], "sync");
    assert!(resync["events"].as_array().unwrap().len() >= stages.len());

    timeout(TEST_TIMEOUT, pipeline.shutdown()).await.unwrap();
}

#[tokio::test]
async fn category_sse_replays_history() {
    let (port, pipeline) = start_server().await;

    post_message(port, "I was overcharged on my invoice, a@b.com").await;
    let finance = Arc::clone(pipeline.category("finance").unwrap());
    timeout(TEST_TIMEOUT, async {
        while finance.recent(1).await.1 == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("finance never received the message");

    let mut resp = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/sinks/finance/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut body = String::new();
    timeout(TEST_TIMEOUT, async {
        while !body.contains("overcharged") {
            let chunk = resp.chunk().await.unwrap().expect("SSE stream ended");
            body.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("history was not replayed");
    assert!(body.contains("event: category_message"));

    timeout(TEST_TIMEOUT, pipeline.shutdown()).await.unwrap();
}
