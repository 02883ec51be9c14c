//! OSCQuery HTTP/WebSocket server
//!
//! `GET` on a path returns that part of the namespace as JSON, `?ATTR`
//! narrows it to one attribute. A WebSocket on `/` takes
//! `{"COMMAND":"LISTEN","DATA":"/ring/X"}` (or `IGNORE`) and then receives
//! one binary OSC message per listened node whenever the snapshot changes.
//! A client that falls behind gets the latest snapshot, not every sample.

use crate::domain::settings::OscQuerySettings;
use crate::infrastructure::oscquery::osc;
use crate::infrastructure::oscquery::publisher::{RingNode, RingSnapshot, TelemetryPublisher};
use crate::infrastructure::shutdown::Shutdown;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, RawQuery, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

const RING_PATH: &str = "/ring";

/// Read-only, per the OSCQuery ACCESS attribute
const ACCESS_NONE: u8 = 0;
const ACCESS_READ: u8 = 1;

#[derive(Debug, Clone)]
pub struct HostInfo {
    pub name: String,
    pub ws_port: u16,
}

#[derive(Clone)]
struct AppState {
    publisher: TelemetryPublisher,
    host: Arc<HostInfo>,
    shutdown: Shutdown,
}

pub fn router(publisher: TelemetryPublisher, host: HostInfo, shutdown: Shutdown) -> Router {
    let state = AppState {
        publisher,
        host: Arc::new(host),
        shutdown,
    };

    Router::new()
        .route("/", get(root))
        .route("/*path", get(node))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub struct OscQueryServer {
    publisher: TelemetryPublisher,
    settings: OscQuerySettings,
}

impl OscQueryServer {
    pub fn new(publisher: TelemetryPublisher, settings: OscQuerySettings) -> Self {
        Self {
            publisher,
            settings,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = (self.settings.bind_address.as_str(), self.settings.http_port);
        TcpListener::bind(addr).await.with_context(|| {
            format!(
                "Failed to bind OSCQuery server to {}:{}",
                self.settings.bind_address, self.settings.http_port
            )
        })
    }

    /// Serve until `shutdown` fires; open WebSockets are closed as well
    pub async fn serve(self, listener: TcpListener, shutdown: Shutdown) -> Result<()> {
        let local = listener.local_addr()?;
        let host = HostInfo {
            name: self.settings.service_name.clone(),
            ws_port: local.port(),
        };
        let app = router(self.publisher, host, shutdown.clone());

        info!(
            "OSCQuery \"{}\" listening on http://{}",
            self.settings.service_name, local
        );

        let mut shutdown = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("OSCQuery server stopped");
        Ok(())
    }
}

fn host_info(host: &HostInfo) -> Value {
    json!({
        "NAME": host.name,
        "EXTENSIONS": {
            "ACCESS": true,
            "VALUE": true,
            "LISTEN": true,
            "DESCRIPTION": true,
            "TYPE": true,
            "FULL_PATH": true,
            "CONTENTS": true,
        },
        "WS_PORT": host.ws_port,
    })
}

fn node_json(node: RingNode, snapshot: &RingSnapshot) -> Value {
    json!({
        "FULL_PATH": node.path(),
        "TYPE": "i",
        "ACCESS": ACCESS_READ,
        "VALUE": [node.value(snapshot)],
        "DESCRIPTION": node.description(),
    })
}

fn ring_json(snapshot: &RingSnapshot) -> Value {
    let contents: Map<String, Value> = RingNode::ALL
        .into_iter()
        .map(|node| (node.name().to_string(), node_json(node, snapshot)))
        .collect();
    json!({
        "FULL_PATH": RING_PATH,
        "ACCESS": ACCESS_NONE,
        "DESCRIPTION": "Ring pointer telemetry",
        "CONTENTS": contents,
    })
}

fn root_json(snapshot: &RingSnapshot) -> Value {
    json!({
        "FULL_PATH": "/",
        "ACCESS": ACCESS_NONE,
        "DESCRIPTION": "root node",
        "CONTENTS": { "ring": ring_json(snapshot) },
    })
}

/// Whole node, or a single attribute when the query names one
fn respond(node: Value, query: Option<&str>) -> Response {
    let Some(attribute) = query.filter(|q| !q.is_empty()) else {
        return Json(node).into_response();
    };
    match node.get(attribute) {
        Some(value) => {
            let mut body = Map::new();
            body.insert(attribute.to_string(), value.clone());
            Json(Value::Object(body)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn root(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        let updates = state.publisher.subscribe();
        let shutdown = state.shutdown.clone();
        return ws.on_upgrade(move |socket| listen(socket, updates, shutdown));
    }

    if query.as_deref() == Some("HOST_INFO") {
        return Json(host_info(&state.host)).into_response();
    }
    respond(root_json(&state.publisher.snapshot()), query.as_deref())
}

async fn node(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let full_path = format!("/{}", path.trim_end_matches('/'));
    let snapshot = state.publisher.snapshot();

    let body = if full_path == RING_PATH {
        ring_json(&snapshot)
    } else if let Some(node) = RingNode::from_path(&full_path) {
        node_json(node, &snapshot)
    } else {
        return (StatusCode::NOT_FOUND, format!("No such node: {}", full_path)).into_response();
    };
    respond(body, query.as_deref())
}

#[derive(Debug, Deserialize)]
struct ClientCommand {
    #[serde(rename = "COMMAND")]
    command: String,
    #[serde(rename = "DATA", default)]
    data: Option<String>,
}

/// Update the listened set; anything unrecognised is ignored
fn apply_command(text: &str, listening: &mut HashSet<RingNode>) {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            debug!("Ignoring WebSocket message: {}", e);
            return;
        }
    };
    let Some(node) = command.data.as_deref().and_then(RingNode::from_path) else {
        debug!("Ignoring {} for unknown path {:?}", command.command, command.data);
        return;
    };
    match command.command.as_str() {
        "LISTEN" => {
            listening.insert(node);
        }
        "IGNORE" => {
            listening.remove(&node);
        }
        other => debug!("Ignoring unknown command {}", other),
    }
}

/// One OSC message per listened node, all from `snapshot`
fn snapshot_packets(listening: &HashSet<RingNode>, snapshot: &RingSnapshot) -> Vec<Vec<u8>> {
    RingNode::ALL
        .into_iter()
        .filter(|n| listening.contains(n))
        .map(|node| osc::encode_int_message(node.path(), node.value(snapshot)))
        .collect()
}

async fn listen(
    mut socket: WebSocket,
    mut updates: watch::Receiver<RingSnapshot>,
    mut shutdown: Shutdown,
) {
    debug!("WebSocket client connected");
    let mut listening = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => apply_command(&text, &mut listening),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive failed: {}", e);
                    break;
                }
            },
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *updates.borrow_and_update();
                for packet in snapshot_packets(&listening, &snapshot) {
                    if socket.send(Message::Binary(packet)).await.is_err() {
                        debug!("WebSocket client went away");
                        return;
                    }
                }
            }
        }
    }
    debug!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TelemetrySample;
    use crate::infrastructure::bluetooth::connection::TelemetrySink;
    use crate::infrastructure::shutdown;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(publisher: &TelemetryPublisher) -> Router {
        let (_trigger, shutdown) = shutdown::channel();
        router(
            publisher.clone(),
            HostInfo {
                name: "RayNeo-X2-Ring".to_string(),
                ws_port: 9020,
            },
            shutdown,
        )
    }

    async fn request(app: Router, method: Method, uri: &str) -> (StatusCode, Option<Value>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).ok())
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<Value>) {
        request(app, Method::GET, uri).await
    }

    fn publish(publisher: &TelemetryPublisher, x: i32, y: i32, press: bool) {
        publisher.publish(&TelemetrySample {
            x,
            y,
            press,
            sequence: 1,
        });
    }

    #[tokio::test]
    async fn test_namespace_lists_the_three_nodes() {
        let publisher = TelemetryPublisher::new();
        publish(&publisher, 2, 3, true);

        let (status, body) = get(app(&publisher), "/").await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        let contents = &body["CONTENTS"]["ring"]["CONTENTS"];
        assert_eq!(contents.as_object().unwrap().len(), 3);
        assert_eq!(contents["X"]["FULL_PATH"], "/ring/X");
        assert_eq!(contents["X"]["TYPE"], "i");
        assert_eq!(contents["X"]["ACCESS"], 1);
        assert_eq!(contents["X"]["VALUE"], json!([2]));
        assert_eq!(contents["Y"]["VALUE"], json!([3]));
        assert_eq!(contents["press"]["VALUE"], json!([1]));
    }

    #[tokio::test]
    async fn test_host_info() {
        let publisher = TelemetryPublisher::new();
        let (status, body) = get(app(&publisher), "/?HOST_INFO").await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        assert_eq!(body["NAME"], "RayNeo-X2-Ring");
        assert_eq!(body["WS_PORT"], 9020);
        assert_eq!(body["EXTENSIONS"]["LISTEN"], true);
    }

    #[tokio::test]
    async fn test_node_and_value_queries() {
        let publisher = TelemetryPublisher::new();
        publish(&publisher, -7, 12, false);

        let (status, body) = get(app(&publisher), "/ring/Y").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap()["DESCRIPTION"], "Ring pointer Y");

        let (status, body) = get(app(&publisher), "/ring/X?VALUE").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap(), json!({ "VALUE": [-7] }));

        let (status, body) = get(app(&publisher), "/ring").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap()["CONTENTS"]["press"]["VALUE"], json!([0]));

        // Containers carry no VALUE
        let (status, _) = get(app(&publisher), "/ring?VALUE").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let publisher = TelemetryPublisher::new();
        let (status, _) = get(app(&publisher), "/ring/battery").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(app(&publisher), "/imu").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_nodes_are_read_only() {
        let publisher = TelemetryPublisher::new();
        let (status, _) = request(app(&publisher), Method::PUT, "/ring/X").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let (status, _) = request(app(&publisher), Method::POST, "/").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_responses_reflect_latest_sample() {
        let publisher = TelemetryPublisher::new();
        publish(&publisher, 1, 1, false);
        publish(&publisher, 5, 6, true);

        let (_, body) = get(app(&publisher), "/ring").await;
        let contents = &body.unwrap()["CONTENTS"];
        assert_eq!(contents["X"]["VALUE"], json!([5]));
        assert_eq!(contents["Y"]["VALUE"], json!([6]));
        assert_eq!(contents["press"]["VALUE"], json!([1]));
    }

    #[test]
    fn test_listen_and_ignore_commands() {
        let mut listening = HashSet::new();
        apply_command(r#"{"COMMAND":"LISTEN","DATA":"/ring/X"}"#, &mut listening);
        apply_command(r#"{"COMMAND":"LISTEN","DATA":"/ring/press"}"#, &mut listening);
        assert_eq!(listening.len(), 2);

        apply_command(r#"{"COMMAND":"IGNORE","DATA":"/ring/X"}"#, &mut listening);
        assert!(!listening.contains(&RingNode::X));
        assert!(listening.contains(&RingNode::Press));

        // Unknown paths, commands and garbage change nothing
        apply_command(r#"{"COMMAND":"LISTEN","DATA":"/ring/battery"}"#, &mut listening);
        apply_command(r#"{"COMMAND":"SUBSCRIBE","DATA":"/ring/Y"}"#, &mut listening);
        apply_command("not json", &mut listening);
        assert_eq!(listening.len(), 1);
    }

    #[test]
    fn test_slow_listener_gets_latest_snapshot() {
        let publisher = TelemetryPublisher::new();
        let mut updates = publisher.subscribe();
        let mut listening = HashSet::new();
        listening.insert(RingNode::Press);
        listening.insert(RingNode::X);

        publish(&publisher, 1, 2, false);
        publish(&publisher, 7, 8, true);

        assert!(updates.has_changed().unwrap());
        let snapshot = *updates.borrow_and_update();
        assert_eq!(
            snapshot_packets(&listening, &snapshot),
            vec![
                osc::encode_int_message("/ring/X", 7),
                osc::encode_int_message("/ring/press", 1),
            ]
        );
        assert!(!updates.has_changed().unwrap());
    }
}
