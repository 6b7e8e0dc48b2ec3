//! HTTP surface of the collector.
//!
//! Serves the query API over the SQLite log, the Prometheus gauges, the
//! dashboard's static files and a WebSocket live stream of readings.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use airlog_core::config::HISTORY_LIMIT;
use airlog_core::metrics::CONTENT_TYPE as METRICS_CONTENT_TYPE;
use airlog_core::{LiveSubscriber, ReadingPayload, Services, Store, StoreError};

/// Listener and handler settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding `index.html` and `app.js`.
    pub static_dir: PathBuf,
    /// Upper bound on `/api/history` page size.
    pub history_limit: usize,
    /// A live-stream frame not accepted by the client within this window
    /// disconnects it.
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            static_dir: PathBuf::from("static"),
            history_limit: HISTORY_LIMIT,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared server state.
struct AppState {
    services: Services,
    static_dir: PathBuf,
    history_limit: usize,
    send_timeout: Duration,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

/// Run a store query on the blocking pool. Failures are logged here and
/// surface to the client only as a generic 500.
async fn query_store<T, F>(state: &AppState, query: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(&state.services.store);
    match tokio::task::spawn_blocking(move || query(&store)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!("Store query failed: {e}");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error"))
        }
        Err(e) => {
            error!("Store query task failed: {e}");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Database error"))
        }
    }
}

async fn handle_latest(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadingPayload>, ApiError> {
    match query_store(&state, |store| store.latest()).await? {
        Some(row) => Ok(Json(ReadingPayload::from(row))),
        None => Err(api_error(StatusCode::NOT_FOUND, "No data available")),
    }
}

async fn handle_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ReadingPayload>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(state.history_limit)
        .clamp(1, state.history_limit.max(1));
    let rows = query_store(&state, move |store| store.history(limit)).await?;
    Ok(Json(rows.into_iter().map(ReadingPayload::from).collect()))
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.services.metrics.render() {
        Ok(text) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], text).into_response(),
        Err(e) => {
            error!("Rendering metrics failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Metrics unavailable").into_response()
        }
    }
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Response {
    serve_file(&state.static_dir, "index.html", "text/html; charset=utf-8").await
}

async fn handle_app_js(State(state): State<Arc<AppState>>) -> Response {
    serve_file(
        &state.static_dir,
        "app.js",
        "application/javascript; charset=utf-8",
    )
    .await
}

async fn serve_file(dir: &Path, name: &str, content_type: &'static str) -> Response {
    let path = dir.join(name);
    match tokio::fs::read(&path).await {
        Ok(body) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            debug!("Static file {} unavailable: {e}", path.display());
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let broadcaster = state.services.broadcaster.clone();
    let subscriber = match tokio::task::spawn_blocking(move || broadcaster.register()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            error!("Live stream registration failed: {e}");
            return;
        }
        Err(e) => {
            error!("Live stream registration task failed: {e}");
            return;
        }
    };
    stream_to_socket(socket, subscriber, state.send_timeout).await;
}

/// Forward subscriber messages to the client until either side goes away.
/// The subscriber is dropped (and so unregistered) on every exit path.
async fn stream_to_socket(socket: WebSocket, mut subscriber: LiveSubscriber, send_timeout: Duration) {
    let id = subscriber.id();
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            next = subscriber.recv() => {
                let Some(payload) = next else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&payload) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Serializing live reading failed: {e}");
                        continue;
                    }
                };
                match tokio::time::timeout(send_timeout, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Live subscriber #{id} send failed: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!("Live subscriber #{id} too slow, disconnecting");
                        break;
                    }
                }
            }
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Live subscriber #{id} receive failed: {e}");
                    break;
                }
            },
        }
    }
    info!("Live subscriber #{id} disconnected");
}

/// Build the axum router.
pub fn build_router(services: Services, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        services,
        static_dir: config.static_dir.clone(),
        history_limit: config.history_limit,
        send_timeout: config.send_timeout,
    });

    Router::new()
        .route("/", get(handle_index))
        .route("/static/app.js", get(handle_app_js))
        .route("/api/latest", get(handle_latest))
        .route("/api/history", get(handle_history))
        .route("/metrics", get(handle_metrics))
        .route("/ws", get(handle_ws))
        .with_state(state)
}

/// Bind `config.host:config.port` and serve until `shutdown` resolves.
pub async fn run_server<F>(services: Services, config: ServerConfig, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    serve_listener(listener, services, &config, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves, then stop
/// accepting and return.
pub async fn serve_listener<F>(
    listener: TcpListener,
    services: Services,
    config: &ServerConfig,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(services, config);
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    use airlog_core::{Broadcaster, MetricsExporter, Reading};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Fixture {
        dir: tempfile::TempDir,
        services: Services,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_initialized(dir.path().join("api.db")).unwrap());
        let services = Services {
            broadcaster: Broadcaster::new(Arc::clone(&store), 100, 8),
            metrics: Arc::new(MetricsExporter::new().unwrap()),
            store,
        };
        Fixture { dir, services }
    }

    fn router(f: &Fixture) -> Router {
        let config = ServerConfig {
            static_dir: f.dir.path().join("static"),
            ..ServerConfig::default()
        };
        build_router(f.services.clone(), &config)
    }

    fn append(f: &Fixture, readings: &[(f64, f64, i64)]) {
        let mut w = f.services.store.writer().unwrap();
        for &(t, h, c) in readings {
            w.append(&Reading::new(t, h, c)).unwrap();
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, body.to_vec())
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    // -----------------------------------------------------------------------
    // /api/latest
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_latest_empty_is_404() {
        let f = fixture();
        let (status, _, body) = get(router(&f), "/api/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body), serde_json::json!({"error": "No data available"}));
    }

    #[tokio::test]
    async fn test_latest_returns_newest_row() {
        let f = fixture();
        append(&f, &[(22.5, 45.0, 410), (22.6, 45.1, 415)]);
        let (status, _, body) = get(router(&f), "/api/latest").await;
        assert_eq!(status, StatusCode::OK);

        let v = json(&body);
        assert_eq!(v["temperature"], 22.6);
        assert_eq!(v["humidity"], 45.1);
        assert_eq!(v["co2"], 415);
        let ts = v["timestamp"].as_str().unwrap();
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[10..11], "T");
        assert!(v.get("id").is_none());
    }

    #[tokio::test]
    async fn test_latest_on_uninitialized_store_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("bare.db")).unwrap());
        let services = Services {
            broadcaster: Broadcaster::detached(8),
            metrics: Arc::new(MetricsExporter::new().unwrap()),
            store,
        };
        let app = build_router(services, &ServerConfig::default());
        let (status, _, body) = get(app, "/api/latest").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json(&body)["error"].is_string());
    }

    // -----------------------------------------------------------------------
    // /api/history
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_history_most_recent_first() {
        let f = fixture();
        append(&f, &[(22.5, 45.0, 410), (22.6, 45.1, 415)]);
        let (status, _, body) = get(router(&f), "/api/history").await;
        assert_eq!(status, StatusCode::OK);
        let co2: Vec<i64> = json(&body)
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["co2"].as_i64().unwrap())
            .collect();
        assert_eq!(co2, vec![415, 410]);
    }

    #[tokio::test]
    async fn test_history_limit_and_clamp() {
        let f = fixture();
        append(&f, &[(20.0, 40.0, 1), (20.0, 40.0, 2), (20.0, 40.0, 3)]);

        let (_, _, body) = get(router(&f), "/api/history?limit=2").await;
        assert_eq!(json(&body).as_array().unwrap().len(), 2);

        let (_, _, body) = get(router(&f), "/api/history?limit=0").await;
        assert_eq!(json(&body).as_array().unwrap().len(), 1);

        let (status, _, body) = get(router(&f), "/api/history?limit=999999").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body).as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_history_empty_is_empty_array() {
        let f = fixture();
        let (status, _, body) = get(router(&f), "/api/history").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body), serde_json::json!([]));
    }

    // -----------------------------------------------------------------------
    // /metrics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_metrics_text_exposition() {
        let f = fixture();
        f.services.metrics.set(&Reading::new(22.6, 45.1, 415));
        let (status, content_type, body) = get(router(&f), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; version=0.0.4"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("co2_ppm 415"));
        assert!(text.contains("temperature_celsius 22.6"));
    }

    // -----------------------------------------------------------------------
    // Static files and live stream
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_static_files_missing_is_404() {
        let f = fixture();
        let (status, _, _) = get(router(&f), "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = get(router(&f), "/static/app.js").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_files_served_verbatim() {
        let f = fixture();
        let static_dir = f.dir.path().join("static");
        std::fs::create_dir_all(&static_dir).unwrap();
        std::fs::write(static_dir.join("index.html"), "<h1>air</h1>").unwrap();
        std::fs::write(static_dir.join("app.js"), "console.log(1);").unwrap();

        let (status, content_type, body) = get(router(&f), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        assert_eq!(body, b"<h1>air</h1>");

        let (status, _, body) = get(router(&f), "/static/app.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"console.log(1);");
    }

    #[tokio::test]
    async fn test_ws_without_upgrade_is_rejected() {
        let f = fixture();
        let (status, _, _) = get(router(&f), "/ws").await;
        assert!(status.is_client_error());
        assert_eq!(f.services.broadcaster.subscriber_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Live stream over a real socket
    // -----------------------------------------------------------------------

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    struct LiveServer {
        addr: std::net::SocketAddr,
        stop: Option<tokio::sync::oneshot::Sender<()>>,
        task: tokio::task::JoinHandle<std::io::Result<()>>,
    }

    impl LiveServer {
        async fn connect(&self) -> Client {
            let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
                .await
                .unwrap();
            client
        }

        async fn stop(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.task.await.unwrap().unwrap();
        }
    }

    async fn live_server(f: &Fixture) -> LiveServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let services = f.services.clone();
        let config = ServerConfig::default();
        let task = tokio::spawn(async move {
            serve_listener(listener, services, &config, async move {
                let _ = stopped.await;
            })
            .await
        });
        LiveServer {
            addr,
            stop: Some(stop),
            task,
        }
    }

    /// Next text frame as JSON, or `None` once the server closed the stream.
    async fn next_frame(client: &mut Client) -> Option<serde_json::Value> {
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("no frame within 5s")?;
            match msg {
                Ok(WsMessage::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn wait_for_subscribers(services: &Services, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while services.broadcaster.subscriber_count() != n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {n} subscribers, have {}",
                services.broadcaster.subscriber_count()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_ws_sends_backlog_oldest_first_then_live() {
        let f = fixture();
        append(&f, &[(22.5, 45.0, 410), (22.6, 45.1, 415)]);
        let server = live_server(&f).await;
        let mut client = server.connect().await;

        let first = next_frame(&mut client).await.unwrap();
        let keys: Vec<&str> = first.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 4);
        for key in ["temperature", "humidity", "co2", "timestamp"] {
            assert!(keys.contains(&key), "missing {key}");
        }
        assert_eq!(first["co2"], 410);
        assert_eq!(first["temperature"], 22.5);
        assert_eq!(next_frame(&mut client).await.unwrap()["co2"], 415);

        // The backlog arrived, so the subscriber is registered: commit and
        // publish the next row the way the writer does.
        wait_for_subscribers(&f.services, 1).await;
        let row = f
            .services
            .store
            .writer()
            .unwrap()
            .append(&Reading::new(22.7, 45.2, 420))
            .unwrap();
        assert_eq!(f.services.broadcaster.publish_stored(&row), 1);

        let live = next_frame(&mut client).await.unwrap();
        assert_eq!(live["co2"], 420);
        assert_eq!(
            live["timestamp"],
            row.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()
        );

        drop(client);
        wait_for_subscribers(&f.services, 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ws_client_close_unregisters_subscriber() {
        let f = fixture();
        let server = live_server(&f).await;
        let mut a = server.connect().await;
        let mut b = server.connect().await;
        wait_for_subscribers(&f.services, 2).await;

        a.close(None).await.unwrap();
        wait_for_subscribers(&f.services, 1).await;

        // The remaining client still gets live readings.
        assert_eq!(f.services.broadcaster.publish(&Reading::new(20.0, 40.0, 500)), 1);
        assert_eq!(next_frame(&mut b).await.unwrap()["co2"], 500);

        drop(b);
        wait_for_subscribers(&f.services, 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ws_stream_ends_when_subscribers_are_closed() {
        let f = fixture();
        let server = live_server(&f).await;
        let mut client = server.connect().await;
        wait_for_subscribers(&f.services, 1).await;

        f.services.broadcaster.close_all();
        assert!(next_frame(&mut client).await.is_none());
        server.stop().await;
    }
}
