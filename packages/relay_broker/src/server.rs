//! Listeners: raw TCP and an axum HTTP server carrying the WebSocket endpoint
//! plus health and metrics routes. Both feed the same [`Broker`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{ConnectInfo, State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::{RuntimeConfig, SessionConfig};
use crate::metrics::{BrokerMetrics, HealthStatus, MetricsSnapshot};
use crate::session::run_session;
use crate::transport::websocket::{WsReader, WsWriter};

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub session: SessionConfig,
    pub shutdown: CancellationToken,
}

/// Both listeners, bound and ready to serve.
pub struct BoundServer {
    tcp: TcpListener,
    ws: Option<TcpListener>,
    state: AppState,
}

impl BoundServer {
    pub async fn bind(config: &RuntimeConfig) -> Result<Self> {
        let host = config.listen.host.as_str();
        let tcp = TcpListener::bind((host, config.listen.port))
            .await
            .with_context(|| format!("failed to bind TCP listener on {host}:{}", config.listen.port))?;
        let ws = match config.listen.ws_port {
            Some(port) => Some(
                TcpListener::bind((host, port))
                    .await
                    .with_context(|| format!("failed to bind WebSocket listener on {host}:{port}"))?,
            ),
            None => None,
        };

        let metrics = Arc::new(BrokerMetrics::new());
        let broker = Arc::new(Broker::new(config.broker.clone(), metrics));
        Ok(Self {
            tcp,
            ws,
            state: AppState {
                broker,
                session: config.session.clone(),
                shutdown: CancellationToken::new(),
            },
        })
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    pub fn ws_addr(&self) -> Result<Option<SocketAddr>> {
        self.ws
            .as_ref()
            .map(|l| l.local_addr())
            .transpose()
            .map_err(Into::into)
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.state.broker.clone()
    }

    /// Serve until `shutdown` fires, then cancel every live session.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let state = AppState {
            shutdown: shutdown.clone(),
            ..self.state
        };

        info!("TCP listener on {}", self.tcp.local_addr()?);
        let tcp_task = tokio::spawn(accept_tcp(self.tcp, state.clone()));

        let ws_result = match self.ws {
            Some(listener) => {
                info!("WebSocket listener on ws://{}/", listener.local_addr()?);
                let app = router(state.clone());
                axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await
                .context("WebSocket server error")
            }
            None => {
                shutdown.cancelled().await;
                Ok(())
            }
        };

        if let Err(e) = tcp_task.await {
            warn!("TCP accept loop ended abnormally: {}", e);
        }
        let dropped = state.broker.shutdown().await;
        info!("Broker stopped, released {} registered clients", dropped);
        ws_result
    }
}

async fn accept_tcp(listener: TcpListener, state: AppState) {
    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept TCP connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        tokio::spawn(run_session(
            reader,
            writer,
            addr.to_string(),
            state.broker.clone(),
            state.session.clone(),
            state.shutdown.clone(),
        ));
    }
}

/// HTTP routes served on the WebSocket port.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        run_session(
            WsReader::new(stream),
            WsWriter::<_, Message>::new(sink),
            addr.to_string(),
            state.broker,
            state.session,
            state.shutdown,
        )
        .await;
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthStatus> {
    let metrics = state.broker.metrics();
    Json(HealthStatus {
        status: "ok".to_string(),
        connections: metrics.snapshot().connections.active,
        uptime_secs: metrics.uptime_secs(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.broker.metrics().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    use crate::config::BrokerConfig;

    fn state() -> AppState {
        AppState {
            broker: Arc::new(Broker::new(
                BrokerConfig::default(),
                Arc::new(BrokerMetrics::new()),
            )),
            session: SessionConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let json = get_json(router(state()), "/health").await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn test_metrics() {
        let state = state();
        state.broker.metrics().connection_opened();
        let json = get_json(router(state), "/metrics").await;
        assert_eq!(json["connections"]["active"], 1);
        assert_eq!(json["relays"]["bytes"], 0);
    }

    #[tokio::test]
    async fn test_root_requires_upgrade() {
        let resp = router(state())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }
}
