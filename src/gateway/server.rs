//! Axum router and server for the client role.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::gateway::GatewayError;
use crate::lifecycle::Shutdown;
use crate::rpc::RpcClient;

/// State shared by every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub client: Arc<RpcClient>,
}

/// HTTP front end that turns POST requests into RPC calls.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(config: &GatewayConfig, client: Arc<RpcClient>) -> Self {
        Self {
            router: build_router(config, client),
        }
    }

    /// Serve until `shutdown` fires, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), GatewayError> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Gateway starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("Gateway stopped");
        Ok(())
    }
}

/// One POST route per configured path, plus `GET /health`.
#[allow(deprecated)]
pub fn build_router(config: &GatewayConfig, client: Arc<RpcClient>) -> Router {
    let mut router = Router::new().route("/health", get(health));

    for (path, queue) in &config.routes {
        let queue = queue.clone();
        router = router.route(
            path,
            post(move |State(state): State<GatewayState>, body: Bytes| {
                let queue = queue.clone();
                async move { forward(state, &queue, body).await }
            }),
        );
    }

    router.with_state(GatewayState { client }).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs))),
    )
}

async fn forward(state: GatewayState, queue: &str, body: Bytes) -> Response {
    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return bad_request(queue, "request body must be a JSON object"),
        Err(e) => return bad_request(queue, &e.to_string()),
    };

    let client = &state.client;
    let reply = client.call(queue, payload, client.default_timeout()).await;
    (StatusCode::OK, Json(reply)).into_response()
}

fn bad_request(queue: &str, message: &str) -> Response {
    tracing::debug!(queue = %queue, error = %message, "Rejected gateway request");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn health(State(state): State<GatewayState>) -> Response {
    let broker = state.client.manager().state();
    let status = if broker.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "broker": broker.as_str() }))).into_response()
}
