//! The agent's HTTP server, exposing healthchecks, metrics & operator actions.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::Extension;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{AddExtensionLayer, Json, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{ActionFailed, ActionResult};
use crate::k8s::ActionRequest;

/// Spawn the HTTP server.
pub fn spawn_http_server(
    config: Arc<Config>, metrics: PrometheusHandle, actions: mpsc::Sender<ActionRequest>, mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<Result<()>> {
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/metrics", get(prometheus_scrape))
        .route("/actions/pre-upgrade-check", post(pre_upgrade_check))
        .route("/actions/resume-upgrade", post(resume_upgrade))
        .layer(AddExtensionLayer::new(metrics))
        .layer(AddExtensionLayer::new(actions));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.http_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("http server is listening at 0.0.0.0:{}", config.http_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}

/// Handle the `pre-upgrade-check` action.
async fn pre_upgrade_check(Extension(actions): Extension<mpsc::Sender<ActionRequest>>) -> (StatusCode, Json<Value>) {
    let (tx, rx) = oneshot::channel();
    action_response(dispatch(&actions, ActionRequest::PreUpgradeCheck { tx }, rx).await)
}

/// Handle the `resume-upgrade` action.
async fn resume_upgrade(Extension(actions): Extension<mpsc::Sender<ActionRequest>>) -> (StatusCode, Json<Value>) {
    let (tx, rx) = oneshot::channel();
    action_response(dispatch(&actions, ActionRequest::ResumeUpgrade { tx }, rx).await)
}

/// Send the given action to the controller and await its outcome.
async fn dispatch(actions: &mpsc::Sender<ActionRequest>, req: ActionRequest, rx: oneshot::Receiver<ActionResult>) -> ActionResult {
    tracing::info!(action = ?req, "operator action received");
    if actions.send(req).await.is_err() {
        return Err(ActionFailed::new("agent is shutting down"));
    }
    rx.await.unwrap_or_else(|_| Err(ActionFailed::new("agent is shutting down")))
}

/// Build the HTTP response of an action's outcome.
pub(crate) fn action_response(res: ActionResult) -> (StatusCode, Json<Value>) {
    match res {
        Ok(message) => (StatusCode::OK, Json(json!({ "message": message }))),
        Err(ActionFailed { message, hint: Some(hint) }) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message, "hint": hint }))),
        Err(ActionFailed { message, hint: None }) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))),
    }
}
