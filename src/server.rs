//! Inbound HTTP surface: `POST /get-token` and `GET /health`.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use url::Url;

use crate::network_client::{ProxySpec, UpstreamClient};
use crate::pipeline::{
    AwardSelector, AwardValue, PipelineContext, PipelineError, PipelineFailure, PipelineOptions, PipelineOutcome,
    TokenPipeline, TraceLog,
};
use crate::session::{self, SESSION_COOKIE_NAME};

/// Immutable settings shared by every request handler.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub upstream_base: Url,
    pub options: PipelineOptions,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTokenRequest {
    pub cookies: Option<Value>,
    pub url: Option<String>,
    pub award_id: Option<Value>,
    pub spec_code: Option<Value>,
    /// `host:port:user:pass`
    pub proxy: Option<String>,
}

#[derive(Debug)]
struct PreparedRequest {
    cookies: String,
    award: Option<AwardSelector>,
    proxy: Option<ProxySpec>,
}

impl IntoResponse for PipelineFailure {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.error.to_string(),
            "code": self.error.error_code(),
            "log": self.log,
        });
        if let (Some((field, raw)), Some(obj)) = (self.error.upstream_body(), body.as_object_mut()) {
            obj.insert(field.to_string(), raw.clone());
        }
        (self.error.status_code(), Json(body)).into_response()
    }
}

pub fn router(settings: Arc<RelaySettings>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/get-token", post(get_token))
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(settings)
}

pub async fn start(addr: SocketAddr, settings: Arc<RelaySettings>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Service running on http://{}", addr);
    axum::serve(listener, router(settings))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Answers a panicked handler with a 500. The request's trace lives inside the
/// unwound handler, so `log` is always empty here.
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("Fatal error while handling request: {}", message);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message, "code": "internal_error", "log": [] })),
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_token(
    State(settings): State<Arc<RelaySettings>>,
    payload: Result<Json<GetTokenRequest>, JsonRejection>,
) -> Response {
    let mut trace = TraceLog::default();
    trace.push("Request received");

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let error = PipelineError::InvalidInput(format!("Invalid request body: {}", rejection.body_text()));
            return PipelineFailure { error, log: trace.into_entries() }.into_response();
        }
    };

    match relay(&settings, &request, trace).await {
        Ok(outcome) => Json(json!({ "success": true, "url": outcome.url, "log": outcome.log })).into_response(),
        Err(failure) => failure.into_response(),
    }
}

async fn relay(
    settings: &RelaySettings,
    request: &GetTokenRequest,
    mut trace: TraceLog,
) -> Result<PipelineOutcome, PipelineFailure> {
    let prepared = match prepare(request, &mut trace) {
        Ok(prepared) => prepared,
        Err(error) => return Err(PipelineFailure { error, log: trace.into_entries() }),
    };
    let upstream = match UpstreamClient::new(&settings.upstream_base, prepared.proxy.as_ref()) {
        Ok(upstream) => upstream,
        Err(err) => return Err(PipelineFailure { error: err.into(), log: trace.into_entries() }),
    };

    let ctx = PipelineContext::new(prepared.cookies, prepared.award, trace);
    TokenPipeline::new(&upstream, &settings.options).run(ctx).await
}

/// Validates the inbound body before any upstream call is made.
fn prepare(request: &GetTokenRequest, trace: &mut TraceLog) -> Result<PreparedRequest, PipelineError> {
    trace.push(format!("Cookies type: {}", session::shape_of(request.cookies.as_ref())));

    let target_url = request
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| PipelineError::MissingInput("Missing cookies or url".to_string()))?;
    trace.push(format!("Target url: {}", target_url));

    let cookies = session::normalize_cookies(request.cookies.as_ref())?;
    trace.push(format!("Cookie string length: {}", cookies.len()));
    trace.push(format!(
        "Session cookie {} present: {}",
        SESSION_COOKIE_NAME,
        session::has_cookie(&cookies, SESSION_COOKIE_NAME)
    ));

    let award = match award_value(request.award_id.as_ref(), "awardId")? {
        Some(award_id) => Some(AwardSelector {
            award_id,
            spec_code: award_value(request.spec_code.as_ref(), "specCode")?,
        }),
        None => None,
    };

    let proxy = request
        .proxy
        .as_deref()
        .filter(|spec| !spec.trim().is_empty())
        .map(ProxySpec::parse)
        .transpose()?;
    if let Some(proxy) = &proxy {
        trace.push(format!("Using proxy {}:{}", proxy.host, proxy.port));
    }

    Ok(PreparedRequest { cookies, award, proxy })
}

/// Null and empty strings count as absent; strings and numbers are kept as sent.
fn award_value(value: Option<&Value>, field: &str) -> Result<Option<AwardValue>, PipelineError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(value) => AwardValue::from_json(value)
            .map(Some)
            .ok_or_else(|| PipelineError::InvalidInput(format!("{} must be a string or a number", field))),
    }
}
