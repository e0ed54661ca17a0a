use crate::config::Config;
use crate::exchange::Exchangers;
use crate::mailer::Mailer;
use crate::store::{CredentialStore, MemoryStore, RestStore};
use crate::sweep::run_sweep;
use crate::webhook::{
    self, EmailEvent, WebhookError, WebhookSecret, HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// HTTP server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn CredentialStore>,
    pub exchangers: Arc<Exchangers>,
    pub mailer: Arc<Mailer>,
    pub webhook_secret: Arc<WebhookSecret>,
}

impl AppState {
    pub fn from_config(config: Config) -> Result<Self> {
        let store: Arc<dyn CredentialStore> = if config.store.base_url.is_some() {
            Arc::new(RestStore::from_config(&config.store)?)
        } else {
            warn!("no store.base_url configured, credentials will not survive restart");
            Arc::new(MemoryStore::new())
        };

        let exchangers = Arc::new(Exchangers::from_config(&config.providers)?);
        let mailer = Arc::new(Mailer::from_config(&config.mailer)?);
        let webhook_secret = Arc::new(WebhookSecret::parse(&config.webhook.secret));

        Ok(Self {
            config: Arc::new(config),
            store,
            exchangers,
            mailer,
            webhook_secret,
        })
    }
}

/// Start HTTP server
pub async fn serve(config: Config) -> Result<()> {
    let bind = config.server.bind.clone();
    let state = AppState::from_config(config)?;

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("HTTP server listening on {}", bind);

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Periodic, bearer-guarded refresh trigger
        .route("/jobs/refresh", post(refresh_handler))
        // Signed auth email webhook ingress
        .route("/hooks/send-email", post(send_email_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": crate::VERSION,
    }))
}

/// GET /metrics (Prometheus format)
pub async fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = crate::metrics::METRICS.registry.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    String::from_utf8(buffer).unwrap()
}

/// POST /jobs/refresh
///
/// Always answers 200 with a summary once the sweep has started; only a
/// failed store listing (or bad bearer token) is a non-2xx.
pub async fn refresh_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::types::SweepSummary>, (StatusCode, Json<Value>)> {
    let expected = state.config.sweep.token.as_str();
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    if expected.is_empty() || presented != expected {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid or missing bearer token"})),
        ));
    }

    let run_id = uuid::Uuid::new_v4();
    let window = chrono::Duration::seconds(state.config.sweep.expiry_window_secs);
    info!(%run_id, "refresh sweep triggered");

    match run_sweep(state.store.as_ref(), &state.exchangers, window).await {
        Ok(summary) => Ok(Json(summary)),
        Err(err) => {
            error!(%run_id, error = %err, "refresh sweep could not start");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            ))
        }
    }
}

/// POST /hooks/send-email
///
/// 401 signature/auth failure, 400 malformed payload or unknown action,
/// 500 downstream send failure, 200 sent.
pub async fn send_email_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = require_header(&headers, HEADER_ID)?;
    let timestamp = require_header(&headers, HEADER_TIMESTAMP)?;
    let signature = require_header(&headers, HEADER_SIGNATURE)?;

    if let Err(err) = webhook::verify_signature(
        &state.webhook_secret,
        id,
        timestamp,
        signature,
        &body,
        state.config.webhook.timestamp_tolerance_secs,
        Utc::now(),
    ) {
        warn!(
            webhook_id = id,
            secret_format = WebhookSecret::format_class(&state.config.webhook.secret),
            error = %err,
            "webhook rejected"
        );
        crate::metrics::METRICS
            .webhook_events_total
            .with_label_values(&["unknown", "rejected"])
            .inc();
        return Err(reject(err));
    }

    let (event, action) = EmailEvent::parse(&body).map_err(|err| {
        warn!(webhook_id = id, error = %err, "webhook payload invalid");
        crate::metrics::METRICS
            .webhook_events_total
            .with_label_values(&["unknown", "invalid"])
            .inc();
        reject(err)
    })?;

    let email = webhook::build_email(action, &event, &state.config.mailer.site_url);

    if let Err(err) = state.mailer.send(&email).await {
        error!(webhook_id = id, action = action.as_str(), error = %err, "email send failed");
        crate::metrics::METRICS
            .webhook_events_total
            .with_label_values(&[action.as_str(), "send_failed"])
            .inc();
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "email delivery failed"})),
        ));
    }

    crate::metrics::METRICS
        .webhook_events_total
        .with_label_values(&[action.as_str(), "sent"])
        .inc();

    Ok(Json(json!({"status": "sent", "action": action.as_str()})))
}

fn require_header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, (StatusCode, Json<Value>)> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!(header = name, "webhook request missing header");
            reject(WebhookError::MissingHeader(name))
        })
}

fn reject(err: WebhookError) -> (StatusCode, Json<Value>) {
    let status = if err.is_auth_error() {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(json!({"error": err.to_string()})))
}
