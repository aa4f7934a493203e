pub mod play;
pub mod range;
pub mod stream_builder;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::RestError;
use crate::indexer::{Aggregator, Category, SearchRequest};
use crate::nntp::ArticleSource;
use crate::oracle::OracleClient;
use crate::session::SessionManager;
use crate::triage::TriageService;
use crate::validation::ValidationChecker;

/// Shared handler state; everything is `Arc`ed so the router clones are
/// cheap.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub aggregator: Arc<Aggregator>,
    pub triage: Arc<TriageService>,
    pub validator: Arc<ValidationChecker>,
    pub oracle: Arc<OracleClient>,
    pub sessions: Arc<SessionManager>,
    pub sources: Arc<RwLock<Vec<Arc<dyn ArticleSource>>>>,
}

impl AppState {
    pub async fn provider_hosts(&self) -> Vec<String> {
        self.sources
            .read()
            .await
            .iter()
            .filter(|s| s.enabled())
            .map(|s| s.host().to_string())
            .collect()
    }
}

/// Build the addon router. With a security token configured every route
/// moves under `/{token}` and anything else is 401.
pub fn router(state: AppState) -> Router {
    let token = state.settings.addon_security_token.clone();

    let inner = Router::new()
        .route("/manifest.json", get(manifest))
        .route("/health", get(health))
        .route("/stream/{stream_type}/{id}", get(stream_handler))
        .route("/play/{session_id}", get(play::play_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    match token {
        Some(token) if !token.is_empty() => Router::new()
            .nest(&format!("/{token}"), inner)
            .fallback(unauthorized),
        _ => inner,
    }
}

async fn unauthorized() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "addon": "streamnzb"}))
}

async fn manifest() -> Json<Value> {
    Json(json!({
        "id": "dev.streamnzb.addon",
        "version": env!("CARGO_PKG_VERSION"),
        "name": "StreamNZB",
        "description": "Stream releases straight from Usenet providers",
        "resources": ["stream"],
        "types": ["movie", "series"],
        "catalogs": [],
        "idPrefixes": ["tt", "tmdb"],
        "behaviorHints": {"configurable": false, "configurationRequired": false}
    }))
}

/// `GET /stream/{type}/{id}.json` — search, triage, validate, answer with
/// the playable subset. Failures degrade to an empty list, never an HTTP
/// error.
async fn stream_handler(
    State(state): State<AppState>,
    Path((stream_type, id)): Path<(String, String)>,
) -> Result<Json<Value>, RestError> {
    let id = id.strip_suffix(".json").unwrap_or(&id);
    let request = parse_stream_id(&stream_type, id)?;
    let category = request.category;

    let items = match state.aggregator.search(&request).await {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "aggregated search failed");
            return Ok(Json(json!({"streams": []})));
        }
    };

    let candidates = state.triage.filter(items, Utc::now());
    debug!(candidates = candidates.len(), "starting validation");

    let streams = stream_builder::build_streams(&state, candidates, category).await;
    Ok(Json(json!({"streams": streams})))
}

/// `ttNNN`, `ttNNN:S:E`, `tmdb:NNN`, `tmdb:NNN:S:E`.
fn parse_stream_id(stream_type: &str, raw: &str) -> Result<SearchRequest, RestError> {
    let category = match stream_type {
        "movie" => Category::Movies,
        "series" => Category::Tv,
        other => return Err(RestError::InvalidStreamId(other.to_string())),
    };

    let parts: Vec<&str> = raw.split(':').collect();
    let mut request = SearchRequest {
        category,
        limit: 1000,
        ..SearchRequest::default()
    };

    let episode_parts: &[&str] = if parts[0].starts_with("tt") {
        request.imdb_id = Some(parts[0].to_string());
        &parts[1..]
    } else if parts[0] == "tmdb" {
        let tmdb = parts
            .get(1)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| RestError::InvalidStreamId(raw.to_string()))?;
        request.tmdb_id = Some((*tmdb).to_string());
        if parts.len() > 2 { &parts[2..] } else { &[] }
    } else {
        return Err(RestError::InvalidStreamId(raw.to_string()));
    };

    if category == Category::Tv && episode_parts.len() >= 2 {
        request.season = episode_parts[0].parse().ok();
        request.episode = episode_parts[1].parse().ok();
    }

    Ok(request)
}
