use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts, Path, State};
use axum::http::{HeaderMap, Method, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::archive::BlueprintReader;
use crate::error::RestError;
use crate::server::AppState;
use crate::server::range::RangeRequest;
use crate::session::{Session, SessionError};

const CHUNK_SIZE: usize = 1 << 20;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const CONTENT_TYPE_VIDEO: &str = "video/mp4";

/// Peer address when the server was started with connect info; absent
/// under test transports.
pub struct ClientAddr(Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// `GET/HEAD /play/{session_id}` with byte-range semantics.
pub async fn play_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    method: Method,
    addr: ClientAddr,
    headers: HeaderMap,
) -> Response {
    let client_ip = client_ip(&headers, addr);

    let session = match state.sessions.get_session(&session_id).await {
        Ok(session) => session,
        Err(SessionError::NotFound) => return RestError::SessionNotFound.into_response(),
        Err(e) => return RestError::Session(e).into_response(),
    };
    session.touch();

    // Deferred sessions fetch and parse their NZB here, exactly once.
    let content = match state.sessions.ensure_content(&session).await {
        Ok(content) => content,
        Err(e) => {
            warn!(session = %session.id, error = %e, "deferred NZB promotion failed");
            return structural_failure(&state, &session, None).await;
        }
    };

    let nzb_hash = content.nzb.hash();
    let oracle_id = content.nzb.oracle_id();

    let blueprint = match state.sessions.ensure_blueprint(&session, &content).await {
        Ok(blueprint) => blueprint,
        Err(e) if e.is_structural() => {
            warn!(session = %session.id, error = %e, "structural archive failure");
            return structural_failure(&state, &session, Some((nzb_hash, oracle_id))).await;
        }
        Err(e) => return RestError::Archive(e).into_response(),
    };

    let reader = BlueprintReader::new(Arc::clone(&blueprint), content.byte_sources());
    let size = reader.size();

    let range = match RangeRequest::parse(&headers, size) {
        Ok(range) => range,
        Err(e) => return e.into_response(),
    };

    // HEAD reports the size without touching any article.
    if method == Method::HEAD {
        return size_only_response(size, range.as_ref());
    }

    let (start, end) = match &range {
        Some(r) => {
            let span = r.to_range(size);
            (span.start, span.end)
        }
        None => (0, size),
    };

    // Pull the first chunk eagerly so a broken release turns into the
    // canned-video redirect instead of a torn 200.
    let first_len = CHUNK_SIZE.min((end - start) as usize);
    let first = match reader.read_at(start, first_len).await {
        Ok(chunk) => chunk,
        Err(e) if e.is_structural() => {
            warn!(session = %session.id, error = %e, "structural failure on first read");
            return structural_failure(&state, &session, Some((nzb_hash, oracle_id))).await;
        }
        Err(e) => return RestError::Archive(e).into_response(),
    };

    session.start_playback(&client_ip);
    info!(session = %session.id, client = %client_ip, start, end, "playback started");

    let guard = PlaybackGuard {
        session: Arc::clone(&session),
        ip: client_ip,
    };
    let body = Body::from_stream(playback_stream(reader, guard, first, start, end));

    let mut response = Response::builder()
        .status(if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, CONTENT_TYPE_VIDEO)
        .header(header::CONTENT_LENGTH, (end - start).to_string());
    if let Some(r) = &range {
        response = response.header(header::CONTENT_RANGE, r.content_range(size));
    }

    response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Emits the requested span in order; keeps the session alive at most
/// every 10 s; deregisters the playback when the client goes away.
fn playback_stream(
    reader: BlueprintReader,
    guard: PlaybackGuard,
    first: Bytes,
    start: u64,
    end: u64,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let guard = guard;
        let mut pos = start + first.len() as u64;
        let mut last_keepalive = Instant::now();
        yield Ok(first);

        while pos < end {
            if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
                guard.session.keep_alive(&guard.ip);
                last_keepalive = Instant::now();
            }

            let want = CHUNK_SIZE.min((end - pos) as usize);
            match reader.read_at(pos, want).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => {
                    pos += chunk.len() as u64;
                    yield Ok(chunk);
                }
                Err(e) => {
                    warn!(error = %e, "playback read failed mid-stream");
                    yield Err(std::io::Error::other(e.to_string()));
                    break;
                }
            }
        }
        debug!(session = %guard.session.id, "playback stream finished");
    }
}

struct PlaybackGuard {
    session: Arc<Session>,
    ip: String,
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.session.end_playback(&self.ip);
    }
}

fn size_only_response(size: u64, range: Option<&RangeRequest>) -> Response {
    let mut response = Response::builder()
        .status(if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, CONTENT_TYPE_VIDEO);
    response = match range {
        Some(r) => response
            .header(header::CONTENT_LENGTH, r.content_length(size).to_string())
            .header(header::CONTENT_RANGE, r.content_range(size)),
        None => response.header(header::CONTENT_LENGTH, size.to_string()),
    };
    response
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Structural failure: drop the cached validation verdict, tell the oracle
/// the release is bad, and bounce the player to the canned clip so it
/// exits cleanly.
async fn structural_failure(
    state: &AppState,
    session: &Arc<Session>,
    nzb_ids: Option<(String, String)>,
) -> Response {
    let oracle_id = match nzb_ids {
        Some((nzb_hash, oracle_id)) => {
            state.validator.invalidate(&nzb_hash).await;
            oracle_id
        }
        None => session.guid.clone(),
    };

    let provider = state
        .provider_hosts()
        .await
        .into_iter()
        .next()
        .unwrap_or_default();
    state.oracle.spawn_report(
        oracle_id,
        provider,
        false,
        session.indexer_name.clone(),
        session.guid.clone(),
    );

    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, state.settings.unavailable_video_url.clone())
        .header(header::CONNECTION, "close")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn client_ip(headers: &HeaderMap, addr: ClientAddr) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        let forwarded = forwarded.trim();
        if !forwarded.is_empty() {
            return forwarded.to_string();
        }
    }
    addr.0
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

