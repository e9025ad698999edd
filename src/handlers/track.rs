use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use super::{auth, json_response};
use crate::aggregate::event::Event;
use crate::app_state::AppState;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("zlib: {0}")]
    Zlib(std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handle POST /track: a zlib-compressed JSON array of events behind Basic
/// auth. Decode failures answer 400 with zero createdEvents; accepted
/// batches answer 202 with the count and the handler's own timing in
/// nanoseconds.
pub async fn handle_track(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();

    if !auth::authorized(&parts.headers, &state.config.http.user, &state.config.http.password) {
        return Ok(auth::challenge());
    }

    let body = body.collect().await?.to_bytes();
    let events = match decode_events(&body) {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "cannot decode track request");
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "createdEvents": 0,
                    "_timing": started.elapsed().as_nanos() as i64,
                }),
            ));
        }
    };

    let created = state.aggregator.ingest_batch(&events).await;
    debug!(events = events.len(), created, "track request processed");

    Ok(json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({
            "createdEvents": created,
            "_timing": started.elapsed().as_nanos() as i64,
        }),
    ))
}

pub(crate) fn decode_events(body: &[u8]) -> Result<Vec<Event>, DecodeError> {
    let mut json = Vec::new();
    ZlibDecoder::new(body)
        .read_to_end(&mut json)
        .map_err(DecodeError::Zlib)?;
    Ok(serde_json::from_slice(&json)?)
}
