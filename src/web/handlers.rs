use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::WebState;
use crate::error::{AppError, Result};
use crate::stream::mjpeg::{ClientGuard, ClientStats};
use crate::stream::{RingRead, StreamStatus};

/// Resend the newest frame when nothing new arrived for this long
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// How long a snapshot waits for a fresh frame before serving the newest one
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn health_check() -> &'static str {
    "OK"
}

/// Query parameters for MJPEG stream
#[derive(Deserialize, Default)]
pub struct MjpegStreamQuery {
    /// Optional client ID (if not provided, a random UUID will be generated)
    pub client_id: Option<String>,
}

/// MJPEG stream endpoint
pub async fn mjpeg_stream(
    State(state): State<Arc<WebState>>,
    Query(query): Query<MjpegStreamQuery>,
) -> Result<Response> {
    if state.stream.is_stopped() {
        return Err(AppError::ServiceUnavailable("stream is stopped".to_string()));
    }

    let client_id = query
        .client_id
        .filter(|id| !id.is_empty() && id.len() <= 64)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let ring = state.stream.ring();
    let mut reader = ring.reader();
    let guard = ClientGuard::new(client_id, state.clients.clone());
    let handle = state.stream.clone();

    let body_stream = async_stream::stream! {
        // The reader starts at the newest frame, so a new client gets a
        // picture right away
        while !handle.is_stopped() {
            match reader.next(KEEPALIVE_INTERVAL).await {
                Some(RingRead::Frame(frame)) => {
                    yield Ok::<Bytes, std::io::Error>(mjpeg_part(frame.data()));
                    guard.record_sent();
                }
                Some(RingRead::Gap { skipped }) => guard.record_skipped(skipped),
                None => {
                    let Some(frame) = ring.latest() else {
                        continue;
                    };
                    yield Ok(mjpeg_part(frame.data()));
                    guard.record_sent();
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(Body::from_stream(body_stream))
        .map_err(|e| AppError::ServiceUnavailable(e.to_string()))
}

/// Single JPEG snapshot
///
/// The pending reader counts as a consumer, so the stream encodes a frame
/// for it even when nobody else is watching.
pub async fn snapshot(State(state): State<Arc<WebState>>) -> Response {
    let ring = state.stream.ring();
    let mut reader = ring.fresh_reader();
    let frame = match reader.next_frame(SNAPSHOT_TIMEOUT).await {
        Some(frame) => Some(frame),
        None => ring.latest(),
    };
    match frame {
        Some(frame) if frame.is_valid_jpeg() => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            frame.data_bytes(),
        )
            .into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response(),
    }
}

#[derive(Serialize)]
pub struct StateResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub stream: StreamStatus,
    pub clients: Vec<ClientStats>,
}

/// Stream status
pub async fn stream_state(State(state): State<Arc<WebState>>) -> Json<StateResponse> {
    Json(StateResponse {
        ok: true,
        stream: state.stream.status(),
        clients: state.clients.stats(),
    })
}

/// One part of a `multipart/x-mixed-replace` body
fn mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());
    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mjpeg_part_layout() {
        let part = mjpeg_part(&[0xff, 0xd8, 0xff, 0xd9]);
        let head = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n";
        assert!(part.starts_with(head));
        assert_eq!(&part[head.len()..], &[0xff, 0xd8, 0xff, 0xd9, b'\r', b'\n']);
    }
}
