//! Renders a stream of `SseFrame`s as an axum `text/event-stream` response,
//! interleaving a `: keepalive` comment whenever the producer has been idle
//! for 20 seconds (`spec.md` §6).

use std::time::Duration;

use async_stream::stream;
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use branchmind_protocol::SseFrame;
use futures::{Stream, StreamExt};

use crate::run::{frame_bytes, heartbeat_bytes};

pub(crate) fn sse_response(
    frames: impl Stream<Item = SseFrame> + Send + 'static,
    heartbeat_idle: Duration,
) -> Response {
    let body = stream! {
        tokio::pin!(frames);
        loop {
            match tokio::time::timeout(heartbeat_idle, frames.next()).await {
                Ok(Some(frame)) => yield Ok::<_, std::convert::Infallible>(frame_bytes(&frame)),
                Ok(None) => break,
                Err(_elapsed) => yield Ok(heartbeat_bytes().to_string()),
            }
        }
    };

    let mut response = Response::new(Body::from_stream(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    response.into_response()
}
