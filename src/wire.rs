use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::model::{ReservationId, RoomId, Timestamp};
use crate::observability::{self, op_label};
use crate::service::{BookingError, BookingService, ExtraInfo};
use crate::store::Store;

/// One request line. Tagged by `"op"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Rooms,
    List {
        start: Timestamp,
        end: Timestamp,
    },
    Available {
        room_id: RoomId,
        start: Timestamp,
        end: Timestamp,
    },
    Make {
        room_id: RoomId,
        requester: String,
        start: Timestamp,
        end: Timestamp,
        #[serde(default)]
        memo: Option<String>,
        #[serde(default)]
        repeat: u32,
    },
    Cancel {
        id: ReservationId,
    },
}

fn error_body(kind: &str, message: impl std::fmt::Display) -> Value {
    json!({ "error": { "kind": kind, "message": message.to_string() } })
}

fn booking_error(e: &BookingError) -> Value {
    error_body(e.kind(), e)
}

fn result_body<T: serde::Serialize>(value: T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => json!({ "result": v }),
        Err(e) => error_body("store_failure", e),
    }
}

async fn dispatch<S: Store>(service: &BookingService<S>, request: Request) -> Value {
    match request {
        Request::Rooms => match service.room_list().await {
            Ok(rooms) => result_body(rooms),
            Err(e) => booking_error(&e),
        },
        Request::List { start, end } => match service.list(start, end).await {
            Ok(grouped) => result_body(grouped),
            Err(e) => booking_error(&e),
        },
        Request::Available {
            room_id,
            start,
            end,
        } => match service.available(room_id, start, end).await {
            Ok(available) => result_body(json!({ "available": available })),
            Err(e) => booking_error(&e),
        },
        Request::Make {
            room_id,
            requester,
            start,
            end,
            memo,
            repeat,
        } => {
            let extra = ExtraInfo { memo, repeat };
            match service.make(room_id, &requester, start, end, extra).await {
                Ok(rows) => result_body(rows),
                Err(e) => booking_error(&e),
            }
        }
        Request::Cancel { id } => match service.cancel(id).await {
            Ok(cancelled) => result_body(json!({ "cancelled": cancelled })),
            Err(e) => booking_error(&e),
        },
    }
}

/// Handle one request line and produce the response object.
pub async fn handle_line<S: Store>(service: &BookingService<S>, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request")
                .increment(1);
            return error_body("bad_request", e);
        }
    };

    let op = op_label(&request);
    let started = Instant::now();
    let response = dispatch(service, request).await;
    let status = match response.get("error") {
        Some(err) => err
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("error")
            .to_string(),
        None => "ok".to_string(),
    };
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    response
}

/// Serve newline-delimited JSON requests on one connection until the peer closes it.
/// Requests on a connection are answered in order.
pub async fn process_connection<T, S>(
    io: T,
    service: Arc<BookingService<S>>,
    max_line_bytes: usize,
) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Store,
{
    let mut framed = Framed::new(io, LinesCodec::new_with_max_length(max_line_bytes));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!("request line over {max_line_bytes} bytes, closing connection");
                let body = error_body("bad_request", "request line too long");
                let _ = framed.send(body.to_string()).await;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&service, &line).await;
        framed
            .send(response.to_string())
            .await
            .map_err(|e| match e {
                LinesCodecError::Io(e) => e,
                other => std::io::Error::other(other.to_string()),
            })?;
    }
    Ok(())
}
