use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub const RECORDS_PATH: &str = "/v1/records";

/// Split a newline-delimited body into records, dropping blank lines and
/// `\r` terminators.
pub fn parse_records(body: &str) -> Vec<String> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_owned)
        .collect()
}

fn response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::default());
    *resp.status_mut() = status;
    resp
}

/// Check route and method, then decode the body into records.
async fn validate<B>(req: Request<B>) -> Result<Vec<String>, (StatusCode, String)>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    if path != RECORDS_PATH {
        return Err((StatusCode::NOT_FOUND, format!("unknown path: {path}")));
    }
    if method != Method::POST {
        return Err((StatusCode::METHOD_NOT_ALLOWED, format!("{method} {path}")));
    }

    let body = req.collect().await.map(|c| c.to_bytes()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("POST {path}: failed to read body"),
        )
    })?;

    let text = std::str::from_utf8(&body).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("POST {path}: body is not valid UTF-8"),
        )
    })?;

    Ok(parse_records(text))
}

async fn handle<B>(
    req: Request<B>,
    tx: mpsc::Sender<Vec<String>>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let records = match validate(req).await {
        Ok(records) => records,
        Err((status, reason)) => {
            warn!(reason, "records request rejected");
            return Ok(response(status));
        }
    };

    if records.is_empty() {
        return Ok(response(StatusCode::OK));
    }

    let count = records.len();
    match tx.try_send(records) {
        Ok(()) => {
            debug!(count, "accepted metric records");
            Ok(response(StatusCode::OK))
        }
        Err(TrySendError::Full(_)) => {
            let mut resp = response(StatusCode::SERVICE_UNAVAILABLE);
            resp.headers_mut()
                .insert("Retry-After", hyper::header::HeaderValue::from_static("1"));
            Ok(resp)
        }
        // The relay loop is gone (shutdown), retrying against us won't help.
        Err(TrySendError::Closed(_)) => Ok(response(StatusCode::BAD_GATEWAY)),
    }
}

/// Accept connections until `cancel` fires. Each request body is forwarded
/// to the relay loop as one batch of records.
///
/// On cancel, open connections finish their current request and close.
/// Returns only once every connection task has exited.
pub async fn serve(
    listener: TcpListener,
    tx: mpsc::Sender<Vec<String>>,
    cancel: CancellationToken,
) {
    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let tx = tx.clone();
                let cancel = cancel.clone();
                connections.spawn(async move {
                    let service = service_fn(move |req| {
                        let tx = tx.clone();
                        handle(req, tx)
                    });
                    let builder = Builder::new(hyper_util::rt::TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(stream), service);
                    tokio::pin!(conn);

                    tokio::select! {
                        _ = conn.as_mut() => return,
                        _ = cancel.cancelled() => conn.as_mut().graceful_shutdown(),
                    }
                    let _ = conn.await;
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }

    drop(listener);
    connections.close();
    connections.wait().await;
    debug!("records listener stopped");
}
