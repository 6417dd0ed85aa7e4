//! Minimal HTTP shell around [`crate::actions::ActionServer`].
//!
//! Accepts multipart POSTs on a single endpoint: the `params` part carries
//! the action JSON, any further parts are file bodies streamed into guarded
//! temp files that live exactly as long as the dispatch call.

use anyhow::{Context, Result};
use bytes::Bytes;
use common::error::SyncError;
use common::tmp::TempPath;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::actions::{AbortRequest, ActionResponse, ActionServer, UploadPart};

type ResponseBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

const RESPONSE_CONTENT_TYPE: &str = "text/javascript; charset=UTF-8";

fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, value: &Value) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)
        .body(full_body(value.to_string()))
        .expect("static response headers are valid")
}

fn error_response(err: &anyhow::Error) -> Response<ResponseBody> {
    let (status, message) = if let Some(abort) = err.downcast_ref::<AbortRequest>() {
        (
            StatusCode::from_u16(abort.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            abort.message.clone(),
        )
    } else {
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::InvalidPath(message)) => (StatusCode::NOT_FOUND, message.clone()),
            Some(SyncError::Protocol(message)) => (StatusCode::BAD_REQUEST, message.clone()),
            _ => {
                tracing::error!("request failed: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        }
    };
    json_response(status, &Value::String(message))
}

async fn read_multipart(
    server: &ActionServer,
    req: Request<hyper::body::Incoming>,
) -> Result<(Value, Vec<UploadPart>)> {
    let boundary = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|content_type| multer::parse_boundary(content_type).ok())
        .ok_or_else(|| AbortRequest::new(400, "Bad request"))?;
    let frames = http_body_util::BodyStream::new(req.into_body()).filter_map(|frame| async move {
        match frame {
            Ok(frame) => frame.into_data().ok().map(Ok),
            Err(err) => Some(Err(err)),
        }
    });
    let mut multipart = multer::Multipart::new(frames, boundary);

    let mut params: Option<Value> = None;
    let mut parts: Vec<UploadPart> = Vec::new();
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "params" && field.file_name().is_none() {
            let text = field.text().await?;
            params =
                Some(serde_json::from_str(&text).map_err(|_| AbortRequest::new(400, "Bad request"))?);
            continue;
        }
        // file part: stream it into a guarded temp next to nothing it could
        // name-leak from
        let temp = TempPath::in_dir(server.tmp_dir());
        let mut file = tokio::fs::File::create(temp.path())
            .await
            .with_context(|| format!("cannot stage upload at {:?}", temp.path()))?;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        parts.push(UploadPart { name, temp });
    }
    let params = params.ok_or_else(|| AbortRequest::new(400, "Bad request"))?;
    Ok((params, parts))
}

async fn download_response(path: &std::path::Path) -> Result<Response<ResponseBody>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {path:?} for download"))?;
    let stream = tokio_util::io::ReaderStream::new(file).map_ok(Frame::data);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
        .body(BodyExt::boxed(StreamBody::new(stream)))
        .expect("static response headers are valid"))
}

async fn process(
    server: &ActionServer,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<ResponseBody>> {
    let (params, parts) = read_multipart(server, req).await?;
    let response = server.dispatch(&params, &parts).await;
    // the staged parts are done after dispatch either way
    drop(parts);
    match response? {
        ActionResponse::Json(value) => Ok(json_response(StatusCode::OK, &value)),
        ActionResponse::FileDownload(path) => download_response(&path).await,
    }
}

async fn handle(
    server: std::sync::Arc<ActionServer>,
    req: Request<hyper::body::Incoming>,
) -> Response<ResponseBody> {
    if req.method() != Method::POST {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(full_body("Bad request"))
            .expect("static response headers are valid");
    }
    match process(&server, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

/// Accept connections until `shutdown` fires; every connection is served on
/// its own task.
pub async fn serve(
    server: std::sync::Arc<ActionServer>,
    listener: tokio::net::TcpListener,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<()> {
    tracing::info!("listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                let server = server.clone();
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |req| {
                        let server = server.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(handle(server, req).await)
                        }
                    });
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        tracing::debug!("connection from {peer} ended: {err}");
                    }
                });
            }
        }
    }
    tracing::info!("server shut down");
    Ok(())
}
