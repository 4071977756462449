//! Raw streaming endpoints over the daemon's unix socket.
//!
//! bollard decodes log frames into its own types before handing them over;
//! the engine's wire contract wants the multiplexed byte stream itself, so
//! the two streaming endpoints (container logs, exec output) are read with
//! a plain HTTP/1.1 connection and fed through [`StreamDemuxer`].

use std::path::{Path, PathBuf};

use http::{Method, Request, header};
use hyper::Body;
use hyper::body::HttpBody;
use hyper::client::conn;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::LogChunk;
use super::demux::StreamDemuxer;
use super::error::DockerError;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Socket the daemon listens on, honoring a `unix://` `DOCKER_HOST`.
pub(crate) fn default_socket_path() -> PathBuf {
    match std::env::var("DOCKER_HOST") {
        Ok(host) if host.starts_with("unix://") => {
            PathBuf::from(host.trim_start_matches("unix://"))
        }
        _ => PathBuf::from(DEFAULT_SOCKET),
    }
}

/// Follow-mode log request for a container.
pub(crate) fn logs_request(container_id: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(format!(
            "/containers/{container_id}/logs?stdout=true&stderr=true&follow=true"
        ))
        .header(header::HOST, "docker")
        .body(Body::empty())
        .expect("request from static parts")
}

/// Attached start of a created exec instance.
pub(crate) fn exec_start_request(exec_id: &str) -> Request<Body> {
    let payload = serde_json::json!({ "Detach": false, "Tty": false });
    Request::builder()
        .method(Method::POST)
        .uri(format!("/exec/{exec_id}/start"))
        .header(header::HOST, "docker")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request from static parts")
}

/// Issues `request` against the daemon socket and forwards every decoded
/// log frame into `logs`. A dropped receiver ends the read without error;
/// transport and daemon failures surface as [`DockerError`].
pub(crate) async fn stream_demuxed(
    socket_path: &Path,
    request: Request<Body>,
    logs: &mpsc::Sender<LogChunk>,
) -> Result<(), DockerError> {
    let stream = UnixStream::connect(socket_path).await?;
    let (mut sender, connection) = conn::handshake(stream)
        .await
        .map_err(|e| DockerError::Api(e.to_string()))?;
    let connection_task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "daemon stream connection ended with error");
        }
    });

    let result = read_response(&mut sender, request, logs).await;
    connection_task.abort();
    result
}

async fn read_response(
    sender: &mut conn::SendRequest<Body>,
    request: Request<Body>,
    logs: &mpsc::Sender<LogChunk>,
) -> Result<(), DockerError> {
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| DockerError::Api(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        let message = String::from_utf8_lossy(&body).trim().to_string();
        return Err(if status.as_u16() == 404 {
            DockerError::NotFound(message)
        } else {
            DockerError::Api(format!("{status}: {message}"))
        });
    }

    let mut body = response.into_body();
    let mut demuxer = StreamDemuxer::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| DockerError::Api(e.to_string()))?;
        for frame in demuxer.push(&chunk) {
            if logs.send(frame).await.is_err() {
                // Consumer abandoned the run; nothing left to deliver.
                return Ok(());
            }
        }
    }
    if let Some(tail) = demuxer.finish() {
        let _ = logs.send(tail).await;
    }
    Ok(())
}
