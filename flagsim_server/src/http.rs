//! HTTP API for the configuration UI.
//!
//! Routes:
//! - `GET  /health` → liveness probe
//! - `POST /simulation/start` → validate config, start a run
//! - `POST /simulation/stop` → stop a run
//! - `GET  /simulation/status?session_id=` → session snapshot
//! - `GET  /simulation/logs?session_id=&limit=&skip=` → log page

use bytes::Bytes;
use flagsim_core::{EngineError, SimulationConfig, SimulationController};
use flagsim_env::TokioContext;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const DEFAULT_LOG_LIMIT: usize = 100;

type Controller = Arc<SimulationController<TokioContext>>;

/// Accepts connections forever, serving each over HTTP/1.1.
pub async fn serve(listen: &str, controller: Controller) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "http api listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "failed to accept http connection");
                continue;
            }
        };
        debug!(%peer, "http connection accepted");

        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(Arc::clone(&controller), req));
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!(%err, "http connection closed with error");
            }
        });
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    /// Client-generated session token; the server issues one if absent
    session_id: Option<String>,
    config: SimulationConfig,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct StartResponse<T: Serialize> {
    accepted: bool,
    session_id: String,
    status: T,
}

async fn handle(
    controller: Controller,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = match (&method, uri.path()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &json!({"status": "healthy", "version": env!("CARGO_PKG_VERSION")}),
        ),
        (&Method::POST, "/simulation/start") => start(&controller, req).await,
        (&Method::POST, "/simulation/stop") => stop(&controller, req).await,
        (&Method::GET, "/simulation/status") => status(&controller, &uri),
        (&Method::GET, "/simulation/logs") => logs(&controller, &uri),
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn start(controller: &Controller, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let request: StartRequest = match read_json(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    let session_id = request
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match controller.start(&session_id, request.config).await {
        Ok(status) => json_response(
            StatusCode::OK,
            &StartResponse {
                accepted: true,
                session_id,
                status,
            },
        ),
        Err(err) => engine_error_response(&err),
    }
}

async fn stop(controller: &Controller, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let request: StopRequest = match read_json(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    let status = controller.stop(&request.session_id).await;
    json_response(StatusCode::OK, &json!({"stopped": true, "status": status}))
}

fn status(controller: &Controller, uri: &Uri) -> Response<Full<Bytes>> {
    let Some(session_id) = query_param(uri, "session_id") else {
        return error_response(StatusCode::BAD_REQUEST, "missing session_id");
    };
    json_response(StatusCode::OK, &controller.status(&session_id))
}

fn logs(controller: &Controller, uri: &Uri) -> Response<Full<Bytes>> {
    let Some(session_id) = query_param(uri, "session_id") else {
        return error_response(StatusCode::BAD_REQUEST, "missing session_id");
    };
    let limit = query_param(uri, "limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_LOG_LIMIT);
    let skip = query_param(uri, "skip")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    json_response(StatusCode::OK, &controller.logs(&session_id, limit, skip))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|err| {
            error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read body: {err}"),
            )
        })?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {err}")))
}

fn engine_error_response(err: &EngineError) -> Response<Full<Bytes>> {
    let status = match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Resolution(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({"error": message}))
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}
