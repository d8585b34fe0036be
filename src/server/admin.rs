//! HTTP admin interface: thin CRUD over the pool plus a version endpoint.

use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace};

use crate::config::BackendConfig;
use crate::lb::{Backend, BackendCheckConfig, Pool};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// What the admin API reports for one backend
#[derive(Serialize)]
struct BackendView<'a> {
    addr: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    check_config: &'a BackendCheckConfig,
    alive: bool,
}

impl<'a> BackendView<'a> {
    fn from_backend(backend: &'a Backend) -> Self {
        Self {
            addr: &backend.addr,
            username: backend.username.as_deref(),
            password: backend.password.as_deref(),
            check_config: &backend.check_config,
            alive: backend.alive(),
        }
    }
}

/// Bind the admin listener and serve forever
pub async fn listen(pool: Arc<Pool>, addr: String) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .context(format!("failed to bind admin interface on {}", addr))?;

    info!("starting HTTP admin interface on {}", addr);
    serve(pool, listener).await
}

/// Serve the admin API on an already bound listener
pub async fn serve(pool: Arc<Pool>, listener: TcpListener) -> anyhow::Result<()> {
    START_TIME.get_or_init(Instant::now);

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("failed to accept admin connection: {}", e);
                continue;
            }
        };

        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let pool = Arc::clone(&pool);
                async move { route(pool, req).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                // Resets from impatient clients are routine
                let msg = e.to_string();
                if !msg.contains("connection reset") && !msg.contains("broken pipe") {
                    debug!("error serving admin connection from {}: {}", remote, e);
                }
            }
        });
    }
}

async fn route(pool: Arc<Pool>, req: Request<Incoming>) -> Result<Response<BoxBody>, hyper::Error> {
    trace!("{} {}", req.method(), req.uri());

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/all") => list_backends(pool, req.uri().query()),
        (&Method::PUT, "/api/add") => add_backends(pool, req).await,
        (&Method::DELETE, "/api/delete") => remove_backend(pool, req.uri().query()),
        (&Method::GET, "/version") => version(),
        _ => text_response(StatusCode::NOT_FOUND, "not found".to_string()),
    }
}

/// GET /api/all — list all backends, `?healthy=true` filters to healthy only
fn list_backends(
    pool: Arc<Pool>,
    query: Option<&str>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let healthy_only = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .any(|(k, v)| k == "healthy" && matches!(v.as_ref(), "true" | "1"))
        })
        .unwrap_or(false);

    let backends = if healthy_only {
        pool.all_healthy()
    } else {
        pool.all()
    };

    let views: Vec<BackendView<'_>> = backends
        .iter()
        .map(|b| BackendView::from_backend(b.as_ref()))
        .collect();

    json_response(StatusCode::OK, &views)
}

/// PUT /api/add — add one or more backends, failing on the first duplicate
async fn add_backends(
    pool: Arc<Pool>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let body = req.collect().await?.to_bytes();

    let configs: Vec<BackendConfig> = match serde_json::from_slice(&body) {
        Ok(configs) => configs,
        Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    for config in &configs {
        if let Err(e) = pool.add(Backend::from_config(config.clone())) {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    }

    text_response(StatusCode::OK, format!("{} backend(s) added", configs.len()))
}

/// DELETE /api/delete?addr=… — remove a backend by address
fn remove_backend(
    pool: Arc<Pool>,
    query: Option<&str>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let addr = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "addr")
            .map(|(_, v)| v.into_owned())
    });

    let Some(addr) = addr.filter(|a| !a.is_empty()) else {
        return text_response(StatusCode::BAD_REQUEST, "address is empty".to_string());
    };

    trace!("removing backend with address: {}", addr);
    match pool.remove(&addr) {
        Ok(()) => text_response(
            StatusCode::OK,
            format!("backend {} removed successfully", addr),
        ),
        Err(e) => text_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// GET /version — application name, version and uptime
fn version() -> Result<Response<BoxBody>, hyper::Error> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed())
        .unwrap_or_default();

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "name": crate::APP_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": format!("{:?}", uptime),
        }),
    )
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Result<Response<BoxBody>, hyper::Error> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(bytes_body(Bytes::from(body)))
        .unwrap())
}

fn text_response(status: StatusCode, message: String) -> Result<Response<BoxBody>, hyper::Error> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(bytes_body(Bytes::from(message)))
        .unwrap())
}

fn bytes_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
