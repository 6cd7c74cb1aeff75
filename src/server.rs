//! HTTP serving shared by the components: request routing for the
//! StoreAPI and the receive ingest path, health endpoints, JSON error
//! bodies and graceful shutdown.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Error;
use futures::future::BoxFuture;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use prost::Message;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::receive::{Hashring, Receiver};
use crate::shipper::Shipper;
use crate::store::proto;
use crate::store::{BucketStore, StoreError};

pub type HttpHandler =
    Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, Response<Body>> + Send + Sync>;

/// `{"status":"error","errorType":...,"error":...}` body per the query
/// protocol.
pub fn json_error(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = json!({
        "status": "error",
        "errorType": error_type,
        "error": message,
    });
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn proto_response<M: Message>(msg: &M) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/x-protobuf")
        .body(Body::from(msg.encode_to_vec()))
        .unwrap()
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    Response::builder().status(status).body(Body::from(text)).unwrap()
}

fn retry_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let mut response = json_error(status, error_type, message);
    response
        .headers_mut()
        .insert(hyper::header::RETRY_AFTER, hyper::header::HeaderValue::from_static("10"));
    response
}

async fn read_body(req: Request<Body>) -> Result<Vec<u8>, Error> {
    let bytes = hyper::body::to_bytes(req.into_body()).await?;
    Ok(bytes.to_vec())
}

macro_rules! make_service {
    ($handler:expr) => {{
        let handler = $handler;
        make_service_fn(move |_conn| {
            let handler = Arc::clone(&handler);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handler(req).await) }
                }))
            }
        })
    }};
}

/// Serve until the token fires; in-flight requests drain.
pub async fn run_server(
    addr: SocketAddr,
    handler: HttpHandler,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let server = hyper::Server::try_bind(&addr)?.serve(make_service!(handler));
    log::info!("listening on {}", addr);
    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Bind and serve in the background, returning the bound address. Used by
/// components that need the ephemeral port (and by tests).
pub fn spawn_server(
    addr: SocketAddr,
    handler: HttpHandler,
    shutdown: CancellationToken,
) -> Result<SocketAddr, Error> {
    let server = hyper::Server::try_bind(&addr)?.serve(make_service!(handler));
    let local_addr = server.local_addr();
    tokio::spawn(async move {
        if let Err(err) = server
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            log::error!("server on {} failed: {}", local_addr, err);
        }
    });
    Ok(local_addr)
}

/// Handler for a storage gateway node: StoreAPI plus health endpoints.
pub fn store_handler(store: Arc<BucketStore>, ready: Arc<AtomicBool>) -> HttpHandler {
    Arc::new(move |req| {
        let store = Arc::clone(&store);
        let ready = Arc::clone(&ready);
        Box::pin(async move { handle_store(store, ready, req).await })
    })
}

async fn handle_store(
    store: Arc<BucketStore>,
    ready: Arc<AtomicBool>,
    req: Request<Body>,
) -> Response<Body> {
    match (req.method().clone(), req.uri().path().to_string().as_str()) {
        (Method::GET, "/-/healthy") => text_response(StatusCode::OK, "OK"),
        (Method::GET, "/-/ready") => {
            if ready.load(Ordering::SeqCst) {
                text_response(StatusCode::OK, "OK")
            } else {
                retry_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "not ready")
            }
        }
        (Method::GET, "/api/v1/store/info") => proto_response(&store.info().await),
        (Method::POST, "/api/v1/store/series") => {
            let body = match read_body(req).await {
                Ok(body) => body,
                Err(err) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_data", &err.to_string())
                }
            };
            let request = match proto::SeriesRequest::decode(&body[..]) {
                Ok(request) => request,
                Err(err) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_data", &err.to_string())
                }
            };
            match store.series(&request).await {
                Ok((series, warnings)) => {
                    let mut frames = Vec::new();
                    for s in series {
                        frames.extend_from_slice(&proto::encode_frame(
                            &proto::SeriesResponse::series(s),
                        ));
                    }
                    for warning in warnings {
                        frames.extend_from_slice(&proto::encode_frame(
                            &proto::SeriesResponse::warning(warning),
                        ));
                    }
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(hyper::header::CONTENT_TYPE, "application/x-protobuf-stream")
                        .body(Body::from(frames))
                        .unwrap()
                }
                Err(StoreError::ResourceExhausted(msg)) => {
                    json_error(StatusCode::TOO_MANY_REQUESTS, "exhausted-resources", &msg)
                }
                Err(StoreError::Other(err)) => {
                    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string())
                }
            }
        }
        (Method::POST, "/api/v1/store/label_names") => {
            let request = match read_body(req)
                .await
                .and_then(|b| proto::LabelNamesRequest::decode(&b[..]).map_err(Error::from))
            {
                Ok(request) => request,
                Err(err) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_data", &err.to_string())
                }
            };
            match store.label_names(&request).await {
                Ok(response) => proto_response(&response),
                Err(err) => {
                    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string())
                }
            }
        }
        (Method::POST, "/api/v1/store/label_values") => {
            let request = match read_body(req)
                .await
                .and_then(|b| proto::LabelValuesRequest::decode(&b[..]).map_err(Error::from))
            {
                Ok(request) => request,
                Err(err) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_data", &err.to_string())
                }
            };
            match store.label_values(&request).await {
                Ok(response) => proto_response(&response),
                Err(err) => {
                    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string())
                }
            }
        }
        _ => json_error(StatusCode::NOT_FOUND, "not_found", "unknown endpoint"),
    }
}

/// Shared state of a receiver node's HTTP surface.
pub struct ReceiverServer {
    pub receiver: Arc<Receiver>,
    pub shipper: Arc<Shipper>,
    pub hashring_path: std::path::PathBuf,
}

impl ReceiverServer {
    async fn reload(&self) -> Result<(), Error> {
        let new_ring = Hashring::load(&self.hashring_path)?;
        let now_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let shipper = Arc::clone(&self.shipper);
        self.receiver
            .reload_hashring(new_ring, now_ms, move || async move {
                shipper.ship_once().await.map(|_| ())
            })
            .await
    }
}

/// Handler for a receiver node: ingest, health, readiness, reload.
pub fn receive_handler(server: Arc<ReceiverServer>) -> HttpHandler {
    Arc::new(move |req| {
        let server = Arc::clone(&server);
        Box::pin(async move { handle_receive(server, req).await })
    })
}

async fn handle_receive(server: Arc<ReceiverServer>, req: Request<Body>) -> Response<Body> {
    match (req.method().clone(), req.uri().path().to_string().as_str()) {
        (Method::GET, "/-/healthy") => text_response(StatusCode::OK, "OK"),
        (Method::GET, "/-/ready") => {
            if server.receiver.writer().ready() {
                text_response(StatusCode::OK, "OK")
            } else {
                retry_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "not ready")
            }
        }
        (Method::POST, "/-/reload") => match server.reload().await {
            Ok(()) => text_response(StatusCode::OK, "OK"),
            Err(err) => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string())
            }
        },
        (Method::POST, "/api/v1/receive") => {
            let tenant = req
                .headers()
                .get(crate::receive::handler::TENANT_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let replica: i64 = req
                .headers()
                .get(crate::receive::handler::REPLICA_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let body = match read_body(req).await {
                Ok(body) => body,
                Err(err) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_data", &err.to_string())
                }
            };
            let request = match proto::WriteRequest::decode(&body[..]) {
                Ok(request) => request,
                Err(err) => {
                    return json_error(StatusCode::BAD_REQUEST, "bad_data", &err.to_string())
                }
            };

            let tenant = server
                .receiver
                .tenant_or_default(tenant.as_deref())
                .to_string();
            match server.receiver.receive(&tenant, replica, &request).await {
                Ok(()) => text_response(StatusCode::OK, ""),
                Err(crate::receive::WriteError::NotReady) => {
                    retry_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "not ready")
                }
                Err(crate::receive::WriteError::Validation(msg)) => {
                    json_error(StatusCode::BAD_REQUEST, "bad_data", &msg)
                }
                Err(crate::receive::WriteError::Conflict(msg)) => {
                    json_error(StatusCode::CONFLICT, "conflict", &msg)
                }
                Err(err @ crate::receive::WriteError::QuorumFailed { .. }) => {
                    retry_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", &err.to_string())
                }
                Err(crate::receive::WriteError::Internal(err)) => {
                    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string())
                }
            }
        }
        _ => json_error(StatusCode::NOT_FOUND, "not_found", "unknown endpoint"),
    }
}
