//! Dynamic reverse proxy with a retargetable upstream.
//!
//! A proxy owns one fixed listen address and forwards every request to
//! `http://127.0.0.1:<target>`, where the target port is swapped
//! atomically at promotion time. Requests that arrive while no target
//! is set receive a 503 rather than a connection refusal, so the
//! public port stays answerable from the first deploy to the last.
//!
//! Selected paths can be diverted to an [`Intercept`] capability
//! before any forwarding happens; that is the integration seam for the
//! chat/agent subsystem, which lives outside this crate.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Future returned by an [`Intercept`] implementation.
pub type InterceptFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Capability for answering selected requests in place of the
/// upstream.
///
/// The proxy consults the intercept for `/chat`, `/chat/...` and
/// `/agent/...` requests; everything else is forwarded untouched.
pub trait Intercept: Send + Sync {
    /// Handle an intercepted request.
    fn handle(&self, req: Request) -> InterceptFuture;
}

type ProxyClient = Client<HttpConnector, Body>;

/// State shared between the proxy handle and its serve task.
struct ProxyShared {
    /// Upstream port; 0 means "no live slot".
    target: RwLock<u16>,
    intercept: Option<Arc<dyn Intercept>>,
    client: ProxyClient,
}

/// Listener lifecycle, guarded separately from the hot target word.
#[derive(Default)]
struct ListenerState {
    /// Stop signal and join handle of the serve task.
    serving: Option<(watch::Sender<bool>, tokio::task::JoinHandle<()>)>,
}

/// A reverse proxy whose upstream can be retargeted at runtime.
pub struct DynamicProxy {
    addr: Option<SocketAddr>,
    shared: Arc<ProxyShared>,
    listener: Mutex<ListenerState>,
}

impl DynamicProxy {
    /// Create a proxy for `addr`. With `addr = None` the proxy only
    /// tracks its target and never listens (used when the internal
    /// port is not distinct from the public one).
    #[must_use]
    pub fn new(addr: Option<SocketAddr>, intercept: Option<Arc<dyn Intercept>>) -> Self {
        Self {
            addr,
            shared: Arc::new(ProxyShared {
                target: RwLock::new(0),
                intercept,
                client: Client::builder(TokioExecutor::new()).build_http(),
            }),
            listener: Mutex::new(ListenerState::default()),
        }
    }

    /// Ensure the listener is bound and serving. Idempotent; a no-op
    /// when no address is configured.
    ///
    /// Called at daemon startup so the public port answers (with 503)
    /// even before the first successful deploy, and again by
    /// [`set_target`](Self::set_target) for good measure.
    pub async fn start(&self) {
        let Some(addr) = self.addr else { return };

        let mut state = self.listener.lock().await;
        if state.serving.is_some() {
            return;
        }

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%addr, %err, "proxy failed to bind");
                return;
            }
        };
        info!(%addr, "proxy listening");

        let (tx, mut rx) = watch::channel(false);
        let app = Router::new()
            .fallback(forward)
            .with_state(Arc::clone(&self.shared));
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = rx.wait_for(|stop| *stop).await;
            });
            if let Err(err) = serve.await {
                warn!(%err, "proxy serve error");
            }
        });
        state.serving = Some((tx, task));
    }

    /// Point the proxy at a new upstream port. Nonzero targets also
    /// lazily start the listener.
    pub async fn set_target(&self, port: u16) {
        *self.shared.target.write() = port;
        if port > 0 {
            self.start().await;
        }
    }

    /// Clear the upstream. The listener stays up; requests receive 503
    /// until the next [`set_target`](Self::set_target).
    pub fn clear_target(&self) {
        *self.shared.target.write() = 0;
    }

    /// Current upstream port; 0 when cleared.
    #[must_use]
    pub fn target(&self) -> u16 {
        *self.shared.target.read()
    }

    /// Stop the listener and clear the target. Waits for the serve
    /// task to finish so the port is free when this returns.
    pub async fn shutdown(&self) {
        *self.shared.target.write() = 0;
        let mut state = self.listener.lock().await;
        if let Some((tx, task)) = state.serving.take() {
            let _ = tx.send(true);
            let _ = task.await;
        }
    }
}

/// Whether a request path belongs to the intercept seam: exactly
/// `/chat`, or anything under `/chat/` or `/agent/`.
#[must_use]
pub fn is_intercept_path(path: &str) -> bool {
    path == "/chat" || path.starts_with("/chat/") || path.starts_with("/agent/")
}

/// Proxy request handler: intercept check, then streaming pass-through
/// to the current target.
async fn forward(State(shared): State<Arc<ProxyShared>>, req: Request) -> Response {
    if let Some(intercept) = &shared.intercept {
        if is_intercept_path(req.uri().path()) {
            return intercept.handle(req).await;
        }
    }

    let port = *shared.target.read();
    if port == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "no live slot\n").into_response();
    }

    let (mut parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let uri = format!("http://127.0.0.1:{port}{path_and_query}");
    parts.uri = match uri.parse() {
        Ok(uri) => uri,
        Err(err) => {
            debug!(%uri, %err, "unroutable request uri");
            return (StatusCode::BAD_GATEWAY, "bad upstream uri\n").into_response();
        }
    };

    match shared.client.request(Request::from_parts(parts, body)).await {
        // Stream the upstream body through untouched; buffering here
        // would break SSE and long downloads.
        Ok(response) => response.map(Body::new).into_response(),
        Err(err) => {
            debug!(port, %err, "upstream request failed");
            (StatusCode::BAD_GATEWAY, "upstream unreachable\n").into_response()
        }
    }
}
