//! HTTP health probing for freshly started slots.
//!
//! The prober polls the slot's internal port until it answers 200, the
//! process exits, or the deadline passes. The old live slot keeps
//! serving through the proxy for the whole probe window; this is what
//! makes start-before-drain possible.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::Instant;
use tracing::debug;

use crate::process::ExitSignal;

/// Cadence between probe attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Per-request timeout. Each attempt is bounded so a wedged accept
/// queue cannot eat the whole probe budget.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll `GET http://127.0.0.1:<int_port><endpoint>` until healthy.
///
/// Returns `true` on the first HTTP 200. Returns `false` when the exit
/// signal fires (the child died before becoming healthy) or when
/// `budget` elapses.
pub async fn probe(int_port: u16, endpoint: &str, budget: Duration, exit: &ExitSignal) -> bool {
    let url = format!("http://127.0.0.1:{int_port}{endpoint}");
    let Ok(uri) = url.parse::<http::Uri>() else {
        debug!(%url, "invalid health check url");
        return false;
    };

    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let deadline = Instant::now() + budget;

    while Instant::now() < deadline {
        if exit.is_fired() {
            return false;
        }

        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(uri.clone())
            .body(Full::new(Bytes::new()));
        if let Ok(request) = request {
            match tokio::time::timeout(REQUEST_TIMEOUT, client.request(request)).await {
                Ok(Ok(response)) if response.status() == http::StatusCode::OK => return true,
                Ok(Ok(response)) => {
                    debug!(status = %response.status(), %url, "health check not ready");
                }
                Ok(Err(_)) | Err(_) => {}
            }
        }

        tokio::select! {
            () = exit.wait() => return false,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::routing::get;
    use axum::Router;

    use super::*;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn healthy_endpoint_passes() {
        let addr = serve(Router::new().route("/healthz", get(|| async { "ok" }))).await;
        let exit = never_fired();

        assert!(probe(addr.port(), "/healthz", Duration::from_secs(3), &exit).await);
    }

    #[tokio::test]
    async fn non_200_is_unhealthy() {
        let addr = serve(Router::new().route(
            "/healthz",
            get(|| async { (http::StatusCode::SERVICE_UNAVAILABLE, "not yet") }),
        ))
        .await;
        let exit = never_fired();

        assert!(!probe(addr.port(), "/healthz", Duration::from_millis(700), &exit).await);
    }

    #[tokio::test]
    async fn connection_refused_times_out() {
        let port = crate::process::alloc_port().unwrap();
        let exit = never_fired();

        let started = std::time::Instant::now();
        assert!(!probe(port, "/healthz", Duration::from_millis(600), &exit).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn exit_signal_short_circuits_the_probe() {
        let port = crate::process::alloc_port().unwrap();
        let exit = ExitSignal::fired();

        let started = std::time::Instant::now();
        assert!(!probe(port, "/healthz", Duration::from_secs(30), &exit).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    fn never_fired() -> ExitSignal {
        let (notifier, exit) = ExitSignal::arm();
        std::mem::forget(notifier);
        exit
    }
}
