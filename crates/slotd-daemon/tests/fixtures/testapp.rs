//! Minimal HTTP app the deployment pipeline boots in tests.
//!
//! Mirrors how a real app behaves under the daemon: reads `PORT` and
//! `INTERNAL_PORT` from the environment, serves a public endpoint that
//! reports the checked-out version, and an internal endpoint with the
//! health check and a crash control. Env knobs let tests simulate
//! unhealthy starts, slow boots, and processes that refuse to die:
//!
//! - `TESTAPP_UNHEALTHY=1`     - /healthz answers 503
//! - `TESTAPP_BOOT_DELAY_MS=N` - wait before binding the listeners
//! - `TESTAPP_IGNORE_TERM=1`   - ignore SIGTERM (dies only to SIGKILL)
//!
//! Compiled standalone with `rustc` by the test harness; std only.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

extern "C" {
    fn signal(signum: i32, handler: usize) -> usize;
}

const SIGTERM: i32 = 15;
const SIG_IGN: usize = 1;

fn env_port(key: &str) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn truthy(key: &str) -> bool {
    matches!(std::env::var(key).ok().as_deref(), Some("1") | Some("true"))
}

fn main() {
    if truthy("TESTAPP_IGNORE_TERM") {
        unsafe {
            signal(SIGTERM, SIG_IGN);
        }
    }

    if let Ok(ms) = std::env::var("TESTAPP_BOOT_DELAY_MS") {
        if let Ok(ms) = ms.parse::<u64>() {
            thread::sleep(Duration::from_millis(ms));
        }
    }

    let port = env_port("PORT");
    let int_port = env_port("INTERNAL_PORT");
    if port == 0 || int_port == 0 {
        eprintln!("error: PORT and INTERNAL_PORT required");
        std::process::exit(2);
    }

    let unhealthy = truthy("TESTAPP_UNHEALTHY");

    thread::spawn(move || {
        serve(int_port, move |path| match path {
            "/healthz" => {
                if unhealthy {
                    (503, "unhealthy".to_string())
                } else {
                    (200, "ok".to_string())
                }
            }
            "/control/crash" => {
                thread::spawn(|| {
                    thread::sleep(Duration::from_millis(50));
                    std::process::exit(1);
                });
                (200, "crashing".to_string())
            }
            _ => (404, "not found".to_string()),
        });
    });

    serve(port, |_path| {
        let version = std::fs::read_to_string("version.txt").unwrap_or_default();
        (
            200,
            format!(
                "{{\"status\":\"ok\",\"version\":\"{}\"}}",
                version.trim()
            ),
        )
    });
}

fn serve(port: u16, handler: impl Fn(&str) -> (u16, String)) {
    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: bind {port}: {err}");
            std::process::exit(2);
        }
    };

    for stream in listener.incoming() {
        if let Ok(mut stream) = stream {
            handle(&mut stream, &handler);
        }
    }
}

fn handle(stream: &mut TcpStream, handler: &impl Fn(&str) -> (u16, String)) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 64 * 1024 {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let path = head
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/");

    let (status, body) = handler(path);
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "OK",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}
