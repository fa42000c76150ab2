use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use owo_colors::OwoColorize;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serves `/healthz`, `/readyz` and `/metrics` off the given registry until `shutdown`
/// is cancelled. One registry per process; the operator binary registers its
/// collectors on it before calling this.
pub async fn serve(port: u16, registry: Registry, shutdown: CancellationToken) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", format!("🛑 failed to bind metrics server to {addr}: {e}").red());
            return;
        }
    };
    println!("{}", format!("📈 metrics server listening on {addr}").green());
    let registry = Arc::new(registry);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                println!("{}", "🛑 metrics server shutting down".red());
                return;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        eprintln!("{}", format!("metrics accept error: {e}").yellow());
                        continue;
                    }
                };
                let registry = registry.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let registry = registry.clone();
                        async move { Ok::<_, std::convert::Infallible>(handle(req, &registry)) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        eprintln!("{}", format!("metrics connection error: {e}").yellow());
                    }
                });
            }
        }
    }
}

fn handle(req: Request<hyper::body::Incoming>, registry: &Registry) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
        "/metrics" => {
            let metric_families = registry.gather();
            let mut buf = Vec::new();
            TextEncoder::new()
                .encode(&metric_families, &mut buf)
                .expect("encode prometheus metrics");
            Response::new(Full::new(Bytes::from(buf)))
        }
        _ => Response::builder()
            .status(hyper::StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("build 404 response"),
    }
}
