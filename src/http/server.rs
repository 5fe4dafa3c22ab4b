//! HTTP listener for the trigger endpoint

use super::handler::{self, AppState};
use crate::error::Result;
use crate::jobs::shutdown_requested;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

/// Accepts connections until `shutdown` flips to `true`
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!("Listening on http://{}", listener.local_addr()?);

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown_requested(&mut shutdown) => {
                info!("HTTP listener shutting down");
                return Ok(());
            }
        };

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let state = Arc::clone(&state);
                async move { respond(req, &state).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection error from {remote_addr}: {e}");
            }
        });
    }
}

async fn respond(
    req: Request<Incoming>,
    state: &AppState,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    debug!("{} {}", req.method(), path);

    let api = handler::handle(state, req.method(), &path).await;
    let body = serde_json::to_vec(&api.body).unwrap_or_default();

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = api.status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}
