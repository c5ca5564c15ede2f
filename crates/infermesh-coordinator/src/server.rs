//! HTTP/1.1 accept loop for the coordinator's front door.

use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{
    debug,
    error,
    info,
};

use crate::router::Router;

/// Serves until `shutdown` is notified; each connection runs on its own
/// task.
pub async fn serve(router: Arc<Router>, listener: TcpListener, shutdown: Arc<Notify>) {
    info!(addr = ?listener.local_addr().ok(), "coordinator listening");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "accepted connection");
        let router = router.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { router.handle(req).await }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!(error = %e, "connection closed with error");
            }
        });
    }
    info!("coordinator accept loop stopped");
}
