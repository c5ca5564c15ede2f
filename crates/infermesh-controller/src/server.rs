//! Controller HTTP surface: fault-signal ingestion from ClusterD and node
//! registration from workers.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{
    BodyExt,
    Full,
};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use infermesh_commons::models::fault_wire::FaultMsgSignal;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{
    debug,
    error,
    info,
    warn,
};

use crate::node_status::{
    NodeInfo,
    NodeStatus,
};
use crate::recovery::NpuRecoveryManager;

type Body = BoxBody<Bytes, Infallible>;

pub struct ControllerServer {
    node_status: Arc<NodeStatus>,
    recovery: Arc<NpuRecoveryManager>,
}

impl ControllerServer {
    pub fn new(node_status: Arc<NodeStatus>, recovery: Arc<NpuRecoveryManager>) -> Self {
        Self {
            node_status,
            recovery,
        }
    }

    async fn handle(
        self: Arc<Self>, req: http::Request<hyper::body::Incoming>,
    ) -> Result<http::Response<Body>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(%path, error = %e, "failed to read request body");
                return Ok(respond(StatusCode::BAD_REQUEST, "invalid body"));
            }
        };
        match (method.as_str(), path.as_str()) {
            ("POST", "/v1/fault-signal") => {
                let msg: FaultMsgSignal = match serde_json::from_slice(&body) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "invalid fault signal");
                        return Ok(respond(StatusCode::BAD_REQUEST, "invalid fault signal"));
                    }
                };
                self.recovery.process_fault_message(&msg).await;
                Ok(respond(StatusCode::OK, "{\"result\":\"ok\"}"))
            }
            ("POST", "/v1/register-node") => {
                let node: NodeInfo = match serde_json::from_slice(&body) {
                    Ok(node) => node,
                    Err(e) => {
                        warn!(error = %e, "invalid node registration");
                        return Ok(respond(StatusCode::BAD_REQUEST, "invalid node info"));
                    }
                };
                info!(id = node.id, ip = %node.ip, "node registered");
                self.node_status.upsert(node);
                Ok(respond(StatusCode::OK, "{\"result\":\"ok\"}"))
            }
            _ => Ok(respond(StatusCode::NOT_FOUND, "not found")),
        }
    }
}

fn respond(status: StatusCode, body: &str) -> http::Response<Body> {
    let mut response = http::Response::new(Full::new(Bytes::from(body.to_string())).boxed());
    *response.status_mut() = status;
    response
}

pub async fn serve(server: Arc<ControllerServer>, listener: TcpListener, shutdown: Arc<Notify>) {
    info!(addr = ?listener.local_addr().ok(), "controller listening");
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
        let server = server.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| server.clone().handle(req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!(error = %e, "connection closed with error");
            }
        });
    }
    info!("controller accept loop stopped");
}
