//! Forwarding engine: owns the connection pool handlers for prefill, decode,
//! single-node and tokenizer traffic, dispatches routes picked by the
//! scheduler and runs the registered exception recovery paths.

mod control;
mod decode;
mod prefill;
mod single;

use std::sync::{
    Arc,
    Weak,
};

use http::StatusCode;
use infermesh_cluster::ClusterNodes;
use infermesh_commons::models::cluster_wire::InstanceRole;
use infermesh_commons::utils::config::CoordinatorConfig;
use infermesh_transport::{
    ClientConnection,
    ClientHandler,
    ConnectionPool,
    HandlerKind,
    HttpRequest,
};
use tracing::{
    error,
    info,
    warn,
};

use crate::agent::ReqState;
use crate::exception::{
    ExceptionMonitor,
    InsException,
};
use crate::manager::ReqManager;
use crate::scheduler::{
    RouteSink,
    Scheduler,
};

pub(crate) const CONNECT_P_FAILED: &str = "Connect to p instance failed\r\n";
pub(crate) const SEND_P_FAILED: &str = "Send message to p instance failed\r\n";
pub(crate) const READ_P_FAILED: &str = "Read message from p instance failed\r\n";
pub(crate) const P_INSTANCE_ERROR: &str = "P instance error\r\n";
pub(crate) const CONNECT_SERVER_FAILED: &str = "Connect to MindIE-Server failed\r\n";
pub(crate) const SEND_INSTANCE_FAILED: &str = "Send message to instance failed\r\n";
pub(crate) const READ_INSTANCE_FAILED: &str = "Read message from instance failed\r\n";
pub(crate) const RETRY_FAILED: &str = "Request retry failed\r\n";

/// Forward attempts per dispatch before the request is failed.
pub(crate) const DISPATCH_ATTEMPTS: usize = 4;

macro_rules! bind {
    ($weak:expr, $method:ident) => {{
        let weak = $weak.clone();
        move |conn: Arc<ClientConnection>| {
            let weak = weak.clone();
            async move {
                if let Some(repeater) = weak.upgrade() {
                    repeater.$method(conn).await;
                }
            }
        }
    }};
}

pub(crate) struct Handlers {
    pub(crate) p: ClientHandler,
    pub(crate) d: ClientHandler,
    pub(crate) single: ClientHandler,
    pub(crate) tokenizer: ClientHandler,
}

impl Handlers {
    fn build(weak: &Weak<Repeater>) -> Self {
        let mut p = ClientHandler::new();
        p.register(HandlerKind::Req, bind!(weak, p_send_handler));
        p.register(HandlerKind::ReqError, bind!(weak, p_send_error_handler));
        p.register(HandlerKind::Res, bind!(weak, p_res_handler));
        p.register(HandlerKind::HeaderResError, bind!(weak, p_res_error_handler));

        let mut d = ClientHandler::new();
        d.register(HandlerKind::ReqError, bind!(weak, d_send_error_handler));
        d.register(HandlerKind::HeaderResError, bind!(weak, d_res_error_handler));
        d.register(HandlerKind::ChunkBodyRes, bind!(weak, d_res_chunk_handler));
        d.register(HandlerKind::ChunkBodyResError, bind!(weak, d_res_error_handler));

        let mut single = ClientHandler::new();
        single.register(HandlerKind::Req, bind!(weak, single_send_handler));
        single.register(HandlerKind::ReqError, bind!(weak, single_send_error_handler));
        single.register(HandlerKind::Res, bind!(weak, single_res_handler));
        single.register(HandlerKind::HeaderResError, bind!(weak, single_res_error_handler));
        single.register(HandlerKind::ChunkBodyRes, bind!(weak, single_res_chunk_handler));
        single.register(
            HandlerKind::ChunkBodyResError,
            bind!(weak, single_res_error_handler),
        );

        let mut tokenizer = ClientHandler::new();
        tokenizer.register(HandlerKind::Req, bind!(weak, tokenizer_req_handler));
        tokenizer.register(HandlerKind::ReqError, bind!(weak, tokenizer_req_err_handler));
        tokenizer.register(HandlerKind::Res, bind!(weak, tokenizer_res_handler));
        tokenizer.register(HandlerKind::HeaderResError, bind!(weak, tokenizer_res_err_handler));

        Self {
            p,
            d,
            single,
            tokenizer,
        }
    }
}

pub struct Repeater {
    pub(crate) cfg: Arc<CoordinatorConfig>,
    pub(crate) cluster: Arc<ClusterNodes>,
    pub(crate) manager: Arc<ReqManager>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) exception: Arc<ExceptionMonitor>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) http: reqwest::Client,
    pub(crate) handlers: Handlers,
}

impl Repeater {
    pub fn new(
        cfg: Arc<CoordinatorConfig>, cluster: Arc<ClusterNodes>, manager: Arc<ReqManager>,
        scheduler: Arc<dyn Scheduler>, exception: Arc<ExceptionMonitor>,
        pool: Arc<ConnectionPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            cfg,
            cluster,
            manager,
            scheduler,
            exception,
            pool,
            http: reqwest::Client::new(),
            handlers: Handlers::build(weak),
        })
    }

    /// PD-separated dispatch: forwards the request to the chosen prefill
    /// instance, carrying the decode target in the forwarding headers.
    pub async fn pd_route_handler(self: &Arc<Self>, req_id: String, prefill: u64, decode: u64) {
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "pd routing skipped, request is gone");
            return;
        };
        if agent.is_ended() {
            warn!(req_id, "pd routing skipped, request already ended");
            return;
        }
        self.manager.update_state(&req_id, ReqState::Scheduled);

        let p_ip = self.cluster.ip(prefill).unwrap_or_default();
        let p_port = self.cluster.port(prefill).unwrap_or_default();
        let d_ip = self.cluster.ip(decode).unwrap_or_default();
        let d_port = self.cluster.port(decode).unwrap_or_default();
        let inter_comm = self.cluster.inter_comm_port(decode).unwrap_or_default();
        let d_target = if inter_comm.is_empty() {
            d_ip.clone()
        } else {
            format!("{d_ip};{inter_comm}")
        };
        // Same address for P and D means the Flex forwards to itself; that
        // path behaves like a single mixed instance.
        let flex_self = p_ip == d_ip && p_port == d_port;
        let (handler, err_kind) = if flex_self {
            (self.handlers.single.clone(), InsException::ConnMixErr)
        } else {
            (self.handlers.p.clone(), InsException::ConnPErr)
        };
        info!(req_id, %p_ip, %p_port, %d_ip, %d_port, "dispatching pd route");

        let mut req = agent.req();
        req.set_header("req-type", "prefill");
        req.set_header("req-id", &req_id);
        req.set_header("d-target", &d_target);
        req.set_header("d-port", &d_port);
        agent.set_req(req.clone());

        for attempt in 1..=DISPATCH_ATTEMPTS {
            if let Some(conn) = self.pool.apply_conn(&p_ip, &p_port, handler.clone(), 0).await {
                agent.set_client_conn(Some(conn.clone()));
                self.manager.set_route(&req_id, [prefill, decode]);
                self.manager.set_route_ip(
                    &req_id,
                    [p_ip.clone(), p_port.clone(), d_ip.clone(), d_port.clone()],
                );
                let model = self.cluster.model_name(prefill).unwrap_or_default();
                self.manager.set_model_name(&req_id, &model);
                conn.send_req(&req, Some(&req_id)).await;
                return;
            }
            warn!(req_id, %p_ip, %p_port, attempt, "connect to prefill instance failed");
        }
        error!(req_id, %p_ip, %p_port, "connect to prefill instance failed, giving up");
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, CONNECT_P_FAILED);
        self.manager.update_state(&req_id, ReqState::Exception);
        self.exception.push_ins(err_kind, prefill);
    }

    /// Single-node dispatch: the chosen instance answers the whole request.
    pub async fn single_node_handler(self: &Arc<Self>, req_id: String, node: u64) {
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "single routing skipped, request is gone");
            return;
        };
        if agent.is_ended() {
            warn!(req_id, "single routing skipped, request already ended");
            return;
        }
        self.manager.update_state(&req_id, ReqState::Scheduled);

        let ip = self.cluster.ip(node).unwrap_or_default();
        let port = self.cluster.port(node).unwrap_or_default();
        info!(req_id, %ip, %port, "dispatching single node route");

        let mut req = agent.req();
        req.set_header("req-id", &req_id);
        agent.set_req(req.clone());

        let tokenizer = agent.kind() == crate::agent::ReqKind::Tokenizer;
        let handler = if tokenizer {
            self.handlers.tokenizer.clone()
        } else {
            self.handlers.single.clone()
        };
        for attempt in 1..=DISPATCH_ATTEMPTS {
            if let Some(conn) = self.pool.apply_conn(&ip, &port, handler.clone(), 0).await {
                agent.set_client_conn(Some(conn.clone()));
                self.manager.set_route(&req_id, [node, 0]);
                conn.send_req(&req, Some(&req_id)).await;
                return;
            }
            warn!(req_id, %ip, %port, attempt, "connect to instance failed");
        }
        error!(req_id, %ip, %port, "connect to instance failed, giving up");
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, CONNECT_SERVER_FAILED);
        self.manager.update_state(&req_id, ReqState::Exception);
        if tokenizer {
            self.exception.push_ins(InsException::ConnTokenErr, node);
        } else {
            self.exception.push_ins(InsException::ConnMixErr, node);
        }
    }

    /// Opens the decode-result long poll toward one decode instance.
    pub async fn link_with_d_node(&self, ip: &str, port: &str) -> bool {
        let mut req = HttpRequest::get("/dresult");
        req.set_header("user-agent", "infermesh-coordinator");
        let Some(conn) = self
            .pool
            .apply_conn(ip, port, self.handlers.d.clone(), 30)
            .await
        else {
            error!(%ip, %port, "failed to apply connection to decode node");
            return false;
        };
        conn.send_req(&req, None).await;
        info!(%ip, %port, "decode result long poll established");
        true
    }

    pub fn check_link_with_d_node(&self, ip: &str, port: &str) -> bool {
        self.pool.find_conn(ip, port).is_some()
    }

    /// Makes sure every decode instance has a live `/dresult` long poll.
    pub async fn create_links_with_d_nodes(&self) {
        for (id, info) in self.cluster.all_infos() {
            if info.role != InstanceRole::Decode {
                continue;
            }
            if self.check_link_with_d_node(&info.ip, &info.port) {
                continue;
            }
            let mut linked = false;
            for _ in 0..=self.cfg.max_retry {
                if self.link_with_d_node(&info.ip, &info.port).await {
                    linked = true;
                    break;
                }
            }
            if !linked {
                error!(id, ip = %info.ip, port = %info.port, "add link with decode node failed");
            }
        }
    }
}

/// Adapter handed to the scheduler; routes come back through spawned tasks
/// so scheduler callbacks never block on forwarding I/O.
pub struct RepeaterRouteSink(pub Arc<Repeater>);

impl RouteSink for RepeaterRouteSink {
    fn pd_route(&self, req_id: &str, prefill: u64, decode: u64) {
        let repeater = self.0.clone();
        let req_id = req_id.to_string();
        tokio::spawn(async move {
            repeater.pd_route_handler(req_id, prefill, decode).await;
        });
    }

    fn single_route(&self, req_id: &str, node: u64) {
        let repeater = self.0.clone();
        let req_id = req_id.to_string();
        tokio::spawn(async move {
            repeater.single_node_handler(req_id, node).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use infermesh_commons::utils::config::DeployMode;
    use infermesh_transport::PoolConfig;

    use super::*;
    use crate::agent::{
        ReqAgent,
        ReqKind,
    };
    use crate::reply::ServerReply;
    use crate::scheduler::LeastTaskScheduler;

    fn build_repeater() -> Arc<Repeater> {
        let cfg = Arc::new(CoordinatorConfig {
            str_token_rate: 2.0,
            ..CoordinatorConfig::default()
        });
        let cluster = Arc::new(ClusterNodes::new(DeployMode::PdSeparate));
        let scheduler: Arc<dyn Scheduler> =
            Arc::new(LeastTaskScheduler::new(cluster.clone(), DeployMode::PdSeparate));
        let manager = Arc::new(ReqManager::new(cfg.clone(), cluster.clone(), scheduler.clone()));
        let exception = Arc::new(ExceptionMonitor::new());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), None));
        Repeater::new(cfg, cluster, manager, scheduler, exception, pool)
    }

    fn make_agent(kind: ReqKind) -> Arc<ReqAgent> {
        let (reply, _receiver) = ServerReply::channel();
        Arc::new(ReqAgent::new(
            "req-1",
            kind,
            reply,
            HttpRequest::post("/generate", b"{}".to_vec()),
        ))
    }

    #[tokio::test]
    async fn test_output_count_generated_text() {
        let repeater = build_repeater();
        let agent = make_agent(ReqKind::Tgi);
        repeater.count_output_not_stream(br#"{"generated_text":"abcdefgh"}"#, &agent);
        // 8 characters at a rate of 2 characters per token.
        assert_eq!(agent.output_num(), 4);
    }

    #[tokio::test]
    async fn test_output_count_triton_token_arrays() {
        let repeater = build_repeater();
        let agent = make_agent(ReqKind::Triton);
        repeater.count_output_not_stream(
            br#"{"outputs":[{"data":[1,2,3]},{"data":[4,5]}]}"#,
            &agent,
        );
        assert_eq!(agent.output_num(), 5);

        let by_text = make_agent(ReqKind::Triton);
        repeater.count_output_not_stream(br#"{"text_output":"abcd"}"#, &by_text);
        assert_eq!(by_text.output_num(), 2);
    }

    #[tokio::test]
    async fn test_output_count_vllm_text_array() {
        let repeater = build_repeater();
        let agent = make_agent(ReqKind::Vllm);
        repeater.count_output_not_stream(br#"{"text":["abcd","ef"]}"#, &agent);
        assert_eq!(agent.output_num(), 3);
    }

    #[tokio::test]
    async fn test_output_count_ignores_garbage() {
        let repeater = build_repeater();
        let agent = make_agent(ReqKind::OpenAi);
        repeater.count_output_not_stream(b"not json at all", &agent);
        assert_eq!(agent.output_num(), 0);
    }
}
