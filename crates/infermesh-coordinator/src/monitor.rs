//! Periodic sweeper: reaps finished requests and pushes timeout events for
//! the rest. Timeout math uses monotonic instants throughout, so a request
//! can never look timed out before it arrived.

use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::{
    Duration,
    Instant,
};

use infermesh_commons::utils::config::CoordinatorConfig;
use tokio::task::JoinHandle;
use tracing::info;

use crate::agent::{
    ReqAgent,
    ReqKind,
    ReqState,
};
use crate::exception::{
    ExceptionMonitor,
    ReqException,
};
use crate::manager::ReqManager;

pub struct RequestMonitor {
    manager: Arc<ReqManager>,
    exception: Arc<ExceptionMonitor>,
    cfg: Arc<CoordinatorConfig>,
    tick: Duration,
    running: AtomicBool,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl RequestMonitor {
    pub fn new(
        manager: Arc<ReqManager>, exception: Arc<ExceptionMonitor>, cfg: Arc<CoordinatorConfig>,
    ) -> Self {
        Self::with_tick(manager, exception, cfg, Duration::from_secs(1))
    }

    pub fn with_tick(
        manager: Arc<ReqManager>, exception: Arc<ExceptionMonitor>, cfg: Arc<CoordinatorConfig>,
        tick: Duration,
    ) -> Self {
        Self {
            manager,
            exception,
            cfg,
            tick,
            running: AtomicBool::new(true),
            worker: StdMutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            while monitor.running.load(Ordering::Acquire) {
                monitor.on_tick().await;
                tokio::time::sleep(monitor.tick).await;
            }
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn on_tick(&self) {
        self.manager.release_finished().await;

        for agent in self.manager.all_reqs() {
            if agent.has_any_state(&[ReqState::Exception, ReqState::Finish, ReqState::Timeout]) {
                continue;
            }
            let Some(arrive) = agent.first_state_time(ReqState::Arrive) else {
                continue;
            };
            let req_id = agent.req_id().to_string();

            if !agent.has_state(ReqState::Scheduled)
                && self.timed_out(&agent, arrive, self.cfg.schedule_timeout_secs)
            {
                info!(req_id, "request exceeded schedule timeout");
                self.exception.push_req(ReqException::ScheduleTimeout, &req_id);
                continue;
            }

            if agent.kind() == ReqKind::Tokenizer {
                if self.timed_out(&agent, arrive, self.cfg.tokenizer_timeout_secs) {
                    info!(req_id, "request exceeded tokenizer timeout");
                    self.exception.push_req(ReqException::TokenizerTimeout, &req_id);
                }
                continue;
            }

            if !agent.has_state(ReqState::FirstTokenFinish) {
                if self.timed_out(&agent, arrive, self.cfg.first_token_timeout_secs) {
                    if !self.manager.are_pd_instances_valid(&req_id, false) {
                        // The chosen instances are gone; no point cancelling
                        // inference over the wire.
                        info!(req_id, "pd instances missing, failing timed-out request");
                        self.manager.update_state(&req_id, ReqState::Exception);
                    } else {
                        info!(req_id, "request exceeded first token timeout");
                        self.exception
                            .push_req(ReqException::FirstTokenTimeout, &req_id);
                    }
                }
                continue;
            }

            if self.timed_out(&agent, arrive, self.cfg.infer_timeout_secs) {
                if !self.manager.are_pd_instances_valid(&req_id, false) {
                    info!(req_id, "pd instances missing, failing timed-out request");
                    self.manager.update_state(&req_id, ReqState::Exception);
                } else {
                    info!(req_id, "request exceeded inference timeout");
                    self.exception.push_req(ReqException::InferTimeout, &req_id);
                }
            }
        }
    }

    /// A zero limit disables the check. A firing check records TIMEOUT so
    /// the next sweep skips this request.
    fn timed_out(&self, agent: &Arc<ReqAgent>, arrive: Instant, limit_secs: u64) -> bool {
        if limit_secs == 0 {
            return false;
        }
        let fired = arrive.elapsed() >= Duration::from_secs(limit_secs);
        if fired {
            self.manager.update_state(agent.req_id(), ReqState::Timeout);
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use infermesh_cluster::ClusterNodes;
    use infermesh_commons::models::cluster_wire::InstanceRole;
    use infermesh_commons::utils::config::DeployMode;
    use infermesh_transport::HttpRequest;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::reply::ServerReply;
    use crate::scheduler::LeastTaskScheduler;

    fn build(cfg: CoordinatorConfig) -> (Arc<RequestMonitor>, Arc<ReqManager>, Arc<ClusterNodes>) {
        let cfg = Arc::new(cfg);
        let cluster = Arc::new(ClusterNodes::new(DeployMode::PdSeparate));
        let scheduler = Arc::new(LeastTaskScheduler::new(cluster.clone(), DeployMode::PdSeparate));
        let manager = Arc::new(ReqManager::new(cfg.clone(), cluster.clone(), scheduler));
        let exception = Arc::new(ExceptionMonitor::new());
        let monitor = Arc::new(RequestMonitor::with_tick(
            manager.clone(),
            exception,
            cfg,
            Duration::from_millis(100),
        ));
        (monitor, manager, cluster)
    }

    fn add_request(manager: &ReqManager, req_id: &str, kind: ReqKind) {
        let (reply, _receiver) = ServerReply::channel();
        assert!(manager.add_req(req_id, kind, reply, HttpRequest::get("/generate")));
        manager.update_state(req_id, ReqState::Arrive);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_timeout_fires_once() {
        let (monitor, manager, _cluster) = build(CoordinatorConfig {
            schedule_timeout_secs: 1,
            ..CoordinatorConfig::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor
            .exception
            .reg_req_handler(ReqException::ScheduleTimeout, move |req_id| {
                let tx = tx.clone();
                async move {
                    tx.send(req_id).ok();
                }
            });
        monitor.exception.start();

        add_request(&manager, "req-1", ReqKind::Tgi);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        monitor.on_tick().await;
        let fired = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(fired.unwrap(), "req-1");
        assert!(manager.has_state("req-1", ReqState::Timeout));

        // Already timed out: the next sweep must not re-report.
        monitor.on_tick().await;
        assert!(
            timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
            "timeout reported twice"
        );
        monitor.exception.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_timeout_disables_check() {
        let (monitor, manager, _cluster) = build(CoordinatorConfig {
            schedule_timeout_secs: 0,
            first_token_timeout_secs: 0,
            infer_timeout_secs: 0,
            ..CoordinatorConfig::default()
        });
        add_request(&manager, "req-1", ReqKind::Tgi);
        tokio::time::sleep(Duration::from_millis(200)).await;
        monitor.on_tick().await;
        assert!(!manager.has_state("req-1", ReqState::Timeout));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_instances_become_exception_without_rpc() {
        let (monitor, manager, _cluster) = build(CoordinatorConfig {
            schedule_timeout_secs: 0,
            first_token_timeout_secs: 1,
            ..CoordinatorConfig::default()
        });
        add_request(&manager, "req-1", ReqKind::Tgi);
        manager.update_state("req-1", ReqState::Scheduled);
        // Route points at instances that are not in the cluster view.
        manager.set_route("req-1", [11, 22]);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        monitor.on_tick().await;
        assert!(manager.has_state("req-1", ReqState::Exception));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokenizer_requests_get_only_tokenizer_timeout() {
        let (monitor, manager, cluster) = build(CoordinatorConfig {
            schedule_timeout_secs: 0,
            tokenizer_timeout_secs: 1,
            first_token_timeout_secs: 1,
            infer_timeout_secs: 1,
            ..CoordinatorConfig::default()
        });
        cluster.add_instance(1, "10.0.0.1", "1025", InstanceRole::Prefill, "llm");
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor
            .exception
            .reg_req_handler(ReqException::TokenizerTimeout, move |req_id| {
                let tx = tx.clone();
                async move {
                    tx.send(req_id).ok();
                }
            });
        monitor.exception.start();

        add_request(&manager, "req-tok", ReqKind::Tokenizer);
        manager.update_state("req-tok", ReqState::Scheduled);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        monitor.on_tick().await;
        let fired = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(fired.unwrap(), "req-tok");
        monitor.exception.stop().await;
    }
}
