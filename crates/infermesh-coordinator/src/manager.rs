use std::collections::{
    HashMap,
    HashSet,
};
use std::sync::atomic::{
    AtomicBool,
    AtomicI64,
    AtomicU64,
    Ordering,
};
use std::sync::{
    Arc,
    RwLock,
};

use infermesh_cluster::ClusterNodes;
use infermesh_commons::utils::config::CoordinatorConfig;
use infermesh_transport::HttpRequest;
use tracing::{
    debug,
    info,
    warn,
};

use crate::agent::{
    ReqAgent,
    ReqKind,
    ReqState,
    UNKNOWN_ID,
};
use crate::reply::ServerReply;
use crate::scheduler::{
    ReqStage,
    Scheduler,
};

const CONGESTION_TRIGGER_RATIO: f64 = 0.85;
const CONGESTION_CLEAR_RATIO: f64 = 0.75;

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestStats {
    pub all: u64,
    pub fail: u64,
    pub success: u64,
}

/// Canonical owner of every in-flight request.
pub struct ReqManager {
    cfg: Arc<CoordinatorConfig>,
    cluster: Arc<ClusterNodes>,
    scheduler: Arc<dyn Scheduler>,
    reqs: RwLock<HashMap<String, Arc<ReqAgent>>>,
    ins_to_reqs: RwLock<HashMap<u64, HashSet<String>>>,
    received: AtomicI64,
    prev_received: AtomicI64,
    num_all: AtomicU64,
    num_fail: AtomicU64,
    num_success: AtomicU64,
    in_congestion_alarm: AtomicBool,
}

impl ReqManager {
    pub fn new(
        cfg: Arc<CoordinatorConfig>, cluster: Arc<ClusterNodes>, scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            cfg,
            cluster,
            scheduler,
            reqs: RwLock::new(HashMap::new()),
            ins_to_reqs: RwLock::new(HashMap::new()),
            received: AtomicI64::new(0),
            prev_received: AtomicI64::new(0),
            num_all: AtomicU64::new(0),
            num_fail: AtomicU64::new(0),
            num_success: AtomicU64::new(0),
            in_congestion_alarm: AtomicBool::new(false),
        }
    }

    pub fn req_num(&self) -> usize {
        self.reqs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn max_reqs(&self) -> usize {
        self.cfg.max_reqs
    }

    pub fn note_arrival(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Arrivals since the previous call; feeds the periodic reporters.
    pub fn arrived_since_last_call(&self) -> i64 {
        let received = self.received.load(Ordering::Relaxed);
        let previous = self.prev_received.swap(received, Ordering::Relaxed);
        received - previous
    }

    /// Fails on a duplicate id; the caller answers 400.
    pub fn add_req(
        &self, req_id: &str, kind: ReqKind, reply: Arc<ServerReply>, req: HttpRequest,
    ) -> bool {
        let mut reqs = self.reqs.write().unwrap_or_else(|e| e.into_inner());
        if reqs.contains_key(req_id) {
            warn!(req_id, "add request failed, request id already exists");
            return false;
        }
        reqs.insert(
            req_id.to_string(),
            Arc::new(ReqAgent::new(req_id, kind, reply, req)),
        );
        self.num_all.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn get(&self, req_id: &str) -> Option<Arc<ReqAgent>> {
        self.reqs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(req_id)
            .cloned()
    }

    pub fn all_reqs(&self) -> Vec<Arc<ReqAgent>> {
        self.reqs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn has_state(&self, req_id: &str, state: ReqState) -> bool {
        self.get(req_id)
            .map(|agent| agent.has_state(state))
            .unwrap_or(false)
    }

    pub fn set_route(&self, req_id: &str, route: [u64; 2]) {
        let Some(agent) = self.get(req_id) else {
            return;
        };
        {
            let mut index = self.ins_to_reqs.write().unwrap_or_else(|e| e.into_inner());
            index.entry(route[0]).or_default().insert(req_id.to_string());
            index.entry(route[1]).or_default().insert(req_id.to_string());
        }
        agent.set_route(route);
    }

    pub fn set_route_ip(&self, req_id: &str, route_ip: [String; 4]) {
        if let Some(agent) = self.get(req_id) {
            agent.set_route_ip(route_ip);
        }
    }

    pub fn set_model_name(&self, req_id: &str, model_name: &str) {
        if let Some(agent) = self.get(req_id) {
            agent.set_model_name(model_name);
        }
    }

    pub fn requests_of_instance(&self, ins_id: u64) -> HashSet<String> {
        self.ins_to_reqs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ins_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Checks that the chosen P (and D unless skipped) still exist.
    pub fn are_pd_instances_valid(&self, req_id: &str, skip_decode: bool) -> bool {
        let Some(agent) = self.get(req_id) else {
            return false;
        };
        let route = agent.route();
        if route[0] == UNKNOWN_ID || !self.cluster.has_instance(route[0]) {
            warn!(req_id, prefill = route[0], "prefill instance not found");
            return false;
        }
        if !skip_decode && (route[1] == UNKNOWN_ID || !self.cluster.has_instance(route[1])) {
            warn!(req_id, decode = route[1], "decode instance not found");
            return false;
        }
        true
    }

    /// Records the transition and runs its side effect.
    pub fn update_state(&self, req_id: &str, state: ReqState) {
        let Some(agent) = self.get(req_id) else {
            if matches!(state, ReqState::Finish | ReqState::Exception) {
                // The request is gone; still make sure the scheduler frees it.
                self.scheduler.update_req(req_id, ReqStage::Decode, 0);
            }
            return;
        };
        match state {
            ReqState::Arrive => {
                info!(req_id, "request arrived");
            }
            ReqState::Scheduled => {
                info!(req_id, "request scheduled");
            }
            ReqState::Repeated => self.req_repeated(&agent),
            ReqState::FirstTokenFinish => self.req_finish_first_token(&agent),
            ReqState::Finish | ReqState::Exception => {
                self.clear_req(&agent, state);
            }
            ReqState::Retry => self.req_retry(&agent),
            _ => {}
        }
        agent.record_state(state);
    }

    fn req_repeated(&self, agent: &Arc<ReqAgent>) {
        info!(req_id = agent.req_id(), "request repeated");
        let prefill = agent.route()[0];
        self.cluster.add_task(prefill, agent.req_id());
    }

    fn req_finish_first_token(&self, agent: &Arc<ReqAgent>) {
        if !self.cfg.deploy_mode.is_pd() {
            return;
        }
        if agent.has_any_state(&[ReqState::Finish, ReqState::Exception]) {
            // The answer already completed through the prefill response;
            // task accounting was settled when it was cleared.
            return;
        }
        let req_id = agent.req_id();
        info!(req_id, "first prefill finished");
        self.scheduler.update_req(req_id, ReqStage::Prefill, 0);
        let [prefill, decode] = agent.route();
        let prefill_addr = (self.cluster.ip(prefill), self.cluster.port(prefill));
        let decode_addr = (self.cluster.ip(decode), self.cluster.port(decode));
        self.cluster.decrease_task(prefill, req_id);
        self.cluster.add_task(decode, req_id);
        {
            let mut index = self.ins_to_reqs.write().unwrap_or_else(|e| e.into_inner());
            if let Some(set) = index.get_mut(&prefill) {
                set.remove(req_id);
            }
        }
        // When P and D share an address the Flex forwards to itself; the
        // pooled connection stays held until the final token.
        if prefill_addr != decode_addr {
            if let Some(conn) = agent.client_conn() {
                conn.set_available(true);
                agent.set_client_conn(None);
            }
        }
    }

    fn req_finish(&self, agent: &Arc<ReqAgent>) {
        if agent.kind() == ReqKind::Tokenizer {
            return;
        }
        let [prefill, decode] = agent.route();
        let prefill_addr = (self.cluster.ip(prefill), self.cluster.port(prefill));
        let decode_addr = (self.cluster.ip(decode), self.cluster.port(decode));
        let flex_self = self.cfg.deploy_mode.is_pd() && prefill_addr == decode_addr;
        if !self.cfg.deploy_mode.is_pd() || flex_self {
            if let Some(conn) = agent.client_conn() {
                conn.set_available(true);
                agent.set_client_conn(None);
            }
        }
    }

    fn clear_req(&self, agent: &Arc<ReqAgent>, state: ReqState) {
        if agent.has_any_state(&[ReqState::Finish, ReqState::Exception]) {
            return;
        }
        let req_id = agent.req_id();
        self.scheduler
            .update_req(req_id, ReqStage::Decode, agent.output_num());
        if state == ReqState::Finish {
            info!(req_id, "request finished");
            self.req_finish(agent);
            self.num_success.fetch_add(1, Ordering::Relaxed);
        } else {
            info!(req_id, ?state, "request ended with exception");
            self.num_fail.fetch_add(1, Ordering::Relaxed);
        }
        if agent.has_state(ReqState::Repeated) {
            let [prefill, decode] = agent.route();
            let prefill_addr = (self.cluster.ip(prefill), self.cluster.port(prefill));
            let decode_addr = (self.cluster.ip(decode), self.cluster.port(decode));
            if self.cfg.deploy_mode.is_pd() && prefill_addr != decode_addr {
                if agent.has_state(ReqState::FirstTokenFinish) {
                    // P was already released at first-token time.
                    self.cluster.decrease_task(decode, req_id);
                } else {
                    self.cluster.decrease_task(prefill, req_id);
                    self.cluster.decrease_task(decode, req_id);
                }
            } else {
                self.cluster.decrease_task(prefill, req_id);
            }
            let mut index = self.ins_to_reqs.write().unwrap_or_else(|e| e.into_inner());
            if let Some(set) = index.get_mut(&decode) {
                set.remove(req_id);
            }
        }
    }

    fn req_retry(&self, agent: &Arc<ReqAgent>) {
        info!(req_id = agent.req_id(), "request retrying");
        // The scheduler must drop the current placement before the request
        // is re-admitted.
        self.clear_req(agent, ReqState::Retry);
        agent.clear_output_num();
    }

    /// Reaps every request whose latest state is terminal and releases any
    /// still-held pooled connection.
    pub async fn release_finished(&self) {
        if self.req_num() == 0 {
            return;
        }
        let mut stale_conns = Vec::new();
        {
            let mut reqs = self.reqs.write().unwrap_or_else(|e| e.into_inner());
            reqs.retain(|req_id, agent| {
                if agent.has_any_state(&[ReqState::Finish, ReqState::Exception]) {
                    if let Some(conn) = agent.client_conn() {
                        stale_conns.push(conn);
                    }
                    debug!(req_id, "released finished request");
                    false
                } else {
                    true
                }
            });
        }
        for conn in stale_conns {
            conn.grace_close().await;
        }
        info!(remaining = self.req_num(), "finished request sweep complete");
        self.check_congestion_alarm();
    }

    /// Edge-triggered congestion alarm: trips at 85% of the in-flight cap,
    /// clears at 75%.
    pub fn check_congestion_alarm(&self) {
        let max = self.cfg.max_reqs;
        let trigger = (max as f64 * CONGESTION_TRIGGER_RATIO) as usize;
        let clear = (max as f64 * CONGESTION_CLEAR_RATIO) as usize;
        let current = self.req_num();
        if current >= trigger && !self.in_congestion_alarm.load(Ordering::Relaxed) {
            self.in_congestion_alarm.store(true, Ordering::Release);
            warn!(
                current,
                max, "request congestion alarm raised: in-flight count crossed 85% of the cap"
            );
        } else if current < clear && self.in_congestion_alarm.load(Ordering::Relaxed) {
            self.in_congestion_alarm.store(false, Ordering::Release);
            info!(
                current,
                max, "request congestion alarm cleared: in-flight count fell below 75% of the cap"
            );
        }
    }

    pub fn in_congestion_alarm(&self) -> bool {
        self.in_congestion_alarm.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            all: self.num_all.load(Ordering::Relaxed),
            fail: self.num_fail.load(Ordering::Relaxed),
            success: self.num_success.load(Ordering::Relaxed),
        }
    }
}
