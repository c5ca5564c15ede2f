//! Scheduler seam. The production scheduler is an external collaborator; the
//! coordinator hands it each new request and gets a `(P, D)` pair back
//! through the route sink. `LeastTaskScheduler` is the in-tree default:
//! it pairs the least-loaded prefill with the least-loaded decode and calls
//! back immediately.

use std::sync::{
    Arc,
    Mutex as StdMutex,
};

use infermesh_cluster::ClusterNodes;
use infermesh_commons::models::cluster_wire::InstanceRole;
use infermesh_commons::utils::config::DeployMode;
use tracing::debug;

use crate::agent::ReqKind;
use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStage {
    Prefill,
    Decode,
}

/// Request payload view handed to the scheduler.
#[derive(Debug, Clone, Copy)]
pub enum SchedInput<'a> {
    Text(&'a str),
    Tokens(&'a [u32]),
    Len(usize),
}

/// Callback surface the scheduler drives once it has picked a route.
pub trait RouteSink: Send + Sync {
    fn pd_route(&self, req_id: &str, prefill: u64, decode: u64);
    fn single_route(&self, req_id: &str, node: u64);
}

pub trait Scheduler: Send + Sync {
    fn proc_req(&self, req_id: &str, input: SchedInput<'_>, kind: ReqKind)
        -> Result<(), SchedulerError>;

    /// Phase-completion notification: prefill end or decode end with the
    /// produced output length.
    fn update_req(&self, req_id: &str, stage: ReqStage, output_len: usize);

    fn remove_instance(&self, ids: &[u64]);

    fn set_route_sink(&self, sink: Arc<dyn RouteSink>);
}

pub struct LeastTaskScheduler {
    cluster: Arc<ClusterNodes>,
    deploy_mode: DeployMode,
    sink: StdMutex<Option<Arc<dyn RouteSink>>>,
}

impl LeastTaskScheduler {
    pub fn new(cluster: Arc<ClusterNodes>, deploy_mode: DeployMode) -> Self {
        Self {
            cluster,
            deploy_mode,
            sink: StdMutex::new(None),
        }
    }

    fn least_loaded(&self, role: InstanceRole) -> Option<u64> {
        self.cluster
            .all_infos()
            .iter()
            .filter(|(_, info)| info.role == role)
            .min_by_key(|(_, info)| info.tasks.len())
            .map(|(&id, _)| id)
    }

    fn least_loaded_any(&self) -> Option<u64> {
        self.cluster
            .all_infos()
            .iter()
            .min_by_key(|(_, info)| info.tasks.len())
            .map(|(&id, _)| id)
    }

    fn sink(&self) -> Option<Arc<dyn RouteSink>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Scheduler for LeastTaskScheduler {
    fn proc_req(
        &self, req_id: &str, _input: SchedInput<'_>, _kind: ReqKind,
    ) -> Result<(), SchedulerError> {
        let sink = self
            .sink()
            .ok_or_else(|| SchedulerError::Rejected("route sink not installed".to_string()))?;
        if self.deploy_mode.is_pd() {
            let prefill = self
                .least_loaded(InstanceRole::Prefill)
                .ok_or(SchedulerError::NoInstances)?;
            let decode = self
                .least_loaded(InstanceRole::Decode)
                .ok_or(SchedulerError::NoInstances)?;
            debug!(req_id, prefill, decode, "scheduled pd pair");
            sink.pd_route(req_id, prefill, decode);
        } else {
            let node = self.least_loaded_any().ok_or(SchedulerError::NoInstances)?;
            debug!(req_id, node, "scheduled single node");
            sink.single_route(req_id, node);
        }
        Ok(())
    }

    fn update_req(&self, req_id: &str, stage: ReqStage, output_len: usize) {
        debug!(req_id, ?stage, output_len, "scheduler released request phase");
    }

    fn remove_instance(&self, ids: &[u64]) {
        debug!(?ids, "scheduler dropped instances");
    }

    fn set_route_sink(&self, sink: Arc<dyn RouteSink>) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        pd: Mutex<Vec<(String, u64, u64)>>,
        single: Mutex<Vec<(String, u64)>>,
    }

    impl RouteSink for RecordingSink {
        fn pd_route(&self, req_id: &str, prefill: u64, decode: u64) {
            self.pd
                .lock()
                .unwrap()
                .push((req_id.to_string(), prefill, decode));
        }

        fn single_route(&self, req_id: &str, node: u64) {
            self.single.lock().unwrap().push((req_id.to_string(), node));
        }
    }

    #[test]
    fn test_pairs_least_loaded_instances() {
        let cluster = Arc::new(ClusterNodes::new(DeployMode::PdSeparate));
        cluster.add_instance(1, "10.0.0.1", "1025", InstanceRole::Prefill, "llm");
        cluster.add_instance(2, "10.0.0.2", "1025", InstanceRole::Prefill, "llm");
        cluster.add_instance(3, "10.0.0.3", "1025", InstanceRole::Decode, "llm");
        cluster.add_task(1, "busy");

        let scheduler = LeastTaskScheduler::new(cluster, DeployMode::PdSeparate);
        let sink = Arc::new(RecordingSink::default());
        scheduler.set_route_sink(sink.clone());

        scheduler
            .proc_req("req-1", SchedInput::Text("hello"), ReqKind::Tgi)
            .unwrap();
        assert_eq!(sink.pd.lock().unwrap()[0], ("req-1".to_string(), 2, 3));
    }

    #[test]
    fn test_missing_role_is_no_instances() {
        let cluster = Arc::new(ClusterNodes::new(DeployMode::PdSeparate));
        cluster.add_instance(1, "10.0.0.1", "1025", InstanceRole::Prefill, "llm");
        let scheduler = LeastTaskScheduler::new(cluster, DeployMode::PdSeparate);
        scheduler.set_route_sink(Arc::new(RecordingSink::default()));
        match scheduler.proc_req("req-1", SchedInput::Len(3), ReqKind::MindIe) {
            Err(SchedulerError::NoInstances) => {}
            other => panic!("expected NoInstances, got {other:?}"),
        }
    }
}
