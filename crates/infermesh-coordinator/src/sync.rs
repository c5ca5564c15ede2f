//! Coordinator side of the controller sync: ingests the authoritative
//! cluster view published on `/v1/refresh` and applies the roll diff to the
//! live instance table.

use std::sync::Arc;

use infermesh_cluster::flex::process_flex_instance;
use infermesh_cluster::{
    ClusterError,
    ClusterNodes,
};
use infermesh_commons::models::cluster_wire::{
    ClusterViewBody,
    InstanceRole,
    NodeEntry,
    TerminateServiceBody,
};
use infermesh_commons::utils::config::CoordinatorConfig;
use tracing::{
    info,
    warn,
};

use crate::repeater::Repeater;
use crate::scheduler::Scheduler;

pub struct SyncContext {
    cfg: Arc<CoordinatorConfig>,
    cluster: Arc<ClusterNodes>,
    scheduler: Arc<dyn Scheduler>,
    repeater: Arc<Repeater>,
}

impl SyncContext {
    pub fn new(
        cfg: Arc<CoordinatorConfig>, cluster: Arc<ClusterNodes>, scheduler: Arc<dyn Scheduler>,
        repeater: Arc<Repeater>,
    ) -> Self {
        Self {
            cfg,
            cluster,
            scheduler,
            repeater,
        }
    }

    /// Applies one published cluster view: flex rewrite, roll diff, then
    /// add/update/remove. Fails the publish on invalid flex data or when the
    /// view exceeds the instance cap.
    pub async fn handle_refresh(&self, view: ClusterViewBody) -> Result<(), ClusterError> {
        let mut view = view;
        process_flex_instance(&self.cluster, &mut view)?;
        let max = self.cluster.max_instances();
        if view.instances.len() > max {
            return Err(ClusterError::TooManyInstances(view.instances.len(), max));
        }

        let roll = self.cluster.roll(&view.ids);
        for id in &roll.added {
            let Some(entry) = find_entry(&view, *id) else {
                warn!(id, "published id missing from instances array");
                continue;
            };
            if !self.cluster.add_instance(
                entry.id,
                &entry.ip,
                &entry.port,
                entry.static_info.role,
                &entry.model_name,
            ) {
                continue;
            }
            self.apply_extra_info(entry);
        }
        for id in &roll.updated {
            if let Some(entry) = find_entry(&view, *id) {
                self.apply_extra_info(entry);
            }
        }
        for id in &roll.removed {
            self.scheduler.remove_instance(&[*id]);
            if self.cluster.is_instance_from_flex(*id) {
                self.cluster.clear_flex();
            }
            self.cluster.remove_instance(*id);
        }
        info!(
            added = roll.added.len(),
            updated = roll.updated.len(),
            removed = roll.removed.len(),
            "cluster view refreshed"
        );

        if self.cfg.deploy_mode.is_pd() {
            self.ensure_decode_links(&view).await;
        }
        Ok(())
    }

    fn apply_extra_info(&self, entry: &NodeEntry) {
        self.cluster.update_extra_info(
            entry.id,
            &entry.metric_port,
            &entry.inter_comm_port,
            entry.static_info.total_block_num,
            entry.static_info.total_slots_num,
            entry.static_info.virtual_id,
        );
    }

    async fn ensure_decode_links(&self, view: &ClusterViewBody) {
        for entry in &view.instances {
            if entry.static_info.role != InstanceRole::Decode {
                continue;
            }
            if self.repeater.check_link_with_d_node(&entry.ip, &entry.port) {
                continue;
            }
            let mut linked = false;
            for _ in 0..=self.cfg.max_retry {
                if self.repeater.link_with_d_node(&entry.ip, &entry.port).await {
                    linked = true;
                    break;
                }
            }
            if !linked {
                warn!(id = entry.id, ip = %entry.ip, port = %entry.port,
                    "could not establish decode result link");
            }
        }
    }

    /// Controller-initiated removal of an abnormal node.
    pub async fn handle_terminate(&self, target: &TerminateServiceBody) {
        let Some(id) = self.cluster.id_of(&target.ip, &target.port) else {
            warn!(ip = %target.ip, port = %target.port, "terminate for unknown node");
            return;
        };
        info!(id, ip = %target.ip, port = %target.port, "terminating node on controller request");
        self.scheduler.remove_instance(&[id]);
        self.cluster.remove_instance(id);
    }
}

fn find_entry(view: &ClusterViewBody, id: u64) -> Option<&NodeEntry> {
    view.instances.iter().find(|entry| entry.id == id)
}

#[cfg(test)]
mod tests {
    use infermesh_commons::models::cluster_wire::{
        DynamicInfo,
        StaticInfo,
    };
    use infermesh_commons::utils::config::DeployMode;
    use infermesh_transport::{
        ConnectionPool,
        PoolConfig,
    };

    use super::*;
    use crate::exception::ExceptionMonitor;
    use crate::manager::ReqManager;
    use crate::scheduler::LeastTaskScheduler;

    fn entry(id: u64, role: InstanceRole) -> NodeEntry {
        NodeEntry {
            id,
            ip: format!("10.0.0.{id}"),
            port: "1025".to_string(),
            model_name: "llm".to_string(),
            metric_port: "9000".to_string(),
            static_info: StaticInfo {
                role,
                total_block_num: 16,
                total_slots_num: 32,
                virtual_id: id,
                ..StaticInfo::default()
            },
            dynamic_info: DynamicInfo::default(),
            ..NodeEntry::default()
        }
    }

    fn context() -> (SyncContext, Arc<ClusterNodes>) {
        let cfg = Arc::new(CoordinatorConfig {
            deploy_mode: DeployMode::SingleNode,
            ..CoordinatorConfig::default()
        });
        let cluster = Arc::new(ClusterNodes::new(DeployMode::SingleNode));
        let scheduler: Arc<dyn Scheduler> =
            Arc::new(LeastTaskScheduler::new(cluster.clone(), DeployMode::SingleNode));
        let manager = Arc::new(ReqManager::new(cfg.clone(), cluster.clone(), scheduler.clone()));
        let exception = Arc::new(ExceptionMonitor::new());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), None));
        let repeater = Repeater::new(
            cfg.clone(),
            cluster.clone(),
            manager,
            scheduler.clone(),
            exception,
            pool,
        );
        (
            SyncContext::new(cfg, cluster.clone(), scheduler, repeater),
            cluster,
        )
    }

    #[tokio::test]
    async fn test_refresh_applies_roll_diff() {
        let (ctx, cluster) = context();
        let view = ClusterViewBody {
            instances: vec![entry(1, InstanceRole::Prefill), entry(2, InstanceRole::Decode)],
            ids: vec![1, 2],
        };
        ctx.handle_refresh(view).await.unwrap();
        assert!(cluster.has_instance(1));
        assert!(cluster.has_instance(2));
        assert_eq!(cluster.get_info(1).unwrap().metric_port, "9000");

        // Second view drops 1 and adds 3.
        let view = ClusterViewBody {
            instances: vec![entry(2, InstanceRole::Decode), entry(3, InstanceRole::Prefill)],
            ids: vec![2, 3],
        };
        ctx.handle_refresh(view).await.unwrap();
        assert!(!cluster.has_instance(1));
        assert!(cluster.has_instance(2));
        assert!(cluster.has_instance(3));
    }

    #[tokio::test]
    async fn test_refresh_rejects_bad_flex_percentage() {
        let (ctx, _cluster) = context();
        let mut flex = entry(5, InstanceRole::Flex);
        flex.static_info.p_percentage = 250;
        let view = ClusterViewBody {
            instances: vec![flex],
            ids: vec![5],
        };
        assert!(ctx.handle_refresh(view).await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_removes_matching_node() {
        let (ctx, cluster) = context();
        let view = ClusterViewBody {
            instances: vec![entry(1, InstanceRole::Prefill)],
            ids: vec![1],
        };
        ctx.handle_refresh(view).await.unwrap();
        ctx.handle_terminate(&TerminateServiceBody {
            ip: "10.0.0.1".to_string(),
            port: "1025".to_string(),
        })
        .await;
        assert!(!cluster.has_instance(1));
    }
}
