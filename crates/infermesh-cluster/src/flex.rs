//! Flex-instance rewrite applied to a published cluster view before the
//! coordinator ingests it. A Flex worker advertises a prefill percentage;
//! depending on that value it is converted to a pure P, a pure D, or split
//! into two synthetic instances sharing its capacity.

use infermesh_commons::models::cluster_wire::{
    ClusterViewBody,
    InstanceLabel,
    InstanceRole,
    NodeEntry,
    DECODE_INS_ID_TRANSFER_BY_FLEX,
    FLEX_P_PERCENTAGE_MAX,
};
use tracing::debug;

use crate::error::ClusterError;
use crate::nodes::ClusterNodes;

/// Rewrites the single Flex entry of `view` (if any) in place and records
/// the outcome in the cluster's Flex singleton. Fails the publish when
/// `p_percentage` is out of range.
pub fn process_flex_instance(
    nodes: &ClusterNodes, view: &mut ClusterViewBody,
) -> Result<(), ClusterError> {
    let Some(flex_pos) = view
        .instances
        .iter()
        .position(|entry| entry.static_info.role == InstanceRole::Flex)
    else {
        return Ok(());
    };
    let flex_id = view.instances[flex_pos].id;
    let p_percentage = view.instances[flex_pos].static_info.p_percentage;
    nodes.record_flex(flex_id, p_percentage);
    debug!(flex_id, p_percentage, "found a flex instance");

    if p_percentage > FLEX_P_PERCENTAGE_MAX {
        return Err(ClusterError::PercentageOutOfRange(p_percentage));
    }
    if p_percentage == FLEX_P_PERCENTAGE_MAX {
        convert_flex_to_p(view, flex_pos)
    } else if p_percentage == 0 {
        convert_flex_to_d(view, flex_pos)
    } else {
        split_flex_into_p_and_d(view, flex_pos)
    }
}

fn remove_redundant_peers(entry: &mut NodeEntry, redundant: &[u64]) {
    for id in redundant {
        if let Some(pos) = entry.dynamic_info.peers.iter().position(|peer| peer == id) {
            entry.dynamic_info.peers.remove(pos);
        }
    }
}

/// `p_percentage == 100`: the Flex serves as a pure Prefill. Same-group P
/// instances drop the flex id from their peer lists, and the Flex itself
/// drops its same-group P peers.
fn convert_flex_to_p(view: &mut ClusterViewBody, flex_pos: usize) -> Result<(), ClusterError> {
    let flex_id = view.instances[flex_pos].id;
    let group_id = view.instances[flex_pos].static_info.group_id;
    let mut p_ids = Vec::new();
    for (pos, entry) in view.instances.iter_mut().enumerate() {
        if pos == flex_pos
            || entry.static_info.group_id != group_id
            || entry.static_info.role != InstanceRole::Prefill
        {
            continue;
        }
        p_ids.push(entry.id);
        if let Some(found) = entry.dynamic_info.peers.iter().position(|&peer| peer == flex_id) {
            entry.dynamic_info.peers.remove(found);
        }
    }
    let flex = &mut view.instances[flex_pos];
    flex.static_info.role = InstanceRole::Prefill;
    flex.static_info.label = InstanceLabel::PrefillStatic;
    remove_redundant_peers(flex, &p_ids);
    debug!(flex_id, "converted flex instance to prefill");
    Ok(())
}

/// `p_percentage == 0`: the Flex serves as a pure Decode and takes the
/// reserved split-D id. Same-group P instances swap the flex id in their
/// peer lists for the reserved id; same-group D instances drop it.
fn convert_flex_to_d(view: &mut ClusterViewBody, flex_pos: usize) -> Result<(), ClusterError> {
    let flex_id = view.instances[flex_pos].id;
    let group_id = view.instances[flex_pos].static_info.group_id;
    let mut d_ids = Vec::new();
    for (pos, entry) in view.instances.iter_mut().enumerate() {
        if pos == flex_pos || entry.static_info.group_id != group_id {
            continue;
        }
        match entry.static_info.role {
            InstanceRole::Prefill => {
                if let Some(peer) = entry
                    .dynamic_info
                    .peers
                    .iter_mut()
                    .find(|peer| **peer == flex_id)
                {
                    *peer = DECODE_INS_ID_TRANSFER_BY_FLEX;
                }
            }
            InstanceRole::Decode => {
                d_ids.push(entry.id);
                if let Some(found) =
                    entry.dynamic_info.peers.iter().position(|&peer| peer == flex_id)
                {
                    entry.dynamic_info.peers.remove(found);
                }
            }
            _ => {}
        }
    }
    let flex = &mut view.instances[flex_pos];
    flex.static_info.role = InstanceRole::Decode;
    flex.static_info.label = InstanceLabel::DecodeStatic;
    flex.id = DECODE_INS_ID_TRANSFER_BY_FLEX;
    remove_redundant_peers(flex, &d_ids);

    let Some(id_slot) = view.ids.iter_mut().find(|id| **id == flex_id) else {
        return Err(ClusterError::FlexIdMissing(flex_id));
    };
    *id_slot = DECODE_INS_ID_TRANSFER_BY_FLEX;
    debug!(flex_id, "converted flex instance to decode");
    Ok(())
}

/// `0 < p_percentage < 100`: split the Flex into a P copy keeping its id and
/// a synthetic D copy with the reserved id, scaling the block/slot totals by
/// the percentage. Peer lists on both halves are pruned of same-role
/// same-group peers, and each half lists the other as a peer.
fn split_flex_into_p_and_d(view: &mut ClusterViewBody, flex_pos: usize) -> Result<(), ClusterError> {
    let flex_id = view.instances[flex_pos].id;
    let group_id = view.instances[flex_pos].static_info.group_id;
    let mut p_ids = Vec::new();
    let mut d_ids = Vec::new();
    for (pos, entry) in view.instances.iter_mut().enumerate() {
        if pos == flex_pos || entry.static_info.group_id != group_id {
            continue;
        }
        match entry.static_info.role {
            InstanceRole::Prefill => {
                p_ids.push(entry.id);
                if let Some(peer) = entry
                    .dynamic_info
                    .peers
                    .iter_mut()
                    .find(|peer| **peer == flex_id)
                {
                    *peer = DECODE_INS_ID_TRANSFER_BY_FLEX;
                }
            }
            InstanceRole::Decode => d_ids.push(entry.id),
            _ => {}
        }
    }

    let ratio = view.instances[flex_pos].static_info.p_percentage as f64
        / FLEX_P_PERCENTAGE_MAX as f64;
    let total_slots = view.instances[flex_pos].static_info.total_slots_num;
    let total_blocks = view.instances[flex_pos].static_info.total_block_num;
    let avail_slots = view.instances[flex_pos].dynamic_info.avail_slots_num;
    let avail_blocks = view.instances[flex_pos].dynamic_info.avail_block_num;

    let mut split_d = view.instances[flex_pos].clone();

    let flex = &mut view.instances[flex_pos];
    flex.static_info.total_slots_num = (total_slots as f64 * ratio) as u64;
    flex.static_info.total_block_num = (total_blocks as f64 * ratio) as u64;
    flex.dynamic_info.avail_slots_num = (avail_slots as f64 * ratio) as u64;
    flex.dynamic_info.avail_block_num = (avail_blocks as f64 * ratio) as u64;
    flex.static_info.role = InstanceRole::Prefill;
    flex.static_info.label = InstanceLabel::PrefillStatic;
    remove_redundant_peers(flex, &p_ids);
    flex.dynamic_info.peers.push(DECODE_INS_ID_TRANSFER_BY_FLEX);

    split_d.static_info.total_slots_num = (total_slots as f64 * (1.0 - ratio)) as u64;
    split_d.static_info.total_block_num = (total_blocks as f64 * (1.0 - ratio)) as u64;
    split_d.dynamic_info.avail_slots_num = (avail_slots as f64 * (1.0 - ratio)) as u64;
    split_d.dynamic_info.avail_block_num = (avail_blocks as f64 * (1.0 - ratio)) as u64;
    split_d.static_info.role = InstanceRole::Decode;
    split_d.static_info.label = InstanceLabel::DecodeStatic;
    split_d.id = DECODE_INS_ID_TRANSFER_BY_FLEX;
    remove_redundant_peers(&mut split_d, &d_ids);
    split_d.dynamic_info.peers.push(flex_id);

    view.ids.push(DECODE_INS_ID_TRANSFER_BY_FLEX);
    view.instances.push(split_d);
    debug!(flex_id, "split flex instance into prefill and decode");
    Ok(())
}

#[cfg(test)]
mod tests {
    use infermesh_commons::models::cluster_wire::{
        DynamicInfo,
        StaticInfo,
    };
    use infermesh_commons::utils::config::DeployMode;

    use super::*;

    fn entry(id: u64, role: InstanceRole, group_id: u64, peers: Vec<u64>) -> NodeEntry {
        NodeEntry {
            id,
            ip: format!("10.0.0.{id}"),
            port: "1025".to_string(),
            model_name: "llm".to_string(),
            static_info: StaticInfo {
                group_id,
                role,
                total_slots_num: 200,
                total_block_num: 100,
                p_percentage: 0,
                ..StaticInfo::default()
            },
            dynamic_info: DynamicInfo {
                avail_slots_num: 180,
                avail_block_num: 90,
                peers,
                ..DynamicInfo::default()
            },
            ..NodeEntry::default()
        }
    }

    fn view_with_flex(p_percentage: u64) -> ClusterViewBody {
        let mut flex = entry(10, InstanceRole::Flex, 1, vec![1, 2]);
        flex.static_info.p_percentage = p_percentage;
        ClusterViewBody {
            instances: vec![
                entry(1, InstanceRole::Prefill, 1, vec![2, 10]),
                entry(2, InstanceRole::Decode, 1, vec![1, 10]),
                flex,
            ],
            ids: vec![1, 2, 10],
        }
    }

    #[test]
    fn test_split_preserves_totals() {
        let nodes = ClusterNodes::new(DeployMode::PdSeparate);
        let mut view = view_with_flex(40);
        process_flex_instance(&nodes, &mut view).unwrap();

        assert_eq!(view.instances.len(), 4);
        assert_eq!(view.ids, vec![1, 2, 10, DECODE_INS_ID_TRANSFER_BY_FLEX]);

        let p_half = view.instances.iter().find(|e| e.id == 10).unwrap();
        let d_half = view
            .instances
            .iter()
            .find(|e| e.id == DECODE_INS_ID_TRANSFER_BY_FLEX)
            .unwrap();
        assert_eq!(p_half.static_info.role, InstanceRole::Prefill);
        assert_eq!(d_half.static_info.role, InstanceRole::Decode);
        // Floor-rounded halves add back to the original.
        assert_eq!(
            p_half.static_info.total_slots_num + d_half.static_info.total_slots_num,
            200
        );
        assert_eq!(
            p_half.static_info.total_block_num + d_half.static_info.total_block_num,
            100
        );
        // Each half points at the other, same-role group peers pruned.
        assert!(p_half.dynamic_info.peers.contains(&DECODE_INS_ID_TRANSFER_BY_FLEX));
        assert!(!p_half.dynamic_info.peers.contains(&1));
        assert!(d_half.dynamic_info.peers.contains(&10));
        assert!(!d_half.dynamic_info.peers.contains(&2));
        // The group P now peers with the synthetic D instead of the flex id.
        let peer_p = view.instances.iter().find(|e| e.id == 1).unwrap();
        assert!(peer_p.dynamic_info.peers.contains(&DECODE_INS_ID_TRANSFER_BY_FLEX));
        assert!(!peer_p.dynamic_info.peers.contains(&10));

        assert!(nodes.is_flex_split());
    }

    #[test]
    fn test_convert_to_pure_p() {
        let nodes = ClusterNodes::new(DeployMode::PdSeparate);
        let mut view = view_with_flex(100);
        process_flex_instance(&nodes, &mut view).unwrap();

        assert_eq!(view.instances.len(), 3);
        let flex = view.instances.iter().find(|e| e.id == 10).unwrap();
        assert_eq!(flex.static_info.role, InstanceRole::Prefill);
        assert!(!flex.dynamic_info.peers.contains(&1));
        let peer_p = view.instances.iter().find(|e| e.id == 1).unwrap();
        assert!(!peer_p.dynamic_info.peers.contains(&10));
        assert!(!nodes.is_flex_split());
    }

    #[test]
    fn test_convert_to_pure_d_rewrites_id() {
        let nodes = ClusterNodes::new(DeployMode::PdSeparate);
        let mut view = view_with_flex(0);
        process_flex_instance(&nodes, &mut view).unwrap();

        assert!(view.ids.contains(&DECODE_INS_ID_TRANSFER_BY_FLEX));
        assert!(!view.ids.contains(&10));
        let flex = view
            .instances
            .iter()
            .find(|e| e.id == DECODE_INS_ID_TRANSFER_BY_FLEX)
            .unwrap();
        assert_eq!(flex.static_info.role, InstanceRole::Decode);
        assert!(!flex.dynamic_info.peers.contains(&2));
        let peer_p = view.instances.iter().find(|e| e.id == 1).unwrap();
        assert!(peer_p.dynamic_info.peers.contains(&DECODE_INS_ID_TRANSFER_BY_FLEX));
        let peer_d = view.instances.iter().find(|e| e.id == 2).unwrap();
        assert!(!peer_d.dynamic_info.peers.contains(&10));
    }

    #[test]
    fn test_out_of_range_percentage_fails() {
        let nodes = ClusterNodes::new(DeployMode::PdSeparate);
        let mut view = view_with_flex(101);
        match process_flex_instance(&nodes, &mut view) {
            Err(ClusterError::PercentageOutOfRange(101)) => {}
            other => panic!("expected percentage error, got {other:?}"),
        }
    }

    #[test]
    fn test_rewrite_without_flex_is_noop() {
        let nodes = ClusterNodes::new(DeployMode::PdSeparate);
        let mut view = ClusterViewBody {
            instances: vec![entry(1, InstanceRole::Prefill, 1, vec![2])],
            ids: vec![1],
        };
        let before = serde_json::to_string(&view).unwrap();
        process_flex_instance(&nodes, &mut view).unwrap();
        assert_eq!(serde_json::to_string(&view).unwrap(), before);
        assert!(!nodes.has_flex());
    }
}
