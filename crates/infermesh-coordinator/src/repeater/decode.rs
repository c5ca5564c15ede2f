//! Decode-side handling: packets from the `/dresult` long poll and the
//! recovery paths for a failing decode connection.

use std::sync::Arc;

use infermesh_transport::framing::{
    parse_chunk,
    PacketKind,
};
use infermesh_transport::ClientConnection;
use serde_json::json;
use tracing::{
    debug,
    error,
    warn,
};

use super::Repeater;
use crate::agent::ReqState;
use crate::exception::{
    InsException,
    ReqException,
};
use crate::reply::ServerRes;

impl Repeater {
    /// One chunk of the decode long poll: split into packets, track the
    /// current request id and dispatch each payload.
    pub(crate) async fn d_res_chunk_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let chunk = conn.res_chunk_body();
        let mut req_id = String::new();
        for packet in parse_chunk(&chunk) {
            match packet.kind() {
                PacketKind::ReqId => {
                    req_id = String::from_utf8_lossy(&packet.payload).into_owned();
                }
                PacketKind::Data => self.d_result_normal(&req_id, packet.payload).await,
                PacketKind::LastData => self.d_result_last(&req_id, packet.payload).await,
                PacketKind::Error => self.d_result_error(&req_id, packet.payload).await,
                PacketKind::Retry => self.d_result_retry(&req_id, packet.payload).await,
                PacketKind::KeepAlive => {
                    debug!(addr = %conn.address(), "decode keep-alive heartbeat");
                }
                PacketKind::Close => {
                    debug!(addr = %conn.address(), "decode node closed the long poll");
                    conn.close().await;
                }
                PacketKind::Unknown => {
                    warn!(key = %packet.key, "unknown decode packet keyword, skipping");
                }
            }
        }
    }

    async fn d_result_normal(self: &Arc<Self>, req_id: &str, body: Vec<u8>) {
        let Some(agent) = self.manager.get(req_id) else {
            warn!(req_id, "decode token for unknown request");
            return;
        };
        if agent.is_ended() {
            warn!(req_id, "decode token for already ended request");
            return;
        }
        self.manager.update_state(req_id, ReqState::RecvTokensFromIns);
        let content_type = if agent.is_stream() {
            "text/event-stream"
        } else {
            "application/json"
        };
        let finished = agent.repeat_d_stream_token(ServerRes::chunk(content_type, body));
        if finished {
            self.manager.update_state(req_id, ReqState::Finish);
        }
    }

    async fn d_result_last(self: &Arc<Self>, req_id: &str, body: Vec<u8>) {
        let Some(agent) = self.manager.get(req_id) else {
            warn!(req_id, "final decode token for unknown request");
            return;
        };
        if agent.is_ended() {
            warn!(req_id, "final decode token for already ended request");
            return;
        }
        self.manager.update_state(req_id, ReqState::RecvTokensFromIns);
        let content_type = if agent.is_stream() {
            "text/event-stream"
        } else {
            "application/json"
        };
        if !agent.is_stream() {
            self.count_output_not_stream(&body, &agent);
            debug!(req_id, "sending final decode answer");
            agent
                .reply()
                .send(ServerRes::full(http::StatusCode::OK, content_type, body));
            self.manager.update_state(req_id, ReqState::Finish);
            return;
        }
        let finished = agent.repeat_d_stream_token(ServerRes::last_chunk(content_type, body));
        if finished {
            self.manager.update_state(req_id, ReqState::Finish);
        }
    }

    async fn d_result_error(self: &Arc<Self>, req_id: &str, body: Vec<u8>) {
        let Some(agent) = self.manager.get(req_id) else {
            warn!(req_id, "decode error for unknown request");
            return;
        };
        if agent.is_ended() {
            warn!(req_id, "decode error for already ended request");
            return;
        }
        let content_type = if agent.is_stream() {
            "text/event-stream"
        } else {
            "application/json"
        };
        agent
            .reply()
            .send(ServerRes::full(http::StatusCode::OK, content_type, body));
        self.manager.update_state(req_id, ReqState::Exception);
    }

    async fn d_result_retry(self: &Arc<Self>, req_id: &str, body: Vec<u8>) {
        let Some(agent) = self.manager.get(req_id) else {
            warn!(req_id, "decode retry for unknown request");
            return;
        };
        self.manager.update_state(req_id, ReqState::Retry);
        if agent.is_ended() {
            warn!(req_id, "decode retry for already ended request");
            return;
        }
        debug!(req_id, "decode requested recompute");
        let mut req = agent.req();
        req.set_header("is-recompute", "true");
        req.body = body;
        agent.set_req(req);
        self.exception.push_req(ReqException::Retry, req_id);
    }

    /// Write on the decode long poll failed.
    pub(crate) async fn d_send_error_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let Some(ins_id) = self.cluster.id_of(conn.ip(), conn.port()) else {
            return;
        };
        if self.cluster.retry_count(ins_id) > self.cfg.max_retry {
            error!(ins_id, addr = %conn.address(), "decode instance exhausted its retry budget");
            self.scheduler.remove_instance(&[ins_id]);
            self.cluster.remove_instance(ins_id);
            return;
        }
        self.cluster.add_retry(ins_id);
        self.exception.push_ins(InsException::ConnDErr, ins_id);
    }

    /// Read on the decode long poll failed.
    pub(crate) async fn d_res_error_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let Some(ins_id) = self.cluster.id_of(conn.ip(), conn.port()) else {
            return;
        };
        self.exception.push_ins(InsException::ConnDErr, ins_id);
    }

    /// Connection-level decode failure: below the retry budget the link is
    /// re-established by the refresh path; past it the node is reported to
    /// the controller for removal.
    pub(crate) async fn conn_d_err_handler(self: Arc<Self>, ins_id: u64) {
        let Some(info) = self.cluster.get_info(ins_id) else {
            error!(ins_id, "decode connection error for unknown instance");
            return;
        };
        if info.role != infermesh_commons::models::cluster_wire::InstanceRole::Decode {
            debug!(ins_id, "instance no longer a decode node, skipping");
            return;
        }
        if self.cfg.backup_enabled && !self.cfg.is_master {
            debug!(ins_id, "standby node skips decode reconnection");
            return;
        }
        error!(ins_id, ip = %info.ip, port = %info.port, "abnormal decode node");
        for req_id in self.manager.requests_of_instance(ins_id) {
            self.exception.push_req(ReqException::DecodeDisConn, &req_id);
        }
        let body = json!({"ip": info.ip, "port": info.port});
        self.report_abnormal_node(body.to_string()).await;
    }
}
