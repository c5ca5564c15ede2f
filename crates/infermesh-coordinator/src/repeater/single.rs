//! Mixed-instance and tokenizer handling. A single-node (or Flex
//! self-forward) response is the complete answer; streaming answers arrive
//! as chunks and end when the worker closes the stream.

use std::sync::Arc;

use http::StatusCode;
use infermesh_transport::ClientConnection;
use tracing::{
    error,
    warn,
};

use super::{
    Repeater,
    DISPATCH_ATTEMPTS,
    READ_INSTANCE_FAILED,
    SEND_INSTANCE_FAILED,
};
use crate::agent::ReqState;
use crate::exception::{
    InsException,
    ReqException,
};
use crate::reply::ServerRes;

impl Repeater {
    pub(crate) async fn single_send_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        if req_id.is_empty() {
            return;
        }
        self.manager.update_state(&req_id, ReqState::Repeated);
    }

    pub(crate) async fn single_send_error_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        if req_id.is_empty() {
            return;
        }
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        if agent.retry() > self.cfg.max_retry {
            agent
                .reply()
                .send_error(StatusCode::INTERNAL_SERVER_ERROR, SEND_INSTANCE_FAILED);
            self.manager.update_state(&req_id, ReqState::Exception);
            return;
        }
        self.exception.push_req(ReqException::SendMixErr, &req_id);
    }

    /// Complete answer (or end of a chunked answer) from a mixed instance.
    pub(crate) async fn single_res_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "mixed response for unknown request");
            return;
        };
        if agent.is_ended() {
            return;
        }
        self.manager.update_state(&req_id, ReqState::RecvTokensFromIns);
        let status = conn.res_status();
        let body = conn.res_body();
        if status != 200 {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            agent.reply().send(ServerRes::full(status, "text/plain", body));
            self.manager.update_state(&req_id, ReqState::Exception);
            return;
        }
        if agent.is_stream() {
            // Chunks already went out; terminate the stream.
            agent
                .reply()
                .send(ServerRes::last_chunk("text/event-stream", Vec::new()));
        } else {
            self.count_output_not_stream(&body, &agent);
            agent
                .reply()
                .send(ServerRes::full(StatusCode::OK, "application/json", body));
        }
        self.manager.update_state(&req_id, ReqState::Finish);
    }

    /// One chunk of a streaming mixed-instance answer.
    pub(crate) async fn single_res_chunk_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        if agent.is_ended() {
            return;
        }
        self.manager.update_state(&req_id, ReqState::RecvTokensFromIns);
        agent
            .reply()
            .send(ServerRes::chunk("text/event-stream", conn.res_chunk_body()));
        agent.add_output_num(1);
        self.manager.update_state(&req_id, ReqState::SendTokensToUser);
    }

    pub(crate) async fn single_res_error_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        if agent.is_ended() {
            return;
        }
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, READ_INSTANCE_FAILED);
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    /// Re-dispatch after a failed write to a mixed instance.
    pub(crate) async fn req_send_mix_err_handler(self: Arc<Self>, req_id: String) {
        let Some(agent) = self.manager.get(&req_id) else {
            error!(req_id, "cannot retry mixed dispatch, request is gone");
            return;
        };
        let node = agent.route()[0];
        let ip = self.cluster.ip(node).unwrap_or_default();
        let port = self.cluster.port(node).unwrap_or_default();
        let req = agent.req();
        for attempt in 1..=DISPATCH_ATTEMPTS {
            if let Some(conn) = self
                .pool
                .apply_conn(&ip, &port, self.handlers.single.clone(), 0)
                .await
            {
                agent.set_client_conn(Some(conn.clone()));
                agent.add_retry();
                conn.send_req(&req, Some(&req_id)).await;
                return;
            }
            warn!(req_id, %ip, %port, attempt, "reconnect to instance failed");
        }
        error!(req_id, %ip, %port, "reconnect to instance failed, giving up");
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, SEND_INSTANCE_FAILED);
        self.exception.push_ins(InsException::ConnMixErr, node);
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    // --- tokenizer callbacks ---

    pub(crate) async fn tokenizer_req_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        if req_id.is_empty() {
            return;
        }
        self.manager.update_state(&req_id, ReqState::Repeated);
    }

    pub(crate) async fn tokenizer_req_err_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        if req_id.is_empty() {
            return;
        }
        self.exception.push_req(ReqException::SendTokenErr, &req_id);
    }

    pub(crate) async fn tokenizer_res_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        if agent.is_ended() {
            return;
        }
        let status = conn.res_status();
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        agent
            .reply()
            .send(ServerRes::full(status, "application/json", conn.res_body()));
        conn.set_available(true);
        let final_state = if status == StatusCode::OK {
            ReqState::Finish
        } else {
            ReqState::Exception
        };
        self.manager.update_state(&req_id, final_state);
    }

    pub(crate) async fn tokenizer_res_err_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        if agent.is_ended() {
            return;
        }
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, READ_INSTANCE_FAILED);
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    /// Re-dispatch a tokenizer request after a failed write.
    pub(crate) async fn tokenizer_send_err_handler(self: Arc<Self>, req_id: String) {
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        let node = agent.route()[0];
        let ip = self.cluster.ip(node).unwrap_or_default();
        let port = self.cluster.port(node).unwrap_or_default();
        let req = agent.req();
        for _ in 1..=DISPATCH_ATTEMPTS {
            if let Some(conn) = self
                .pool
                .apply_conn(&ip, &port, self.handlers.tokenizer.clone(), 0)
                .await
            {
                agent.set_client_conn(Some(conn.clone()));
                agent.add_retry();
                conn.send_req(&req, Some(&req_id)).await;
                return;
            }
        }
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, SEND_INSTANCE_FAILED);
        self.exception.push_ins(InsException::ConnTokenErr, node);
        self.manager.update_state(&req_id, ReqState::Exception);
    }
}
