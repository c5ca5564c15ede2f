//! Prefill-side response handling: the P response carries the first token
//! (and, for non-streaming requests, the whole answer).

use std::sync::Arc;

use http::StatusCode;
use infermesh_transport::ClientConnection;
use serde_json::Value;
use tracing::{
    error,
    warn,
};

use super::{
    Repeater,
    P_INSTANCE_ERROR,
    READ_P_FAILED,
    SEND_P_FAILED,
};
use crate::agent::{
    ReqAgent,
    ReqKind,
    ReqState,
};
use crate::exception::{
    InsException,
    ReqException,
};
use crate::repeater::DISPATCH_ATTEMPTS;
use crate::reply::ServerRes;

impl Repeater {
    /// Request write to P succeeded.
    pub(crate) async fn p_send_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        if req_id.is_empty() {
            return;
        }
        self.manager.update_state(&req_id, ReqState::Repeated);
    }

    /// Request write to P failed; retry through the exception queue until
    /// the budget runs out.
    pub(crate) async fn p_send_error_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        if req_id.is_empty() {
            return;
        }
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "send error for unknown request");
            return;
        };
        if agent.retry() > self.cfg.max_retry {
            let prefill = agent.route()[0];
            error!(req_id, prefill, "send request to prefill instance failed");
            agent
                .reply()
                .send_error(StatusCode::INTERNAL_SERVER_ERROR, SEND_P_FAILED);
            self.manager.update_state(&req_id, ReqState::Exception);
            return;
        }
        self.exception.push_req(ReqException::SendPErr, &req_id);
    }

    /// Reading the P response failed.
    pub(crate) async fn p_res_error_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        if req_id.is_empty() {
            return;
        }
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "response error for unknown request");
            return;
        };
        if agent.is_ended() {
            return;
        }
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, READ_P_FAILED);
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    /// Full P response arrived.
    pub(crate) async fn p_res_handler(self: Arc<Self>, conn: Arc<ClientConnection>) {
        let req_id = conn.req_id();
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "response for unknown request");
            return;
        };
        if agent.is_ended() {
            warn!(req_id, "response for already ended request");
            return;
        }
        self.manager.update_state(&req_id, ReqState::RecvTokensFromIns);
        let status = conn.res_status();
        let body = conn.res_body();
        if status != 200 {
            self.deal_p_res_error(&agent, &conn, status, body).await;
        } else {
            self.deal_p_res(&agent, &conn, body).await;
        }
    }

    async fn deal_p_res_error(
        self: &Arc<Self>, agent: &Arc<ReqAgent>, conn: &Arc<ClientConnection>, status: u16,
        body: Vec<u8>,
    ) {
        let req_id = agent.req_id();
        error!(req_id, status, "prefill failed: {}", String::from_utf8_lossy(&body));
        if agent.has_state(ReqState::Retry) {
            // A recompute ran into a duplicated request id on the worker;
            // return the connection and go around once more.
            warn!(req_id, "retry failed on duplicate request id, trying again");
            conn.set_available(true);
            self.exception
                .push_req(ReqException::RetryDuplicateReqId, req_id);
            return;
        }
        let status =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        agent
            .reply()
            .send(ServerRes::full(status, "text/plain", body));
        self.p_res_finish(conn).await;
        self.manager.update_state(req_id, ReqState::Exception);
    }

    async fn deal_p_res(
        self: &Arc<Self>, agent: &Arc<ReqAgent>, conn: &Arc<ClientConnection>, body: Vec<u8>,
    ) {
        let req_id = agent.req_id().to_string();
        if agent.has_state(ReqState::Retry) {
            agent.clear_retry();
        }
        let parsed: Result<Value, _> = serde_json::from_slice(&body);
        let Ok(json) = parsed else {
            error!(req_id, "failed to parse prefill response body");
            agent
                .reply()
                .send_error(StatusCode::INTERNAL_SERVER_ERROR, P_INSTANCE_ERROR);
            self.manager.update_state(&req_id, ReqState::Exception);
            return;
        };
        let Some(received_id) = json.get("reqId").and_then(Value::as_str) else {
            error!(req_id, "prefill response missing reqId");
            agent
                .reply()
                .send_error(StatusCode::INTERNAL_SERVER_ERROR, P_INSTANCE_ERROR);
            self.manager.update_state(&req_id, ReqState::Exception);
            return;
        };
        if received_id != req_id {
            error!(req_id, received_id, "mismatched request id in prefill response");
            return;
        }
        if agent.is_stream() {
            self.p_res_stream_handler(agent, conn, &json).await;
        } else {
            self.p_res_not_stream_handler(agent, conn, &json).await;
        }
    }

    async fn p_res_stream_handler(
        self: &Arc<Self>, agent: &Arc<ReqAgent>, conn: &Arc<ClientConnection>, json: &Value,
    ) {
        let req_id = agent.req_id().to_string();
        let (Some(data), Some(is_last)) = (
            json.get("output").and_then(Value::as_str),
            json.get("isLastResp").and_then(Value::as_bool),
        ) else {
            error!(req_id, "malformed streaming prefill response");
            agent
                .reply()
                .send_error(StatusCode::INTERNAL_SERVER_ERROR, P_INSTANCE_ERROR);
            self.p_res_finish(conn).await;
            self.manager.update_state(&req_id, ReqState::Exception);
            return;
        };
        self.send_p_res_stream(agent, conn, data.as_bytes().to_vec(), is_last)
            .await;
    }

    async fn send_p_res_stream(
        self: &Arc<Self>, agent: &Arc<ReqAgent>, conn: &Arc<ClientConnection>, data: Vec<u8>,
        is_last: bool,
    ) {
        let req_id = agent.req_id().to_string();
        if is_last {
            // First token is also the last; the request is complete.
            agent
                .reply()
                .send(ServerRes::last_chunk("text/event-stream", data));
            agent.add_output_num(1);
            self.p_res_finish(conn).await;
            self.manager.update_state(&req_id, ReqState::Finish);
            return;
        }
        self.p_res_finish(conn).await;
        let finished = agent.repeat_p_stream_token(ServerRes::chunk("text/event-stream", data));
        if finished {
            self.manager.update_state(&req_id, ReqState::Finish);
        }
    }

    async fn p_res_not_stream_handler(
        self: &Arc<Self>, agent: &Arc<ReqAgent>, conn: &Arc<ClientConnection>, json: &Value,
    ) {
        let req_id = agent.req_id().to_string();
        let is_last = json
            .get("isLastResp")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_last {
            let Some(data) = json.get("output").and_then(Value::as_str) else {
                error!(req_id, "malformed non-streaming prefill response");
                agent
                    .reply()
                    .send_error(StatusCode::INTERNAL_SERVER_ERROR, P_INSTANCE_ERROR);
                self.p_res_finish(conn).await;
                self.manager.update_state(&req_id, ReqState::Exception);
                return;
            };
            self.count_output_not_stream(data.as_bytes(), agent);
            agent.reply().send(ServerRes::full(
                StatusCode::OK,
                "application/json",
                data.as_bytes().to_vec(),
            ));
            self.manager.update_state(&req_id, ReqState::Finish);
        }
        self.p_res_finish(conn).await;
    }

    /// Prefill phase ends for this request on this connection.
    pub(crate) async fn p_res_finish(self: &Arc<Self>, conn: &Arc<ClientConnection>) {
        let req_id = conn.req_id();
        self.manager.update_state(&req_id, ReqState::FirstTokenFinish);
    }

    /// Retry dispatch after a write failure: re-apply a connection and
    /// resend the stored request.
    pub(crate) async fn req_send_p_err_handler(self: Arc<Self>, req_id: String) {
        let Some(agent) = self.manager.get(&req_id) else {
            error!(req_id, "cannot retry, request is gone");
            return;
        };
        let prefill = agent.route()[0];
        let ip = self.cluster.ip(prefill).unwrap_or_default();
        let port = self.cluster.port(prefill).unwrap_or_default();
        let req = agent.req();
        for attempt in 1..=DISPATCH_ATTEMPTS {
            if let Some(conn) = self
                .pool
                .apply_conn(&ip, &port, self.handlers.p.clone(), 0)
                .await
            {
                agent.set_client_conn(Some(conn.clone()));
                agent.add_retry();
                conn.send_req(&req, Some(&req_id)).await;
                return;
            }
            warn!(req_id, %ip, %port, attempt, "reconnect to prefill instance failed");
        }
        error!(req_id, %ip, %port, "reconnect to prefill instance failed, giving up");
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, SEND_P_FAILED);
        self.manager.update_state(&req_id, ReqState::Exception);
        self.exception.push_ins(InsException::ConnPErr, prefill);
    }

    // --- output-token accounting for non-streaming answers ---

    pub(crate) fn count_output_not_stream(&self, data: &[u8], agent: &Arc<ReqAgent>) {
        match agent.kind() {
            ReqKind::Tgi | ReqKind::MindIe => self.count_output_tgi_or_mindie(data, agent),
            ReqKind::Vllm => self.count_output_vllm(data, agent),
            ReqKind::OpenAi => self.count_output_openai(data, agent),
            ReqKind::Triton => self.count_output_triton(data, agent),
            ReqKind::Tokenizer => {}
        }
    }

    fn by_token_rate(&self, chars: usize) -> usize {
        (chars as f64 / self.cfg.str_token_rate) as usize
    }

    fn count_output_triton(&self, data: &[u8], agent: &Arc<ReqAgent>) {
        let Ok(json) = serde_json::from_slice::<Value>(data) else {
            error!(req_id = agent.req_id(), "failed to parse triton output");
            return;
        };
        if let Some(text) = json.get("text_output").and_then(Value::as_str) {
            agent.add_output_num(self.by_token_rate(text.len()));
            return;
        }
        let Some(outputs) = json.get("outputs").and_then(Value::as_array) else {
            error!(req_id = agent.req_id(), "triton output missing outputs array");
            return;
        };
        for output in outputs {
            if let Some(tokens) = output.get("data").and_then(Value::as_array) {
                agent.add_output_num(tokens.len());
            }
        }
    }

    fn count_output_openai(&self, data: &[u8], agent: &Arc<ReqAgent>) {
        let Ok(json) = serde_json::from_slice::<Value>(data) else {
            error!(req_id = agent.req_id(), "failed to parse openai output");
            return;
        };
        let Some(choices) = json.get("choices").and_then(Value::as_array) else {
            return;
        };
        for choice in choices {
            if let Some(message) = choice.get("message") {
                agent.add_output_num(self.by_token_rate(message.to_string().len()));
            }
        }
    }

    fn count_output_vllm(&self, data: &[u8], agent: &Arc<ReqAgent>) {
        let Ok(json) = serde_json::from_slice::<Value>(data) else {
            error!(req_id = agent.req_id(), "failed to parse vllm output");
            return;
        };
        let Some(texts) = json.get("text").and_then(Value::as_array) else {
            return;
        };
        for text in texts {
            if let Some(text) = text.as_str() {
                agent.add_output_num(self.by_token_rate(text.len()));
            }
        }
    }

    fn count_output_tgi_or_mindie(&self, data: &[u8], agent: &Arc<ReqAgent>) {
        let Ok(json) = serde_json::from_slice::<Value>(data) else {
            error!(req_id = agent.req_id(), "failed to parse generated text output");
            return;
        };
        if let Some(text) = json.get("generated_text").and_then(Value::as_str) {
            agent.add_output_num(self.by_token_rate(text.len()));
        }
    }
}
