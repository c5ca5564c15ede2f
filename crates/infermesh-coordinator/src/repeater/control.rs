//! Exception-handler wiring, cancellation (stop-infer) and per-instance
//! recovery. Every handler here runs on the exception monitor's single
//! worker, so side effects stay serialized per event kind.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use serde_json::json;
use tracing::{
    debug,
    error,
    info,
    warn,
};

use super::{
    Repeater,
    RETRY_FAILED,
    SEND_P_FAILED,
};
use crate::agent::ReqState;
use crate::exception::{
    InsException,
    ReqException,
    UserException,
};
use crate::repeater::DISPATCH_ATTEMPTS;
use crate::router::schedule_request;

const SCHEDULE_TIMEOUT_TEXT: &str = "Request schedule timeout\r\n";
const FIRST_TOKEN_TIMEOUT_TEXT: &str = "Request first token timeout\r\n";
const INFER_TIMEOUT_TEXT: &str = "Request inference timeout\r\n";
const TOKENIZER_TIMEOUT_TEXT: &str = "Request tokenizer timeout\r\n";

macro_rules! bind_req {
    ($weak:expr, $method:ident) => {{
        let weak = $weak.clone();
        move |req_id: String| {
            let weak = weak.clone();
            async move {
                if let Some(repeater) = weak.upgrade() {
                    repeater.$method(req_id).await;
                }
            }
        }
    }};
}

macro_rules! bind_ins {
    ($weak:expr, $method:ident) => {{
        let weak = $weak.clone();
        move |ins_id: u64| {
            let weak = weak.clone();
            async move {
                if let Some(repeater) = weak.upgrade() {
                    repeater.$method(ins_id).await;
                }
            }
        }
    }};
}

impl Repeater {
    /// Installs every instance/request/user exception handler.
    pub fn register_exception_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let exception = &self.exception;

        exception.reg_ins_handler(InsException::ConnPErr, bind_ins!(weak, conn_p_err_handler));
        exception.reg_ins_handler(InsException::ConnDErr, bind_ins!(weak, conn_d_err_handler));
        exception.reg_ins_handler(InsException::ConnMixErr, bind_ins!(weak, conn_mix_err_handler));
        exception.reg_ins_handler(
            InsException::ConnTokenErr,
            bind_ins!(weak, tokenizer_conn_err_handler),
        );

        exception.reg_req_handler(ReqException::SendPErr, bind_req!(weak, req_send_p_err_handler));
        exception.reg_req_handler(ReqException::Retry, bind_req!(weak, req_retry_handler));
        exception.reg_req_handler(
            ReqException::SendMixErr,
            bind_req!(weak, req_send_mix_err_handler),
        );
        exception.reg_req_handler(
            ReqException::UserDisConn,
            bind_req!(weak, user_dis_conn_handler),
        );
        exception.reg_req_handler(
            ReqException::InferTimeout,
            bind_req!(weak, infer_timeout_handler),
        );
        exception.reg_req_handler(
            ReqException::FirstTokenTimeout,
            bind_req!(weak, first_token_timeout_handler),
        );
        exception.reg_req_handler(
            ReqException::ScheduleTimeout,
            bind_req!(weak, schedule_timeout_handler),
        );
        exception.reg_req_handler(
            ReqException::SendTokenErr,
            bind_req!(weak, tokenizer_send_err_handler),
        );
        exception.reg_req_handler(
            ReqException::TokenizerTimeout,
            bind_req!(weak, tokenizer_timeout_handler),
        );
        exception.reg_req_handler(
            ReqException::RetryDuplicateReqId,
            bind_req!(weak, retry_duplicate_req_id_handler),
        );
        exception.reg_req_handler(
            ReqException::DecodeDisConn,
            bind_req!(weak, decode_dis_conn_handler),
        );

        exception.reg_user_handler(
            UserException::ConnUserErr,
            bind_req!(weak, user_dis_conn_handler),
        );
    }

    /// Probe-and-release reconnection to a prefill instance; removes the
    /// instance when it stays unreachable.
    pub(crate) async fn conn_p_err_handler(self: Arc<Self>, ins_id: u64) {
        let ip = self.cluster.ip(ins_id).unwrap_or_default();
        let port = self.cluster.port(ins_id).unwrap_or_default();
        for _ in 0..self.cfg.max_retry {
            if let Some(conn) = self
                .pool
                .apply_conn(&ip, &port, self.handlers.p.clone(), 0)
                .await
            {
                conn.set_available(true);
                return;
            }
        }
        error!(ins_id, %ip, %port, "prefill instance unreachable, removing");
        self.scheduler.remove_instance(&[ins_id]);
        self.cluster.remove_instance(ins_id);
    }

    pub(crate) async fn conn_mix_err_handler(self: Arc<Self>, ins_id: u64) {
        let ip = self.cluster.ip(ins_id).unwrap_or_default();
        let port = self.cluster.port(ins_id).unwrap_or_default();
        for _ in 0..self.cfg.max_retry {
            if let Some(conn) = self
                .pool
                .apply_conn(&ip, &port, self.handlers.single.clone(), 0)
                .await
            {
                conn.set_available(true);
                return;
            }
        }
        error!(ins_id, %ip, %port, "instance unreachable after retries, removing");
        self.scheduler.remove_instance(&[ins_id]);
        self.cluster.remove_instance(ins_id);
    }

    pub(crate) async fn tokenizer_conn_err_handler(self: Arc<Self>, ins_id: u64) {
        let ip = self.cluster.ip(ins_id).unwrap_or_default();
        let port = self.cluster.port(ins_id).unwrap_or_default();
        for _ in 0..self.cfg.max_retry {
            if let Some(conn) = self
                .pool
                .apply_conn(&ip, &port, self.handlers.tokenizer.clone(), 0)
                .await
            {
                conn.set_available(true);
                return;
            }
        }
        error!(ins_id, %ip, %port, "tokenizer instance unreachable, removing");
        self.scheduler.remove_instance(&[ins_id]);
        self.cluster.remove_instance(ins_id);
    }

    /// Recompute: the scheduler must place the request again from scratch.
    pub(crate) async fn req_retry_handler(self: Arc<Self>, req_id: String) {
        let Some(agent) = self.manager.get(&req_id) else {
            error!(req_id, "retry failed, request is gone");
            return;
        };
        if schedule_request(&agent, &self.scheduler).is_err() {
            self.manager.update_state(&req_id, ReqState::Exception);
        }
    }

    /// Recompute hit a duplicated id on the worker: back off one second and
    /// resend the same request to the same prefill instance.
    pub(crate) async fn retry_duplicate_req_id_handler(self: Arc<Self>, req_id: String) {
        debug!(req_id, "retrying request with duplicate id");
        let Some(agent) = self.manager.get(&req_id) else {
            error!(req_id, "duplicate-id retry failed, request is gone");
            return;
        };
        if agent.retry() > self.cfg.max_retry {
            error!(req_id, retry = agent.retry(), "retry budget exceeded");
            agent
                .reply()
                .send_error(StatusCode::INTERNAL_SERVER_ERROR, RETRY_FAILED);
            self.manager.update_state(&req_id, ReqState::Exception);
            return;
        }
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
                let send_req_id = req_id.clone();
                let send_ip = ip.clone();
                let send_port = port.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    info!(req_id = %send_req_id, ip = %send_ip, port = %send_port,
                        "resending request to prefill node");
                    conn.send_req(&req, Some(&send_req_id)).await;
                });
                return;
            }
            warn!(req_id, %ip, %port, attempt, "reconnect for duplicate-id retry failed");
        }
        error!(req_id, %ip, %port, "duplicate-id retry could not reconnect");
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, SEND_P_FAILED);
        self.manager.update_state(&req_id, ReqState::Exception);
        self.exception.push_ins(InsException::ConnPErr, prefill);
    }

    /// The user went away: cancel inference on the workers.
    pub(crate) async fn user_dis_conn_handler(self: Arc<Self>, req_id: String) {
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "disconnect for unknown request");
            return;
        };
        if agent.has_any_state(&[ReqState::Finish, ReqState::Exception]) {
            warn!(req_id, "disconnect for already ended request");
            return;
        }
        if agent.has_state(ReqState::Repeated) {
            let [prefill, decode] = agent.route();
            let p_addr = (self.cluster.ip(prefill), self.cluster.port(prefill));
            let d_addr = (self.cluster.ip(decode), self.cluster.port(decode));
            if self.cfg.deploy_mode.is_pd() && p_addr != d_addr {
                self.pd_stop_infer(&req_id, false).await;
            } else {
                self.mix_stop_infer(&req_id).await;
            }
        } else {
            self.manager.update_state(&req_id, ReqState::Exception);
        }
    }

    /// The decode long poll went away while the request still waited on its
    /// first token.
    pub(crate) async fn decode_dis_conn_handler(self: Arc<Self>, req_id: String) {
        let Some(agent) = self.manager.get(&req_id) else {
            warn!(req_id, "decode disconnect for unknown request");
            return;
        };
        if agent.has_any_state(&[
            ReqState::Finish,
            ReqState::Exception,
            ReqState::FirstTokenFinish,
        ]) {
            warn!(req_id, "decode disconnect for already progressed request");
            return;
        }
        if agent.has_state(ReqState::Repeated) {
            self.pd_stop_infer(&req_id, false).await;
        } else {
            self.manager.update_state(&req_id, ReqState::Exception);
        }
    }

    pub(crate) async fn schedule_timeout_handler(self: Arc<Self>, req_id: String) {
        error!(req_id, "scheduling timeout");
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        agent
            .reply()
            .send_error(StatusCode::REQUEST_TIMEOUT, SCHEDULE_TIMEOUT_TEXT);
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    pub(crate) async fn first_token_timeout_handler(self: Arc<Self>, req_id: String) {
        error!(req_id, "first token timeout");
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        agent
            .reply()
            .send_error(StatusCode::REQUEST_TIMEOUT, FIRST_TOKEN_TIMEOUT_TEXT);
        self.clone().user_dis_conn_handler(req_id.clone()).await;
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    pub(crate) async fn infer_timeout_handler(self: Arc<Self>, req_id: String) {
        error!(req_id, "inference timeout");
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        agent
            .reply()
            .send_error(StatusCode::REQUEST_TIMEOUT, INFER_TIMEOUT_TEXT);
        self.clone().user_dis_conn_handler(req_id.clone()).await;
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    pub(crate) async fn tokenizer_timeout_handler(self: Arc<Self>, req_id: String) {
        error!(req_id, "tokenizer timeout");
        let Some(agent) = self.manager.get(&req_id) else {
            return;
        };
        agent
            .reply()
            .send_error(StatusCode::REQUEST_TIMEOUT, TOKENIZER_TIMEOUT_TEXT);
        self.manager.update_state(&req_id, ReqState::Exception);
    }

    // --- stop-infer and controller reporting ---

    async fn stop_infer_once(&self, ip: &str, port: &str, model: &str, req_id: &str) -> bool {
        let url = format!("http://{ip}:{port}/v2/models/{model}/stopInfer");
        let body = json!({ "id": req_id });
        match self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.cfg.http_timeout_secs))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(%url, error = %e, "stop infer request failed");
                false
            }
        }
    }

    /// Cancels one request on its P and (unless skipped) D instance.
    pub(crate) async fn pd_stop_infer(self: &Arc<Self>, req_id: &str, skip_decode: bool) {
        debug!(req_id, "handling pd stop request");
        let Some(agent) = self.manager.get(req_id) else {
            return;
        };
        let [p_ip, p_port, d_ip, d_port] = agent.route_ip();
        let model = agent.model_name();
        self.manager.update_state(req_id, ReqState::Exception);
        if !self.manager.are_pd_instances_valid(req_id, skip_decode) {
            warn!(req_id, "pd instances no longer valid, skipping stop request");
            return;
        }
        for _ in 0..self.cfg.max_retry {
            let mut stopped = false;
            info!(req_id, %p_ip, %p_port, "sending stop infer to prefill node");
            if self.stop_infer_once(&p_ip, &p_port, &model, req_id).await {
                stopped = true;
            }
            if !skip_decode {
                info!(req_id, %d_ip, %d_port, "sending stop infer to decode node");
                if self.stop_infer_once(&d_ip, &d_port, &model, req_id).await {
                    stopped = true;
                }
            }
            if stopped {
                break;
            }
        }
    }

    pub(crate) async fn mix_stop_infer(self: &Arc<Self>, req_id: &str) {
        debug!(req_id, "handling mixed stop request");
        let Some(agent) = self.manager.get(req_id) else {
            return;
        };
        let node = agent.route()[0];
        let model = agent.model_name();
        self.manager.update_state(req_id, ReqState::Exception);
        let ip = self.cluster.ip(node).unwrap_or_default();
        let port = self.cluster.port(node).unwrap_or_default();
        for _ in 0..self.cfg.max_retry {
            if self.stop_infer_once(&ip, &port, &model, req_id).await {
                break;
            }
        }
    }

    /// Tells the controller to take an abnormal node out of service.
    pub(crate) async fn report_abnormal_node(&self, node_info: String) {
        let url = format!(
            "http://{}:{}/v1/terminate-service",
            self.cfg.controller_ip, self.cfg.controller_alarm_port
        );
        info!(%url, "sending terminate command to controller");
        match self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.cfg.http_timeout_secs))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(node_info)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!("terminate command accepted by controller");
            }
            Ok(response) => {
                error!(status = %response.status(), "terminate command rejected");
            }
            Err(e) => {
                error!(error = %e, "terminate command failed");
            }
        }
    }
}
