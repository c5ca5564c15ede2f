//! Front-door HTTP routing: maps the inference API surface onto request
//! kinds, runs the shared entry checks and hands each admitted request to
//! the scheduler.

use std::io;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Arc;

use http::{
    Method,
    StatusCode,
};
use http_body_util::{
    BodyExt,
    Full,
};
use infermesh_cluster::ClusterNodes;
use infermesh_commons::models::cluster_wire::{
    ClusterViewBody,
    TerminateServiceBody,
};
use infermesh_commons::utils::config::CoordinatorConfig;
use infermesh_commons::utils::ids::{
    next_request_id,
    next_tokenizer_id,
};
use infermesh_transport::HttpRequest;
use serde_json::Value;
use tracing::{
    error,
    warn,
};

use crate::agent::{
    ReqAgent,
    ReqKind,
    ReqState,
};
use crate::exception::{
    ExceptionMonitor,
    UserException,
};
use crate::manager::ReqManager;
use crate::metrics::MetricsListener;
use crate::repeater::Repeater;
use crate::reply::{
    ReplyBody,
    ServerReply,
    ServerRes,
};
use crate::scheduler::{
    SchedInput,
    Scheduler,
};
use crate::sync::SyncContext;

const NOT_READY: &str = "MindIE-MS Coordinator is not ready\r\n";
const TOO_MANY: &str = "Too many requests\r\n";
const INVALID_FORMAT: &str = "Request format is invalid\r\n";
const DUPLICATE_ID: &str = "Duplicate request id\r\n";
const SCHEDULER_FAILED: &str = "Scheduler proc req failed\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiRoute {
    Triton,
    TgiStream,
    TgiOrVllm,
    OpenAi,
    MindIe,
    Tokenizer,
    Refresh,
    Terminate,
    Metrics,
    Unknown,
}

fn resolve(method: &Method, path: &str) -> ApiRoute {
    if path.starts_with("/v2/models/")
        && (path.ends_with("/generate") || path.ends_with("/generate_stream")
            || path.ends_with("/infer"))
    {
        return ApiRoute::Triton;
    }
    match (method, path) {
        (&Method::POST, "/generate_stream") => ApiRoute::TgiStream,
        (&Method::POST, "/generate") => ApiRoute::TgiOrVllm,
        (&Method::POST, "/v1/chat/completions") | (&Method::POST, "/v1/completions") => {
            ApiRoute::OpenAi
        }
        (&Method::POST, "/infer") => ApiRoute::MindIe,
        (&Method::POST, "/v1/tokenizer") => ApiRoute::Tokenizer,
        (&Method::POST, "/v1/refresh") => ApiRoute::Refresh,
        (&Method::POST, "/v1/terminate-service") => ApiRoute::Terminate,
        (&Method::GET, "/metrics") => ApiRoute::Metrics,
        _ => ApiRoute::Unknown,
    }
}

pub struct Router {
    cfg: Arc<CoordinatorConfig>,
    cluster: Arc<ClusterNodes>,
    manager: Arc<ReqManager>,
    scheduler: Arc<dyn Scheduler>,
    repeater: Arc<Repeater>,
    exception: Arc<ExceptionMonitor>,
    metrics: Arc<MetricsListener>,
    sync: Arc<SyncContext>,
    standby_abnormal: AtomicBool,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<CoordinatorConfig>, cluster: Arc<ClusterNodes>, manager: Arc<ReqManager>,
        scheduler: Arc<dyn Scheduler>, repeater: Arc<Repeater>, exception: Arc<ExceptionMonitor>,
        metrics: Arc<MetricsListener>, sync: Arc<SyncContext>,
    ) -> Self {
        Self {
            cfg,
            cluster,
            manager,
            scheduler,
            repeater,
            exception,
            metrics,
            sync,
            standby_abnormal: AtomicBool::new(false),
        }
    }

    pub fn set_standby_abnormal(&self, abnormal: bool) {
        self.standby_abnormal.store(abnormal, Ordering::Release);
    }

    pub async fn handle(
        &self, req: http::Request<hyper::body::Incoming>,
    ) -> Result<http::Response<ReplyBody>, io::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes().to_vec(),
            Err(e) => {
                warn!(%path, error = %e, "failed to read request body");
                return Ok(plain(StatusCode::BAD_REQUEST, INVALID_FORMAT));
            }
        };

        match resolve(&method, &path) {
            ApiRoute::Triton => self.handle_inference(ReqKind::Triton, path, body).await,
            ApiRoute::TgiStream => self.handle_inference(ReqKind::Tgi, path, body).await,
            ApiRoute::TgiOrVllm => {
                let kind = match serde_json::from_slice::<Value>(&body) {
                    Ok(json) if json.get("inputs").is_some() => ReqKind::Tgi,
                    Ok(json) if json.get("prompt").is_some() => ReqKind::Vllm,
                    Ok(_) => return Ok(plain(StatusCode::BAD_REQUEST, INVALID_FORMAT)),
                    Err(_) => return Ok(plain(StatusCode::BAD_REQUEST, INVALID_FORMAT)),
                };
                self.handle_inference(kind, path, body).await
            }
            ApiRoute::OpenAi => self.handle_inference(ReqKind::OpenAi, path, body).await,
            ApiRoute::MindIe => self.handle_inference(ReqKind::MindIe, path, body).await,
            ApiRoute::Tokenizer => self.handle_inference(ReqKind::Tokenizer, path, body).await,
            ApiRoute::Refresh => Ok(self.handle_refresh(&body).await),
            ApiRoute::Terminate => Ok(self.handle_terminate(&body).await),
            ApiRoute::Metrics => Ok(self.handle_metrics().await),
            ApiRoute::Unknown => Ok(plain(StatusCode::NOT_FOUND, INVALID_FORMAT)),
        }
    }

    async fn handle_inference(
        &self, kind: ReqKind, path: String, body: Vec<u8>,
    ) -> Result<http::Response<ReplyBody>, io::Error> {
        self.manager.note_arrival();
        let (reply, receiver) = ServerReply::channel();

        if !self.cluster.is_available() {
            reply.send_error(StatusCode::SERVICE_UNAVAILABLE, NOT_READY);
            return Ok(receiver.into_response(|| {}).await);
        }
        self.manager.check_congestion_alarm();
        if self.manager.req_num() >= self.cfg.max_reqs {
            reply.send_error(StatusCode::TOO_MANY_REQUESTS, TOO_MANY);
            return Ok(receiver.into_response(|| {}).await);
        }
        if self.cfg.backup_enabled
            && !self.cfg.is_master
            && self.standby_abnormal.load(Ordering::Acquire)
        {
            // Abnormal standby drops the request without answering.
            return Err(io::Error::other("standby node dropped the request"));
        }
        if self.cfg.backup_enabled && self.cfg.is_master {
            self.repeater.create_links_with_d_nodes().await;
        }

        if serde_json::from_slice::<Value>(&body).is_err() {
            reply.send_error(StatusCode::BAD_REQUEST, INVALID_FORMAT);
            return Ok(receiver.into_response(|| {}).await);
        }

        let req_id = if kind == ReqKind::Tokenizer {
            next_tokenizer_id()
        } else {
            next_request_id()
        };
        let mut forward = HttpRequest::post(&path, body);
        forward.set_header("content-type", "application/json");
        if !self.manager.add_req(&req_id, kind, reply.clone(), forward) {
            error!(req_id, "duplicate request id detected");
            reply.send_error(StatusCode::BAD_REQUEST, DUPLICATE_ID);
            return Ok(receiver.into_response(|| {}).await);
        }
        self.manager.update_state(&req_id, ReqState::Arrive);

        let Some(agent) = self.manager.get(&req_id) else {
            reply.send_error(StatusCode::INTERNAL_SERVER_ERROR, SCHEDULER_FAILED);
            return Ok(receiver.into_response(|| {}).await);
        };
        if kind == ReqKind::Tokenizer {
            match self.cluster.tokenizer_instance() {
                Some(ins) => {
                    self.repeater.single_node_handler(req_id.clone(), ins).await;
                }
                None => {
                    reply.send_error(StatusCode::SERVICE_UNAVAILABLE, NOT_READY);
                    self.manager.update_state(&req_id, ReqState::Exception);
                }
            }
        } else if schedule_request(&agent, &self.scheduler).is_err() {
            self.manager.update_state(&req_id, ReqState::Exception);
        }

        let exception = self.exception.clone();
        let hook_req_id = req_id.clone();
        Ok(receiver
            .into_response(move || {
                error!(req_id = %hook_req_id, "request closed with exception");
                exception.push_user(UserException::ConnUserErr, &hook_req_id);
            })
            .await)
    }

    async fn handle_refresh(&self, body: &[u8]) -> http::Response<ReplyBody> {
        let view: ClusterViewBody = match serde_json::from_slice(body) {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "invalid refresh body");
                return plain(StatusCode::BAD_REQUEST, INVALID_FORMAT);
            }
        };
        match self.sync.handle_refresh(view).await {
            Ok(()) => json(StatusCode::OK, "{\"result\":\"ok\"}"),
            Err(e) => {
                error!(error = %e, "cluster refresh rejected");
                plain(StatusCode::BAD_REQUEST, INVALID_FORMAT)
            }
        }
    }

    async fn handle_terminate(&self, body: &[u8]) -> http::Response<ReplyBody> {
        let target: TerminateServiceBody = match serde_json::from_slice(body) {
            Ok(target) => target,
            Err(_) => return plain(StatusCode::BAD_REQUEST, INVALID_FORMAT),
        };
        self.sync.handle_terminate(&target).await;
        json(StatusCode::OK, "{\"result\":\"ok\"}")
    }

    async fn handle_metrics(&self) -> http::Response<ReplyBody> {
        match self.metrics.handle().await {
            Ok(text) => {
                let (reply, receiver) = ServerReply::channel();
                reply.send(ServerRes::full(
                    StatusCode::OK,
                    "text/plain; version=0.0.4",
                    text.into_bytes(),
                ));
                receiver.into_response(|| {}).await
            }
            Err(e) => {
                warn!(error = %e, "metrics aggregation failed");
                plain(StatusCode::SERVICE_UNAVAILABLE, "")
            }
        }
    }
}

fn plain(status: StatusCode, text: &str) -> http::Response<ReplyBody> {
    build_response(status, "text/plain", text)
}

fn json(status: StatusCode, text: &str) -> http::Response<ReplyBody> {
    build_response(status, "application/json", text)
}

fn build_response(status: StatusCode, content_type: &str, text: &str) -> http::Response<ReplyBody> {
    let mut response =
        http::Response::new(Full::new(bytes::Bytes::from(text.to_string())).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_str(content_type)
            .unwrap_or(http::HeaderValue::from_static("text/plain")),
    );
    response
}

// --- per-API scheduling (shared by the entry path and the retry handler) ---

/// Parses the agent's stored request by kind, records the stream flag and
/// admits the request to the scheduler. Error responses go straight to the
/// client; the caller marks the agent EXCEPTION on `Err`.
pub(crate) fn schedule_request(
    agent: &Arc<ReqAgent>, scheduler: &Arc<dyn Scheduler>,
) -> Result<(), ()> {
    let req = agent.req();
    let reply = agent.reply().clone();
    let body: Value = match serde_json::from_slice(&req.body) {
        Ok(body) => body,
        Err(_) => {
            reply.send_error(StatusCode::BAD_REQUEST, INVALID_FORMAT);
            return Err(());
        }
    };
    match agent.kind() {
        ReqKind::Triton => deal_triton(agent, scheduler, &req.target, &body),
        ReqKind::Tgi => deal_tgi(agent, scheduler, &req.target, &body),
        ReqKind::Vllm => deal_vllm(agent, scheduler, &body),
        ReqKind::OpenAi => deal_openai(agent, scheduler, &body),
        ReqKind::MindIe => deal_mindie(agent, scheduler, &body),
        ReqKind::Tokenizer => Ok(()),
    }
}

fn proc(
    agent: &Arc<ReqAgent>, scheduler: &Arc<dyn Scheduler>, input: SchedInput<'_>,
) -> Result<(), ()> {
    if let Err(e) = scheduler.proc_req(agent.req_id(), input, agent.kind()) {
        error!(req_id = agent.req_id(), error = %e, "scheduler process request failed");
        agent
            .reply()
            .send_error(StatusCode::INTERNAL_SERVER_ERROR, SCHEDULER_FAILED);
        return Err(());
    }
    Ok(())
}

fn invalid(agent: &Arc<ReqAgent>) -> Result<(), ()> {
    agent.reply().send_error(StatusCode::BAD_REQUEST, INVALID_FORMAT);
    Err(())
}

fn triton_model_missing(path: &str) -> bool {
    let Some(rest) = path.split("models/").nth(1) else {
        return true;
    };
    match rest.split('/').next() {
        Some(model) => model.is_empty(),
        None => true,
    }
}

fn deal_triton(
    agent: &Arc<ReqAgent>, scheduler: &Arc<dyn Scheduler>, path: &str, body: &Value,
) -> Result<(), ()> {
    if triton_model_missing(path) {
        error!(req_id = agent.req_id(), "no model specified in request url");
        return invalid(agent);
    }
    agent.set_is_stream(triton_is_stream(path));
    if let Some(prompt) = body.get("text_input").and_then(Value::as_str) {
        return proc(agent, scheduler, SchedInput::Text(prompt));
    }
    let Some(inputs) = body.get("inputs").and_then(|inputs| inputs.get(0)) else {
        return invalid(agent);
    };
    if inputs.get("datatype").and_then(Value::as_str) != Some("UINT32") {
        error!(req_id = agent.req_id(), "unsupported triton input datatype");
        return invalid(agent);
    }
    let Some(data) = inputs.get("data").and_then(Value::as_array) else {
        return invalid(agent);
    };
    let mut tokens = Vec::with_capacity(data.len());
    for value in data {
        match value.as_u64().and_then(|v| u32::try_from(v).ok()) {
            Some(token) => tokens.push(token),
            None => return invalid(agent),
        }
    }
    proc(agent, scheduler, SchedInput::Tokens(&tokens))
}

fn deal_tgi(
    agent: &Arc<ReqAgent>, scheduler: &Arc<dyn Scheduler>, path: &str, body: &Value,
) -> Result<(), ()> {
    agent.set_is_stream(tgi_is_stream(path, body));
    let Some(inputs) = body.get("inputs").and_then(Value::as_str) else {
        return invalid(agent);
    };
    proc(agent, scheduler, SchedInput::Text(inputs))
}

fn deal_vllm(agent: &Arc<ReqAgent>, scheduler: &Arc<dyn Scheduler>, body: &Value) -> Result<(), ()> {
    agent.set_is_stream(body_stream_flag(body));
    let Some(prompt) = body.get("prompt").and_then(Value::as_str) else {
        return invalid(agent);
    };
    proc(agent, scheduler, SchedInput::Text(prompt))
}

fn deal_openai(
    agent: &Arc<ReqAgent>, scheduler: &Arc<dyn Scheduler>, body: &Value,
) -> Result<(), ()> {
    agent.set_is_stream(body_stream_flag(body));
    let inputs = if let Some(prompt) = body.get("prompt") {
        prompt.to_string()
    } else if let Some(messages) = body.get("messages") {
        messages.to_string()
    } else {
        agent.reply().send_error(
            StatusCode::BAD_REQUEST,
            "Invalid request format: Missing both 'prompt' or 'messages'\r\n",
        );
        return Err(());
    };
    proc(agent, scheduler, SchedInput::Text(&inputs))
}

fn deal_mindie(
    agent: &Arc<ReqAgent>, scheduler: &Arc<dyn Scheduler>, body: &Value,
) -> Result<(), ()> {
    agent.set_is_stream(body_stream_flag(body));
    let has_inputs = body.get("inputs").is_some();
    let has_input_id = body.get("input_id").is_some();
    if has_inputs && has_input_id {
        error!(req_id = agent.req_id(), "body contains both input_id and inputs");
        return invalid(agent);
    }
    let input_len = if has_inputs {
        match body.get("inputs").and_then(Value::as_str) {
            Some(inputs) => inputs.len(),
            None => return invalid(agent),
        }
    } else if has_input_id {
        match body.get("input_id").and_then(Value::as_array) {
            Some(ids) => ids.len(),
            None => return invalid(agent),
        }
    } else {
        return invalid(agent);
    };
    proc(agent, scheduler, SchedInput::Len(input_len))
}

// --- stream detection ---

fn triton_is_stream(path: &str) -> bool {
    if path.contains("infer") {
        return false;
    }
    path.contains("generate_stream")
}

fn tgi_is_stream(path: &str, body: &Value) -> bool {
    if path.contains("generate_stream") {
        return true;
    }
    if path.contains("generate") {
        return false;
    }
    body_stream_flag(body)
}

fn body_stream_flag(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table() {
        assert_eq!(
            resolve(&Method::POST, "/v2/models/llama/generate"),
            ApiRoute::Triton
        );
        assert_eq!(
            resolve(&Method::POST, "/v2/models/llama/versions/3/generate_stream"),
            ApiRoute::Triton
        );
        assert_eq!(resolve(&Method::POST, "/v2/models/llama/infer"), ApiRoute::Triton);
        assert_eq!(resolve(&Method::POST, "/generate"), ApiRoute::TgiOrVllm);
        assert_eq!(resolve(&Method::POST, "/generate_stream"), ApiRoute::TgiStream);
        assert_eq!(resolve(&Method::POST, "/v1/chat/completions"), ApiRoute::OpenAi);
        assert_eq!(resolve(&Method::POST, "/v1/completions"), ApiRoute::OpenAi);
        assert_eq!(resolve(&Method::POST, "/infer"), ApiRoute::MindIe);
        assert_eq!(resolve(&Method::POST, "/v1/tokenizer"), ApiRoute::Tokenizer);
        assert_eq!(resolve(&Method::POST, "/v1/refresh"), ApiRoute::Refresh);
        assert_eq!(
            resolve(&Method::POST, "/v1/terminate-service"),
            ApiRoute::Terminate
        );
        assert_eq!(resolve(&Method::GET, "/metrics"), ApiRoute::Metrics);
        assert_eq!(resolve(&Method::GET, "/unknown"), ApiRoute::Unknown);
    }

    #[test]
    fn test_triton_stream_detection() {
        assert!(triton_is_stream("/v2/models/m/generate_stream"));
        assert!(!triton_is_stream("/v2/models/m/generate"));
        // Triton infer is always non-stream, even with a stream-ish name.
        assert!(!triton_is_stream("/v2/models/m/infer"));
    }

    #[test]
    fn test_tgi_stream_detection() {
        let body = serde_json::json!({"inputs": "hi", "stream": true});
        assert!(tgi_is_stream("/generate_stream", &body));
        assert!(!tgi_is_stream("/generate", &body));
        let other = serde_json::json!({"stream": true});
        assert!(tgi_is_stream("/other", &other));
        let unset = serde_json::json!({});
        assert!(!tgi_is_stream("/other", &unset));
    }

    #[test]
    fn test_body_stream_flag() {
        assert!(body_stream_flag(&serde_json::json!({"stream": true})));
        assert!(!body_stream_flag(&serde_json::json!({"stream": false})));
        assert!(!body_stream_flag(&serde_json::json!({})));
    }

    #[test]
    fn test_triton_model_segment() {
        assert!(triton_model_missing("/v2/models//generate"));
        assert!(triton_model_missing("/v2/nothing"));
        assert!(!triton_model_missing("/v2/models/llama/generate"));
    }
}
