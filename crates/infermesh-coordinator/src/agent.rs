use std::collections::{
    HashMap,
    VecDeque,
};
use std::sync::atomic::{
    AtomicBool,
    AtomicUsize,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::Instant;

use infermesh_transport::{
    ClientConnection,
    HttpRequest,
};

use crate::reply::{
    ServerReply,
    ServerRes,
};

/// Sentinel for a route slot that was never assigned.
pub const UNKNOWN_ID: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqKind {
    Tgi,
    Vllm,
    OpenAi,
    Triton,
    MindIe,
    Tokenizer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqState {
    Arrive,
    Scheduled,
    Repeated,
    FirstTokenFinish,
    Finish,
    SendTokensToUser,
    RecvTokensFromIns,
    Exception,
    Timeout,
    Retry,
}

/// Canonical record of one in-flight request.
///
/// The `pd_sync` mutex serializes first-token delivery against decode tokens:
/// decode tokens that arrive before the prefill first token are parked in the
/// wait queue and flushed in arrival order right after the first token goes
/// out.
pub struct ReqAgent {
    req_id: String,
    kind: ReqKind,
    reply: Arc<ServerReply>,
    req: StdMutex<HttpRequest>,
    is_stream: AtomicBool,
    output_num: AtomicUsize,
    retry: AtomicUsize,
    route: StdMutex<[u64; 2]>,
    route_ip: StdMutex<[String; 4]>,
    model_name: StdMutex<String>,
    states: StdMutex<HashMap<ReqState, Vec<Instant>>>,
    pd_sync: StdMutex<VecDeque<ServerRes>>,
    client_conn: StdMutex<Option<Arc<ClientConnection>>>,
}

impl ReqAgent {
    pub fn new(req_id: &str, kind: ReqKind, reply: Arc<ServerReply>, req: HttpRequest) -> Self {
        reply.set_req_id(req_id);
        Self {
            req_id: req_id.to_string(),
            kind,
            reply,
            req: StdMutex::new(req),
            is_stream: AtomicBool::new(true),
            output_num: AtomicUsize::new(0),
            retry: AtomicUsize::new(0),
            route: StdMutex::new([UNKNOWN_ID; 2]),
            route_ip: StdMutex::new(Default::default()),
            model_name: StdMutex::new(String::new()),
            states: StdMutex::new(HashMap::new()),
            pd_sync: StdMutex::new(VecDeque::new()),
            client_conn: StdMutex::new(None),
        }
    }

    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    pub fn kind(&self) -> ReqKind {
        self.kind
    }

    pub fn reply(&self) -> &Arc<ServerReply> {
        &self.reply
    }

    pub fn is_stream(&self) -> bool {
        self.is_stream.load(Ordering::Acquire)
    }

    pub fn set_is_stream(&self, is_stream: bool) {
        self.is_stream.store(is_stream, Ordering::Release);
    }

    pub fn req(&self) -> HttpRequest {
        self.req.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_req(&self, req: HttpRequest) {
        *self.req.lock().unwrap_or_else(|e| e.into_inner()) = req;
    }

    pub fn output_num(&self) -> usize {
        self.output_num.load(Ordering::Acquire)
    }

    pub fn add_output_num(&self, n: usize) {
        self.output_num.fetch_add(n, Ordering::AcqRel);
    }

    pub fn clear_output_num(&self) {
        self.output_num.store(0, Ordering::Release);
    }

    pub fn retry(&self) -> usize {
        self.retry.load(Ordering::Acquire)
    }

    pub fn add_retry(&self) {
        self.retry.fetch_add(1, Ordering::AcqRel);
    }

    pub fn clear_retry(&self) {
        self.retry.store(0, Ordering::Release);
    }

    pub fn route(&self) -> [u64; 2] {
        *self.route.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_route(&self, route: [u64; 2]) {
        *self.route.lock().unwrap_or_else(|e| e.into_inner()) = route;
    }

    /// `[prefill_ip, prefill_port, decode_ip, decode_port]`.
    pub fn route_ip(&self) -> [String; 4] {
        self.route_ip.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_route_ip(&self, route_ip: [String; 4]) {
        *self.route_ip.lock().unwrap_or_else(|e| e.into_inner()) = route_ip;
    }

    pub fn model_name(&self) -> String {
        self.model_name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_model_name(&self, model_name: &str) {
        *self.model_name.lock().unwrap_or_else(|e| e.into_inner()) = model_name.to_string();
    }

    pub fn client_conn(&self) -> Option<Arc<ClientConnection>> {
        self.client_conn.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_client_conn(&self, conn: Option<Arc<ClientConnection>>) {
        *self.client_conn.lock().unwrap_or_else(|e| e.into_inner()) = conn;
    }

    /// Appends a timestamp to the state log; states repeat freely.
    pub fn record_state(&self, state: ReqState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(state)
            .or_default()
            .push(Instant::now());
    }

    pub fn has_state(&self, state: ReqState) -> bool {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&state)
    }

    pub fn has_any_state(&self, states: &[ReqState]) -> bool {
        let log = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.iter().any(|state| log.contains_key(state))
    }

    pub fn first_state_time(&self, state: ReqState) -> Option<Instant> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&state)
            .and_then(|times| times.first().copied())
    }

    pub fn state_times(&self, state: ReqState) -> Vec<Instant> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&state)
            .cloned()
            .unwrap_or_default()
    }

    /// True once the request reached a terminal or timed-out state.
    pub fn is_ended(&self) -> bool {
        self.has_any_state(&[ReqState::Finish, ReqState::Exception, ReqState::Timeout])
    }

    /// Sends the prefill first token and drains any decode tokens that were
    /// waiting on it, in arrival order. Returns true when a drained token was
    /// terminal.
    pub fn repeat_p_stream_token(&self, res: ServerRes) -> bool {
        let mut queue = self.pd_sync.lock().unwrap_or_else(|e| e.into_inner());
        self.reply.send(res);
        self.add_output_num(1);
        while let Some(waiting) = queue.pop_front() {
            let finished = waiting.is_finish;
            self.add_output_num(1);
            self.reply.send(waiting);
            if finished {
                return true;
            }
        }
        false
    }

    /// Forwards a decode token, or parks it while the first token is still
    /// outstanding. Returns true when the token was terminal and delivered.
    pub fn repeat_d_stream_token(&self, res: ServerRes) -> bool {
        {
            let mut queue = self.pd_sync.lock().unwrap_or_else(|e| e.into_inner());
            if !self.has_state(ReqState::FirstTokenFinish) {
                queue.push_back(res);
                return false;
            }
        }
        let finished = res.is_finish;
        self.reply.send(res);
        self.add_output_num(1);
        finished
    }
}

impl std::fmt::Debug for ReqAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqAgent")
            .field("req_id", &self.req_id)
            .field("kind", &self.kind)
            .field("is_stream", &self.is_stream())
            .field("route", &self.route())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use http_body_util::BodyExt;

    use super::*;
    use crate::reply::ReplyReceiver;

    fn agent_with_receiver() -> (Arc<ReqAgent>, ReplyReceiver) {
        let (reply, receiver) = ServerReply::channel();
        let agent = Arc::new(ReqAgent::new(
            "req-1",
            ReqKind::Tgi,
            reply,
            HttpRequest::post("/generate_stream", b"{}".to_vec()),
        ));
        (agent, receiver)
    }

    #[tokio::test]
    async fn test_early_decode_tokens_wait_for_first_token() {
        let (agent, receiver) = agent_with_receiver();

        // Decode tokens land before the prefill first token.
        assert!(!agent.repeat_d_stream_token(ServerRes::chunk("text/event-stream", b"d1".to_vec())));
        assert!(!agent.repeat_d_stream_token(ServerRes::chunk("text/event-stream", b"d2".to_vec())));

        agent.record_state(ReqState::FirstTokenFinish);
        let finished =
            agent.repeat_p_stream_token(ServerRes::chunk("text/event-stream", b"p".to_vec()));
        assert!(!finished);
        assert!(
            agent.repeat_d_stream_token(ServerRes::last_chunk("text/event-stream", b"d3".to_vec()))
        );

        let response = receiver.into_response(|| {}).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pd1d2d3");
        assert_eq!(agent.output_num(), 4);
    }

    #[tokio::test]
    async fn test_terminal_waiting_token_finishes_during_flush() {
        let (agent, receiver) = agent_with_receiver();
        assert!(!agent
            .repeat_d_stream_token(ServerRes::last_chunk("text/event-stream", b"end".to_vec())));
        agent.record_state(ReqState::FirstTokenFinish);
        assert!(
            agent.repeat_p_stream_token(ServerRes::chunk("text/event-stream", b"p".to_vec()))
        );

        let response = receiver.into_response(|| {}).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pend");
    }

    #[test]
    fn test_state_log_repeats_and_queries() {
        let (agent, _receiver) = agent_with_receiver();
        assert!(!agent.is_ended());
        agent.record_state(ReqState::RecvTokensFromIns);
        agent.record_state(ReqState::RecvTokensFromIns);
        assert_eq!(agent.state_times(ReqState::RecvTokensFromIns).len(), 2);
        agent.record_state(ReqState::Exception);
        assert!(agent.is_ended());
    }
}
