use std::collections::HashMap;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::Duration;

use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use tokio::io::{
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
    ReadHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::either::Either;
use tracing::{
    debug,
    warn,
};

use crate::error::TransportError;
use crate::tls::TlsClientConfig;

/// Hard cap on response head size.
const MAX_HEADER_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const READ_BUF_SIZE: usize = 16 * 1024;
/// Cap on the reassembled chunked body; long-poll streams exceed it and
/// only ever read per-chunk payloads.
const MAX_CHUNK_BODY_ACCUM: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Request write completed.
    Req,
    /// Request write failed.
    ReqError,
    /// Complete non-streaming response arrived.
    Res,
    /// Reading the response head or body failed.
    HeaderResError,
    /// One chunk of a streaming response arrived.
    ChunkBodyRes,
    /// Reading the streaming body failed.
    ChunkBodyResError,
}

type Callback = Arc<dyn Fn(Arc<ClientConnection>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback set bound to a connection; rebinding swaps the whole table.
#[derive(Clone, Default)]
pub struct ClientHandler {
    callbacks: HashMap<HandlerKind, Callback>,
}

impl ClientHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, kind: HandlerKind, f: F)
    where
        F: Fn(Arc<ClientConnection>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.callbacks
            .insert(kind, Arc::new(move |conn| Box::pin(f(conn))));
    }

    fn get(&self, kind: HandlerKind) -> Option<Callback> {
        self.callbacks.get(&kind).cloned()
    }
}

impl std::fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandler")
            .field("kinds", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outgoing request template. Headers set here are written verbatim;
/// `Host`, `Content-Length` and `Connection` are filled at serialization.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn get(target: &str) -> Self {
        Self {
            method: "GET".to_string(),
            target: target.to_string(),
            ..Self::default()
        }
    }

    pub fn post(target: &str, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            target: target.to_string(),
            body,
            ..Self::default()
        }
    }

    /// Sets or replaces a header, case-insensitively.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
            return;
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn serialize(&self, host: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, self.target, host).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() || self.method == "POST" {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Debug, Default)]
struct ResponseState {
    status: u16,
    body: Vec<u8>,
    chunk: Vec<u8>,
}

type IoStream = Either<TcpStream, tokio_rustls::client::TlsStream<TcpStream>>;

#[derive(Clone, Copy)]
enum Phase {
    Head,
    Body { remaining: usize },
    Chunked,
}

enum ChunkStep {
    NeedMore,
    Data { payload: Vec<u8>, consumed: usize },
    End { consumed: usize },
    Invalid,
}

/// One pooled client connection. The reader task drives response parsing and
/// dispatches the bound callbacks sequentially, so handler bodies never race
/// against themselves on the same connection.
pub struct ClientConnection {
    id: u32,
    ip: String,
    port: String,
    available: AtomicBool,
    closed: AtomicBool,
    req_id: StdMutex<String>,
    handler: StdMutex<ClientHandler>,
    response: StdMutex<ResponseState>,
    writer: TokioMutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ClientConnection {
    pub(crate) async fn connect(
        id: u32, ip: &str, port: &str, handler: ClientHandler, tls: Option<TlsClientConfig>,
        connect_timeout: Duration, idle_timeout: Duration,
    ) -> Result<Arc<Self>, TransportError> {
        let addr = format!("{ip}:{port}");
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(addr.clone()))?
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true).ok();

        let io: IoStream = match tls {
            None => Either::Left(stream),
            Some(config) => {
                let server_name = ServerName::try_from(ip.to_string())
                    .map_err(|_| TransportError::InvalidAddress(addr.clone()))?;
                let connected = TlsConnector::from(config)
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Either::Right(connected)
            }
        };
        let (read_half, write_half) = tokio::io::split(io);

        let conn = Arc::new(Self {
            id,
            ip: ip.to_string(),
            port: port.to_string(),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            req_id: StdMutex::new(String::new()),
            handler: StdMutex::new(handler),
            response: StdMutex::new(ResponseState::default()),
            writer: TokioMutex::new(Box::new(write_half)),
        });
        tokio::spawn(Self::read_loop(conn.clone(), read_half, idle_timeout));
        debug!(id, %addr, "client connection established");
        Ok(conn)
    }

    pub fn connection_id(&self) -> u32 {
        self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_handler(&self, handler: ClientHandler) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    pub fn req_id(&self) -> String {
        self.req_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_req_id(&self, req_id: &str) {
        *self.req_id.lock().unwrap_or_else(|e| e.into_inner()) = req_id.to_string();
    }

    pub fn res_status(&self) -> u16 {
        self.response.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn res_body(&self) -> Vec<u8> {
        self.response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .body
            .clone()
    }

    /// Payload of the most recent streaming chunk.
    pub fn res_chunk_body(&self) -> Vec<u8> {
        self.response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chunk
            .clone()
    }

    /// Writes the serialized request; fires `Req` or `ReqError`.
    pub async fn send_req(self: &Arc<Self>, req: &HttpRequest, req_id: Option<&str>) {
        if let Some(id) = req_id {
            self.set_req_id(id);
        }
        let bytes = req.serialize(&self.address());
        let result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(()) => self.fire(HandlerKind::Req).await,
            Err(e) => {
                warn!(id = self.id, addr = %self.address(), error = %e, "request write failed");
                self.closed.store(true, Ordering::Release);
                self.fire(HandlerKind::ReqError).await;
            }
        }
    }

    /// Tears the connection down; the reader task stops on the closed flag.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Marks the connection unusable for future pool scans and closes it.
    pub async fn grace_close(&self) {
        self.set_available(false);
        self.close().await;
    }

    async fn fire(self: &Arc<Self>, kind: HandlerKind) {
        let callback = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind);
        if let Some(callback) = callback {
            callback(self.clone()).await;
        }
    }

    async fn read_loop(conn: Arc<Self>, mut reader: ReadHalf<IoStream>, idle_timeout: Duration) {
        let mut acc: Vec<u8> = Vec::new();
        let mut tmp = [0u8; READ_BUF_SIZE];
        let mut phase = Phase::Head;
        loop {
            if conn.is_closed() {
                return;
            }
            let read = if idle_timeout > Duration::ZERO {
                match timeout(idle_timeout, reader.read(&mut tmp)).await {
                    Ok(inner) => inner,
                    Err(_) => {
                        debug!(id = conn.id, addr = %conn.address(), "idle timeout, closing");
                        conn.close().await;
                        return;
                    }
                }
            } else {
                reader.read(&mut tmp).await
            };
            match read {
                Ok(0) | Err(_) => {
                    if conn.is_closed() {
                        return;
                    }
                    conn.closed.store(true, Ordering::Release);
                    match phase {
                        Phase::Chunked => conn.fire(HandlerKind::ChunkBodyResError).await,
                        _ => {
                            // Peer closed an idle pooled connection; only an
                            // in-flight request sees this as an error.
                            if !conn.is_available() {
                                conn.fire(HandlerKind::HeaderResError).await;
                            }
                        }
                    }
                    return;
                }
                Ok(n) => acc.extend_from_slice(&tmp[..n]),
            }

            loop {
                match phase {
                    Phase::Head => {
                        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                        let mut res = httparse::Response::new(&mut headers);
                        match res.parse(&acc) {
                            Ok(httparse::Status::Complete(head_len)) => {
                                let status = res.code.unwrap_or(0);
                                let mut chunked = false;
                                let mut content_length = 0usize;
                                for header in res.headers.iter() {
                                    if header.name.eq_ignore_ascii_case("transfer-encoding")
                                        && header.value.eq_ignore_ascii_case(b"chunked")
                                    {
                                        chunked = true;
                                    }
                                    if header.name.eq_ignore_ascii_case("content-length") {
                                        content_length = std::str::from_utf8(header.value)
                                            .ok()
                                            .and_then(|v| v.trim().parse().ok())
                                            .unwrap_or(0);
                                    }
                                }
                                {
                                    let mut state = conn
                                        .response
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner());
                                    state.status = status;
                                    state.body.clear();
                                    state.chunk.clear();
                                }
                                acc.drain(..head_len);
                                if chunked {
                                    phase = Phase::Chunked;
                                } else if content_length > 0 {
                                    phase = Phase::Body {
                                        remaining: content_length,
                                    };
                                } else {
                                    conn.fire(HandlerKind::Res).await;
                                }
                            }
                            Ok(httparse::Status::Partial) => {
                                if acc.len() > MAX_HEADER_BYTES {
                                    warn!(id = conn.id, "response head exceeds limit");
                                    conn.closed.store(true, Ordering::Release);
                                    conn.fire(HandlerKind::HeaderResError).await;
                                    return;
                                }
                                break;
                            }
                            Err(e) => {
                                warn!(id = conn.id, error = %e, "response head parse failed");
                                conn.closed.store(true, Ordering::Release);
                                conn.fire(HandlerKind::HeaderResError).await;
                                return;
                            }
                        }
                    }
                    Phase::Body { remaining } => {
                        if acc.len() < remaining {
                            break;
                        }
                        let body: Vec<u8> = acc.drain(..remaining).collect();
                        conn.response
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .body = body;
                        phase = Phase::Head;
                        conn.fire(HandlerKind::Res).await;
                    }
                    Phase::Chunked => match next_chunk(&acc) {
                        ChunkStep::NeedMore => break,
                        ChunkStep::Data { payload, consumed } => {
                            acc.drain(..consumed);
                            {
                                let mut state =
                                    conn.response.lock().unwrap_or_else(|e| e.into_inner());
                                if state.body.len() + payload.len() <= MAX_CHUNK_BODY_ACCUM {
                                    state.body.extend_from_slice(&payload);
                                }
                                state.chunk = payload;
                            }
                            conn.fire(HandlerKind::ChunkBodyRes).await;
                        }
                        ChunkStep::End { consumed } => {
                            acc.drain(..consumed);
                            phase = Phase::Head;
                            // End of a chunked answer doubles as the
                            // complete-response signal.
                            conn.fire(HandlerKind::Res).await;
                        }
                        ChunkStep::Invalid => {
                            warn!(id = conn.id, "chunked body parse failed");
                            conn.closed.store(true, Ordering::Release);
                            conn.fire(HandlerKind::ChunkBodyResError).await;
                            return;
                        }
                    },
                }
            }
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("addr", &self.address())
            .field("available", &self.is_available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn next_chunk(acc: &[u8]) -> ChunkStep {
    let Some(line_end) = acc.windows(2).position(|w| w == b"\r\n") else {
        if acc.len() > MAX_HEADER_BYTES {
            return ChunkStep::Invalid;
        }
        return ChunkStep::NeedMore;
    };
    let size_text = match std::str::from_utf8(&acc[..line_end]) {
        Ok(text) => text.trim(),
        Err(_) => return ChunkStep::Invalid,
    };
    let size_part = size_text.split(';').next().unwrap_or(size_text);
    let Ok(size) = usize::from_str_radix(size_part, 16) else {
        return ChunkStep::Invalid;
    };
    let data_start = line_end + 2;
    if size == 0 {
        // Trailer-less terminator: 0 CRLF CRLF.
        if acc.len() < data_start + 2 {
            return ChunkStep::NeedMore;
        }
        return ChunkStep::End {
            consumed: data_start + 2,
        };
    }
    if acc.len() < data_start + size + 2 {
        return ChunkStep::NeedMore;
    }
    ChunkStep::Data {
        payload: acc[data_start..data_start + size].to_vec(),
        consumed: data_start + size + 2,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{
        AsyncReadExt,
        AsyncWriteExt,
    };
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;

    async fn start_stub<F>(respond: F) -> u16
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 16384];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let reply = respond(buf[..n].to_vec());
                socket.write_all(&reply).await.ok();
                socket.flush().await.ok();
                // Keep the socket open so keep-alive reuse works.
                let mut sink = vec![0u8; 1024];
                let _ = socket.read(&mut sink).await;
            }
        });
        port
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_response_fires_res() {
        let port = start_stub(|_| {
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec()
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handler = ClientHandler::new();
        handler.register(HandlerKind::Res, move |conn: Arc<ClientConnection>| {
            let tx = tx.clone();
            async move {
                tx.send((conn.res_status(), conn.res_body())).ok();
            }
        });

        let conn = ClientConnection::connect(
            1,
            "127.0.0.1",
            &port.to_string(),
            handler,
            None,
            Duration::from_secs(2),
            Duration::ZERO,
        )
        .await
        .unwrap();
        conn.send_req(&HttpRequest::post("/infer", b"{}".to_vec()), Some("req-1"))
            .await;

        let (status, body) = rx.recv().await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"hello");
        assert_eq!(conn.req_id(), "req-1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chunked_response_fires_per_chunk() {
        let port = start_stub(|_| {
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              3\r\nfoo\r\n4\r\nbarz\r\n0\r\n\r\n"
                .to_vec()
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handler = ClientHandler::new();
        handler.register(HandlerKind::ChunkBodyRes, move |conn: Arc<ClientConnection>| {
            let tx = tx.clone();
            async move {
                tx.send(conn.res_chunk_body()).ok();
            }
        });

        let conn = ClientConnection::connect(
            2,
            "127.0.0.1",
            &port.to_string(),
            handler,
            None,
            Duration::from_secs(2),
            Duration::ZERO,
        )
        .await
        .unwrap();
        conn.send_req(&HttpRequest::get("/dresult"), None).await;

        assert_eq!(rx.recv().await.unwrap(), b"foo");
        assert_eq!(rx.recv().await.unwrap(), b"barz");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_failure_is_error() {
        let result = ClientConnection::connect(
            3,
            "127.0.0.1",
            "1",
            ClientHandler::new(),
            None,
            Duration::from_millis(500),
            Duration::ZERO,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_request_serialization() {
        let mut req = HttpRequest::post("/v1/chat/completions", b"{\"x\":1}".to_vec());
        req.set_header("content-type", "application/json");
        req.set_header("req-id", "abc");
        req.set_header("req-id", "def");
        let text = String::from_utf8(req.serialize("10.0.0.1:1025")).unwrap();
        assert!(text.starts_with("POST /v1/chat/completions HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.1:1025\r\n"));
        assert!(text.contains("req-id: def\r\n"));
        assert!(!text.contains("req-id: abc"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("{\"x\":1}"));
    }
}
