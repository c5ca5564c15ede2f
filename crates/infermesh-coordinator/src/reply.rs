//! Channel-backed reply handle for one client request. The handler that owns
//! the hyper request converts the receiving side into the response; the first
//! event fixes status and content type, later events become body frames. A
//! drop guard on the body stream reports user disconnects for requests that
//! never reached a final event.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::task::{
    Context,
    Poll,
};

use bytes::Bytes;
use futures::Stream;
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{
    BodyExt,
    Full,
    StreamBody,
};
use hyper::body::Frame;
use tokio::sync::mpsc;

pub type ReplyBody = BoxBody<Bytes, Infallible>;

/// One unit sent back to the client: a full response or a stream chunk.
#[derive(Debug, Clone)]
pub struct ServerRes {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
    pub is_finish: bool,
}

impl ServerRes {
    /// Complete single-shot response.
    pub fn full(status: StatusCode, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            body,
            is_finish: true,
        }
    }

    /// Intermediate stream chunk; keeps the response open.
    pub fn chunk(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: content_type.to_string(),
            body,
            is_finish: false,
        }
    }

    /// Terminal stream chunk.
    pub fn last_chunk(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: content_type.to_string(),
            body,
            is_finish: true,
        }
    }
}

/// Sending side owned by the request agent.
pub struct ServerReply {
    tx: mpsc::UnboundedSender<ServerRes>,
    finished: Arc<AtomicBool>,
    req_id: StdMutex<String>,
}

impl ServerReply {
    pub fn channel() -> (Arc<ServerReply>, ReplyReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let reply = Arc::new(ServerReply {
            tx,
            finished: finished.clone(),
            req_id: StdMutex::new(String::new()),
        });
        (reply, ReplyReceiver { rx, finished })
    }

    pub fn send(&self, res: ServerRes) {
        if res.is_finish {
            self.finished.store(true, Ordering::Release);
        }
        let _ = self.tx.send(res);
    }

    /// Plain-text one-line failure, terminated the way workers expect.
    pub fn send_error(&self, status: StatusCode, text: &str) {
        self.send(ServerRes::full(status, "text/plain", text.as_bytes().to_vec()));
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_req_id(&self, req_id: &str) {
        *self.req_id.lock().unwrap_or_else(|e| e.into_inner()) = req_id.to_string();
    }

    pub fn req_id(&self) -> String {
        self.req_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for ServerReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerReply")
            .field("req_id", &self.req_id())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Receiving side; consumed by the HTTP handler.
pub struct ReplyReceiver {
    rx: mpsc::UnboundedReceiver<ServerRes>,
    finished: Arc<AtomicBool>,
}

impl ReplyReceiver {
    /// Waits for the first reply event and builds the response around it.
    /// `on_disconnect` runs if the client goes away before a final event.
    pub async fn into_response<F>(mut self, on_disconnect: F) -> http::Response<ReplyBody>
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let Some(first) = self.rx.recv().await else {
            // Sender dropped without responding; the reaper path closed us.
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new());
        };
        let builder = http::Response::builder()
            .status(first.status)
            .header(http::header::CONTENT_TYPE, first.content_type.as_str());
        if first.is_finish {
            let body = Full::new(Bytes::from(first.body)).boxed();
            return builder.body(body).unwrap_or_else(|_| {
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
            });
        }
        let stream = ReplyStream {
            rx: self.rx,
            first: Some(Bytes::from(first.body)),
            done: false,
            guard: DisconnectGuard {
                finished: self.finished,
                hook: Some(Box::new(on_disconnect)),
            },
        };
        let body = StreamBody::new(stream).boxed();
        builder
            .body(body)
            .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()))
    }
}

fn plain_response(status: StatusCode, body: Bytes) -> http::Response<ReplyBody> {
    let mut response = http::Response::new(Full::new(body).boxed());
    *response.status_mut() = status;
    response
}

struct DisconnectGuard {
    finished: Arc<AtomicBool>,
    hook: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            if let Some(hook) = self.hook.take() {
                hook();
            }
        }
    }
}

struct ReplyStream {
    rx: mpsc::UnboundedReceiver<ServerRes>,
    first: Option<Bytes>,
    done: bool,
    guard: DisconnectGuard,
}

impl Stream for ReplyStream {
    type Item = Result<Frame<Bytes>, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(first) = this.first.take() {
            return Poll::Ready(Some(Ok(Frame::data(first))));
        }
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(res)) => {
                if res.is_finish {
                    this.done = true;
                    // A clean finish disarms the disconnect hook.
                    this.guard.finished.store(true, Ordering::Release);
                }
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(res.body)))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::StreamExt;
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn test_full_response_carries_status_and_body() {
        let (reply, receiver) = ServerReply::channel();
        reply.send_error(StatusCode::TOO_MANY_REQUESTS, "Too many requests\r\n");

        let response = receiver.into_response(|| {}).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Too many requests\r\n");
        assert!(reply.is_finished());
    }

    #[tokio::test]
    async fn test_stream_response_frames_in_order() {
        let (reply, receiver) = ServerReply::channel();
        reply.send(ServerRes::chunk("text/event-stream", b"one".to_vec()));
        reply.send(ServerRes::chunk("text/event-stream", b"two".to_vec()));
        reply.send(ServerRes::last_chunk("text/event-stream", b"three".to_vec()));

        let response = receiver.into_response(|| {}).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"onetwothree");
    }

    #[tokio::test]
    async fn test_disconnect_hook_fires_for_abandoned_stream() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let (reply, receiver) = ServerReply::channel();
        reply.send(ServerRes::chunk("text/event-stream", b"one".to_vec()));

        let response = receiver
            .into_response(|| {
                HITS.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        drop(response);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_hook_skipped_after_finish() {
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let (reply, receiver) = ServerReply::channel();
        reply.send(ServerRes::chunk("text/event-stream", b"one".to_vec()));
        let response = receiver
            .into_response(|| {
                HITS.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        reply.send(ServerRes::last_chunk("text/event-stream", b"end".to_vec()));
        let mut body = response.into_body().into_data_stream();
        while body.next().await.is_some() {}
        drop(body);
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
    }
}
