//! Single serialized dispatcher for abnormal events. Three FIFO queues
//! (instance, request, user) are drained by one worker task; a handler runs
//! to completion before the next event is taken, so side effects stay
//! ordered per queue.

use std::collections::{
    HashMap,
    VecDeque,
};
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsException {
    ConnPErr,
    ConnDErr,
    ConnMixErr,
    ConnTokenErr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqException {
    SendPErr,
    Retry,
    SendMixErr,
    UserDisConn,
    InferTimeout,
    FirstTokenTimeout,
    ScheduleTimeout,
    SendTokenErr,
    TokenizerTimeout,
    RetryDuplicateReqId,
    DecodeDisConn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserException {
    ConnUserErr,
}

pub type InsHandler = Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ReqHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
pub type UserHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Queues {
    ins: StdMutex<VecDeque<(InsException, u64)>>,
    req: StdMutex<VecDeque<(ReqException, String)>>,
    user: StdMutex<VecDeque<(UserException, String)>>,
}

pub struct ExceptionMonitor {
    running: AtomicBool,
    notify: Notify,
    queues: Queues,
    ins_handlers: StdMutex<HashMap<InsException, InsHandler>>,
    req_handlers: StdMutex<HashMap<ReqException, ReqHandler>>,
    user_handlers: StdMutex<HashMap<UserException, UserHandler>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl ExceptionMonitor {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            notify: Notify::new(),
            queues: Queues::default(),
            ins_handlers: StdMutex::new(HashMap::new()),
            req_handlers: StdMutex::new(HashMap::new()),
            user_handlers: StdMutex::new(HashMap::new()),
            worker: StdMutex::new(None),
        }
    }

    pub fn reg_ins_handler<F, Fut>(&self, kind: InsException, f: F)
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.ins_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, Arc::new(move |ins_id| Box::pin(f(ins_id))));
    }

    pub fn reg_req_handler<F, Fut>(&self, kind: ReqException, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.req_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, Arc::new(move |req_id| Box::pin(f(req_id))));
    }

    pub fn reg_user_handler<F, Fut>(&self, kind: UserException, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.user_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, Arc::new(move |req_id| Box::pin(f(req_id))));
    }

    pub fn push_ins(&self, kind: InsException, ins_id: u64) {
        info!(?kind, ins_id, "instance exception queued");
        self.queues
            .ins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((kind, ins_id));
        self.notify.notify_one();
    }

    pub fn push_req(&self, kind: ReqException, req_id: &str) {
        info!(?kind, req_id, "request exception queued");
        self.queues
            .req
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((kind, req_id.to_string()));
        self.notify.notify_one();
    }

    pub fn push_user(&self, kind: UserException, req_id: &str) {
        info!(?kind, req_id, "user exception queued");
        self.queues
            .user
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((kind, req_id.to_string()));
        self.notify.notify_one();
    }

    fn has_pending(&self) -> bool {
        !self.queues.ins.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
            || !self.queues.req.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
            || !self.queues.user.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                loop {
                    let notified = monitor.notify.notified();
                    if !monitor.running.load(Ordering::Acquire) {
                        return;
                    }
                    if monitor.has_pending() {
                        break;
                    }
                    notified.await;
                }
                while monitor.running.load(Ordering::Acquire) && monitor.has_pending() {
                    monitor.execute_round().await;
                }
            }
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Drains the in-flight handlers, then parks the worker.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_waiters();
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One event from each queue; request events first.
    async fn execute_round(&self) {
        let req_event = self
            .queues
            .req
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some((kind, req_id)) = req_event {
            let handler = self
                .req_handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&kind)
                .cloned();
            if let Some(handler) = handler {
                info!(?kind, req_id, "executing request exception handler");
                handler(req_id).await;
            }
        }

        let ins_event = self
            .queues
            .ins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some((kind, ins_id)) = ins_event {
            let handler = self
                .ins_handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&kind)
                .cloned();
            if let Some(handler) = handler {
                info!(?kind, ins_id, "executing instance exception handler");
                handler(ins_id).await;
            }
        }

        let user_event = self
            .queues
            .user
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some((kind, req_id)) = user_event {
            let handler = self
                .user_handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&kind)
                .cloned();
            if let Some(handler) = handler {
                info!(?kind, req_id, "executing user exception handler");
                handler(req_id).await;
            }
        }
    }
}

impl Default for ExceptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_events_dispatch_fifo() {
        let monitor = Arc::new(ExceptionMonitor::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.reg_req_handler(ReqException::Retry, move |req_id| {
            let tx = tx.clone();
            async move {
                tx.send(req_id).ok();
            }
        });
        monitor.start();

        for i in 0..5 {
            monitor.push_req(ReqException::Retry, &format!("req-{i}"));
        }
        for i in 0..5 {
            let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
            assert_eq!(got.unwrap(), format!("req-{i}"));
        }
        monitor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handlers_run_serialized() {
        let monitor = Arc::new(ExceptionMonitor::new());
        let active = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let active = active.clone();
            monitor.reg_ins_handler(InsException::ConnPErr, move |ins_id| {
                let active = active.clone();
                let tx = tx.clone();
                async move {
                    assert!(!active.swap(true, Ordering::SeqCst), "handler overlapped");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.store(false, Ordering::SeqCst);
                    tx.send(ins_id).ok();
                }
            });
        }
        monitor.start();
        for ins_id in 0..4u64 {
            monitor.push_ins(InsException::ConnPErr, ins_id);
        }
        for ins_id in 0..4u64 {
            let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
            assert_eq!(got.unwrap(), ins_id);
        }
        monitor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unregistered_kind_is_dropped() {
        let monitor = Arc::new(ExceptionMonitor::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.reg_user_handler(UserException::ConnUserErr, move |req_id| {
            let tx = tx.clone();
            async move {
                tx.send(req_id).ok();
            }
        });
        monitor.start();
        // No handler registered for this request kind; must not wedge the
        // worker.
        monitor.push_req(ReqException::SendPErr, "req-ignored");
        monitor.push_user(UserException::ConnUserErr, "req-user");
        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got.unwrap(), "req-user");
        monitor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_joins_worker() {
        let monitor = Arc::new(ExceptionMonitor::new());
        monitor.start();
        timeout(Duration::from_secs(2), monitor.stop())
            .await
            .expect("stop should join promptly");
    }
}
