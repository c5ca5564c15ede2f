//! End-to-end PD pipeline tests: a real coordinator server in front of stub
//! prefill and decode workers, driven over HTTP.

use std::sync::Arc;
use std::time::Duration;

use infermesh_cluster::ClusterNodes;
use infermesh_commons::models::cluster_wire::InstanceRole;
use infermesh_commons::utils::config::{
    CoordinatorConfig,
    DeployMode,
};
use infermesh_coordinator::exception::ExceptionMonitor;
use infermesh_coordinator::manager::ReqManager;
use infermesh_coordinator::metrics::MetricsListener;
use infermesh_coordinator::repeater::{
    Repeater,
    RepeaterRouteSink,
};
use infermesh_coordinator::router::Router;
use infermesh_coordinator::scheduler::{
    LeastTaskScheduler,
    Scheduler,
};
use infermesh_coordinator::server;
use infermesh_coordinator::sync::SyncContext;
use infermesh_transport::{
    ConnectionPool,
    PoolConfig,
};
use tokio::io::{
    AsyncReadExt,
    AsyncWriteExt,
};
use tokio::net::TcpListener;
use tokio::sync::{
    mpsc,
    Notify,
};
use tokio::time::timeout;

const P_ID: u64 = 16781740;
const D_ID: u64 = 50336172;

struct TestCluster {
    base_url: String,
    manager: Arc<ReqManager>,
    cluster: Arc<ClusterNodes>,
    /// Request ids observed by the prefill stub.
    p_req_ids: mpsc::UnboundedReceiver<String>,
    /// Fires the prefill stub's pending response.
    p_release: Arc<Notify>,
    /// Packets pushed here are framed into the decode long poll.
    d_packets: mpsc::UnboundedSender<Vec<u8>>,
}

fn extract_header(request: &str, name: &str) -> Option<String> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Prefill stub: answers each forwarded request with a first-token body
/// once released (immediate release keeps the happy path simple).
async fn start_p_stub(
    req_id_tx: mpsc::UnboundedSender<String>, release: Arc<Notify>, wait_for_release: bool,
) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let req_id_tx = req_id_tx.clone();
            let release = release.clone();
            tokio::spawn(async move {
                loop {
                    let mut buf = vec![0u8; 16384];
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let req_id = extract_header(&request, "req-id").unwrap_or_default();
                    req_id_tx.send(req_id.clone()).ok();
                    if wait_for_release {
                        release.notified().await;
                    }
                    let body = format!(
                        "{{\"reqId\":\"{req_id}\",\"output\":\"first-token\",\"isLastResp\":false}}"
                    );
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    socket.write_all(reply.as_bytes()).await.ok();
                    socket.flush().await.ok();
                }
            });
        }
    });
    port
}

/// Decode stub: serves the `/dresult` long poll, writing every queued
/// packet sequence as one chunk.
async fn start_d_stub(mut packets: mpsc::UnboundedReceiver<Vec<u8>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .ok();
        socket.flush().await.ok();
        while let Some(packet) = packets.recv().await {
            let chunk = format!("{:x}\r\n", packet.len());
            socket.write_all(chunk.as_bytes()).await.ok();
            socket.write_all(&packet).await.ok();
            socket.write_all(b"\r\n").await.ok();
            socket.flush().await.ok();
        }
    });
    port
}

async fn start_test_cluster(p_waits_for_release: bool) -> TestCluster {
    let (p_req_tx, p_req_rx) = mpsc::unbounded_channel();
    let p_release = Arc::new(Notify::new());
    let p_port = start_p_stub(p_req_tx, p_release.clone(), p_waits_for_release).await;
    let (d_tx, d_rx) = mpsc::unbounded_channel();
    let d_port = start_d_stub(d_rx).await;

    let cfg = Arc::new(CoordinatorConfig {
        deploy_mode: DeployMode::PdSeparate,
        max_retry: 1,
        ..CoordinatorConfig::default()
    });
    let cluster = Arc::new(ClusterNodes::new(DeployMode::PdSeparate));
    cluster.add_instance(P_ID, "127.0.0.1", &p_port.to_string(), InstanceRole::Prefill, "llm");
    cluster.add_instance(D_ID, "127.0.0.1", &d_port.to_string(), InstanceRole::Decode, "llm");

    let scheduler: Arc<dyn Scheduler> =
        Arc::new(LeastTaskScheduler::new(cluster.clone(), DeployMode::PdSeparate));
    let manager = Arc::new(ReqManager::new(cfg.clone(), cluster.clone(), scheduler.clone()));
    let exception = Arc::new(ExceptionMonitor::new());
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), None));
    let repeater = Repeater::new(
        cfg.clone(),
        cluster.clone(),
        manager.clone(),
        scheduler.clone(),
        exception.clone(),
        pool,
    );
    scheduler.set_route_sink(Arc::new(RepeaterRouteSink(repeater.clone())));
    repeater.register_exception_handlers();
    exception.start();

    assert!(repeater.link_with_d_node("127.0.0.1", &d_port.to_string()).await);

    let metrics = Arc::new(MetricsListener::new(
        cluster.clone(),
        manager.clone(),
        Duration::from_secs(1),
    ));
    let sync = Arc::new(SyncContext::new(
        cfg.clone(),
        cluster.clone(),
        scheduler.clone(),
        repeater.clone(),
    ));
    let router = Arc::new(Router::new(
        cfg, cluster.clone(), manager.clone(), scheduler, repeater, exception, metrics, sync,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(router, listener, Arc::new(Notify::new())));

    TestCluster {
        base_url: format!("http://{addr}"),
        manager,
        cluster,
        p_req_ids: p_req_rx,
        p_release,
        d_packets: d_tx,
    }
}

fn packet(req_id: &str, key: &str, payload: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(format!("reqId:{req_id}\0").as_bytes());
    bytes.extend_from_slice(format!("{key}:{payload}\0").as_bytes());
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pd_streaming_happy_path() {
    let mut env = start_test_cluster(false).await;

    let client = reqwest::Client::new();
    let request = client
        .post(format!("{}/generate_stream", env.base_url))
        .json(&serde_json::json!({"inputs": "hello", "stream": true}))
        .send();
    let response_task = tokio::spawn(request);

    let req_id = timeout(Duration::from_secs(5), env.p_req_ids.recv())
        .await
        .expect("prefill stub never saw the request")
        .unwrap();

    // Let the first token reach the client before decode tokens flow.
    tokio::time::sleep(Duration::from_millis(300)).await;
    env.d_packets.send(packet(&req_id, "data", "foo")).unwrap();
    env.d_packets.send(packet(&req_id, "data", "bar")).unwrap();
    env.d_packets
        .send(packet(&req_id, "lastData", "end"))
        .unwrap();

    let response = timeout(Duration::from_secs(5), response_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .map(|ct| ct.to_str().unwrap_or("").contains("text/event-stream"))
        .unwrap_or(false));
    let body = response.text().await.unwrap();
    assert_eq!(body, "first-tokenfoobarend");

    // Task accounting drained on both instances; the request finished.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(env
        .manager
        .get(&req_id)
        .map(|agent| agent.has_state(infermesh_coordinator::agent::ReqState::Finish))
        .unwrap_or(true));
    assert_eq!(env.cluster.task_count(P_ID), Some(0));
    assert_eq!(env.cluster.task_count(D_ID), Some(0));
    assert_eq!(env.manager.stats().success, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_decode_token_waits_for_first_token() {
    let mut env = start_test_cluster(true).await;

    let client = reqwest::Client::new();
    let request = client
        .post(format!("{}/generate_stream", env.base_url))
        .json(&serde_json::json!({"inputs": "hello", "stream": true}))
        .send();
    let response_task = tokio::spawn(request);

    let req_id = timeout(Duration::from_secs(5), env.p_req_ids.recv())
        .await
        .expect("prefill stub never saw the request")
        .unwrap();

    // Decode token lands while the prefill response is still pending.
    env.d_packets.send(packet(&req_id, "data", "early")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    env.p_release.notify_one();
    tokio::time::sleep(Duration::from_millis(300)).await;
    env.d_packets
        .send(packet(&req_id, "lastData", "end"))
        .unwrap();

    let response = timeout(Duration::from_secs(5), response_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let body = response.text().await.unwrap();
    // The early decode token is never delivered ahead of the first token.
    assert_eq!(body, "first-tokenearlyend");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_not_ready_and_invalid_body_rejections() {
    // No instances at all: the coordinator is not ready.
    let cfg = Arc::new(CoordinatorConfig {
        deploy_mode: DeployMode::PdSeparate,
        ..CoordinatorConfig::default()
    });
    let cluster = Arc::new(ClusterNodes::new(DeployMode::PdSeparate));
    let scheduler: Arc<dyn Scheduler> =
        Arc::new(LeastTaskScheduler::new(cluster.clone(), DeployMode::PdSeparate));
    let manager = Arc::new(ReqManager::new(cfg.clone(), cluster.clone(), scheduler.clone()));
    let exception = Arc::new(ExceptionMonitor::new());
    let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), None));
    let repeater = Repeater::new(
        cfg.clone(),
        cluster.clone(),
        manager.clone(),
        scheduler.clone(),
        exception.clone(),
        pool,
    );
    let metrics = Arc::new(MetricsListener::new(
        cluster.clone(),
        manager.clone(),
        Duration::from_secs(1),
    ));
    let sync = Arc::new(SyncContext::new(
        cfg.clone(),
        cluster.clone(),
        scheduler.clone(),
        repeater.clone(),
    ));
    let router = Arc::new(Router::new(
        cfg, cluster.clone(), manager, scheduler, repeater, exception, metrics, sync,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(router, listener, Arc::new(Notify::new())));

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/generate"))
        .json(&serde_json::json!({"inputs": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "MindIE-MS Coordinator is not ready\r\n");

    // With a serving cluster, a malformed body is a 400.
    cluster.add_instance(1, "127.0.0.1", "1", InstanceRole::Prefill, "llm");
    cluster.add_instance(2, "127.0.0.2", "1", InstanceRole::Decode, "llm");
    let response = client
        .post(format!("http://{addr}/generate"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "Request format is invalid\r\n");
}
