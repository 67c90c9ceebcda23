//! Service loop and control socket tests

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use toyvpn_cli::daemon;
use toyvpn_cli::ipc::{IpcClient, IpcRequest, IpcResponse, IpcServer};
use toyvpn_cli::service::LinkStatus;
use toyvpn_cli::{
    ConfigError, ConfigStore, RetryPolicy, Service, ServiceError, ServiceHandle, ServiceStatus,
};
use toyvpn_proto::{AttemptId, ConnectionConfig};
use toyvpn_supervisor::{AttemptContext, HandOff, TunnelInterface, TunnelWorker, WorkerError};

/// Worker that fails a set number of times, then establishes and idles
#[derive(Clone, Default)]
struct FakeWorker {
    failures_left: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl FakeWorker {
    fn failing(times: usize) -> Self {
        let worker = Self::default();
        worker.failures_left.store(times, Ordering::SeqCst);
        worker
    }
}

struct FakeInterface {
    name: String,
    closed: Arc<AtomicUsize>,
}

impl TunnelInterface for FakeInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TunnelWorker for FakeWorker {
    async fn run(&self, ctx: AttemptContext) -> Result<(), WorkerError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(WorkerError::ConnectionFailed("connection refused".to_string()));
        }

        let interface = Box::new(FakeInterface {
            name: format!("fake{}", ctx.attempt.0),
            closed: self.closed.clone(),
        });
        if ctx.establisher.establish(interface) == HandOff::Stale {
            return Err(WorkerError::Cancelled);
        }
        ctx.cancel.cancelled().await;
        Ok(())
    }
}

fn configured_store(dir: &TempDir) -> ConfigStore {
    let store = ConfigStore::with_base_dir(dir.path());
    let config = ConnectionConfig::builder()
        .server("vpn.example.com", 8000)
        .shared_secret("test")
        .build()
        .unwrap();
    store.save(&config).unwrap();
    store
}

async fn wait_for_status<F>(handle: &ServiceHandle, mut predicate: F) -> ServiceStatus
where
    F: FnMut(&ServiceStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = handle.status().await.unwrap();
        if predicate(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out, last status: {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn fast_retries(max: Option<u32>) -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        ..RetryPolicy::enabled()
    }
    .with_max_attempts(max)
}

#[tokio::test]
async fn test_connect_without_profile() {
    let temp = TempDir::new().unwrap();
    let store = ConfigStore::with_base_dir(temp.path());
    let (handle, _task) = Service::with_worker(FakeWorker::default(), store, RetryPolicy::default())
        .unwrap()
        .spawn();

    let result = handle.connect().await;
    assert!(matches!(
        result,
        Err(ServiceError::Config(ConfigError::NotConfigured(_)))
    ));
    assert_eq!(handle.status().await.unwrap().status, LinkStatus::Idle);
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let temp = TempDir::new().unwrap();
    let worker = FakeWorker::default();
    let (handle, _task) =
        Service::with_worker(worker.clone(), configured_store(&temp), RetryPolicy::default())
            .unwrap()
            .spawn();

    assert_eq!(handle.connect().await.unwrap(), AttemptId(1));
    let status = wait_for_status(&handle, |s| {
        s.status == LinkStatus::Connected && s.connected_since.is_some()
    })
    .await;
    assert_eq!(status.tunnel, Some(AttemptId(1)));
    assert_eq!(status.interface.as_deref(), Some("fake1"));

    // Reconnecting replaces the live tunnel
    assert_eq!(handle.connect().await.unwrap(), AttemptId(2));
    wait_for_status(&handle, |s| s.tunnel == Some(AttemptId(2))).await;
    wait_until(|| worker.closed.load(Ordering::SeqCst) == 1).await;

    handle.disconnect().await.unwrap();
    wait_for_status(&handle, |s| {
        s.status == LinkStatus::Idle && s.connected_since.is_none()
    })
    .await;
    assert_eq!(worker.closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failure_without_retry_stays_idle() {
    let temp = TempDir::new().unwrap();
    let (handle, _task) = Service::with_worker(
        FakeWorker::failing(1),
        configured_store(&temp),
        RetryPolicy::default(),
    )
    .unwrap()
    .spawn();

    handle.connect().await.unwrap();
    let status = wait_for_status(&handle, |s| s.last_error.is_some()).await;
    assert_eq!(status.status, LinkStatus::Idle);
    assert!(status
        .last_error
        .unwrap()
        .contains("connection refused"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status().await.unwrap().status, LinkStatus::Idle);
}

#[tokio::test]
async fn test_retry_until_connected() {
    let temp = TempDir::new().unwrap();
    let (handle, _task) = Service::with_worker(
        FakeWorker::failing(3),
        configured_store(&temp),
        fast_retries(None),
    )
    .unwrap()
    .spawn();

    handle.connect().await.unwrap();
    let status = wait_for_status(&handle, |s| {
        s.status == LinkStatus::Connected && s.connected_since.is_some()
    })
    .await;
    // Three failed attempts, then the fourth established
    assert_eq!(status.tunnel, Some(AttemptId(4)));
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_retry_gives_up_at_cap() {
    let temp = TempDir::new().unwrap();
    let (handle, _task) = Service::with_worker(
        FakeWorker::failing(10),
        configured_store(&temp),
        fast_retries(Some(2)),
    )
    .unwrap()
    .spawn();

    handle.connect().await.unwrap();
    // One explicit attempt plus two retries
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.status, LinkStatus::Idle);
    assert!(status.last_error.is_some());

    // An explicit connect starts a fresh series
    assert_eq!(handle.connect().await.unwrap(), AttemptId(4));
}

#[tokio::test]
async fn test_disconnect_cancels_pending_retry() {
    let temp = TempDir::new().unwrap();
    let policy = RetryPolicy {
        initial_backoff: Duration::from_secs(30),
        ..RetryPolicy::enabled()
    };
    let (handle, _task) =
        Service::with_worker(FakeWorker::failing(1), configured_store(&temp), policy)
            .unwrap()
            .spawn();

    handle.connect().await.unwrap();
    wait_for_status(&handle, |s| matches!(s.status, LinkStatus::Retrying { .. })).await;

    handle.disconnect().await.unwrap();
    assert_eq!(handle.status().await.unwrap().status, LinkStatus::Idle);
}

#[tokio::test]
async fn test_shutdown_closes_tunnel() {
    let temp = TempDir::new().unwrap();
    let worker = FakeWorker::default();
    let (handle, task) =
        Service::with_worker(worker.clone(), configured_store(&temp), RetryPolicy::default())
            .unwrap()
            .spawn();

    handle.connect().await.unwrap();
    wait_for_status(&handle, |s| s.status == LinkStatus::Connected).await;

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(handle.status().await, Err(ServiceError::Stopped)));
}

#[tokio::test]
async fn test_control_socket_roundtrip() {
    let temp = TempDir::new().unwrap();
    let store = configured_store(&temp);
    let socket_path = store.socket_path();

    let (handle, task) =
        Service::with_worker(FakeWorker::default(), store, RetryPolicy::default())
            .unwrap()
            .spawn();
    let server = IpcServer::bind_to(&socket_path).await.unwrap();
    let ipc_task = tokio::spawn(daemon::serve(server, handle.clone()));

    let mut client = IpcClient::connect_to(&socket_path).await.unwrap();
    assert_eq!(
        client.request(&IpcRequest::Ping).await.unwrap(),
        IpcResponse::Pong
    );
    assert_eq!(
        client.request(&IpcRequest::Connect).await.unwrap(),
        IpcResponse::Ok {
            message: Some("Connecting (#1)".to_string())
        }
    );

    wait_for_status(&handle, |s| s.status == LinkStatus::Connected).await;
    match client.request(&IpcRequest::Status).await.unwrap() {
        IpcResponse::Status { status } => {
            assert_eq!(status.status, LinkStatus::Connected);
            assert_eq!(status.interface.as_deref(), Some("fake1"));
        }
        other => panic!("expected status, got {:?}", other),
    }

    // Shutdown replies first, then stops the service
    assert!(matches!(
        client.request(&IpcRequest::Shutdown).await.unwrap(),
        IpcResponse::Ok { .. }
    ));
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    ipc_task.abort();
    let _ = ipc_task.await;
    assert!(!socket_path.exists());
}
