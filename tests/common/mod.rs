//! Shared test harness: an in-memory container engine whose started
//! containers answer real HTTP on their host port, so provisioning
//! exercises the same readiness poll as production.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use worldhub::directory::Directory;
use worldhub::engine::{
    ContainerAddress, ContainerEngine, ContainerSpec, EngineContainer, EngineError,
};
use worldhub::lifecycle::{LifecycleConfig, LifecycleManager};
use worldhub::ports::PortAllocator;
use worldhub::registry::Registry;

pub struct MockContainer {
    pub user: String,
    pub running: bool,
    pub host_port: u16,
    pub server: Option<tokio::task::JoinHandle<()>>,
}

/// In-memory engine; started containers answer HTTP on their host port.
pub struct MockEngine {
    pub containers: Mutex<HashMap<String, MockContainer>>,
    pub specs: Mutex<Vec<ContainerSpec>>,
    pub create_calls: AtomicUsize,
    pub prune_calls: AtomicUsize,
    pub stop_calls: Mutex<Vec<String>>,
    pub remove_calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    /// When false, create_and_start is rejected
    pub accept_creates: AtomicBool,
    /// When false, started containers never answer the readiness probe
    pub serve_http: AtomicBool,
    /// Delay before a started container begins answering
    pub ready_delay: Mutex<Duration>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            prune_calls: AtomicUsize::new(0),
            stop_calls: Mutex::new(Vec::new()),
            remove_calls: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            accept_creates: AtomicBool::new(true),
            serve_http: AtomicBool::new(true),
            ready_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn created(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn stops_for(&self, container_id: &str) -> usize {
        self.stop_calls
            .lock()
            .iter()
            .filter(|id| id.as_str() == container_id)
            .count()
    }

    /// Seed a running container the registry knows nothing about.
    pub fn seed_running(&self, user: &str, host_port: u16) -> String {
        let id = format!("seeded-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            MockContainer {
                user: user.to_string(),
                running: true,
                host_port,
                server: None,
            },
        );
        id
    }

    /// Simulate `docker rm -f` behind the gateway's back.
    pub async fn remove_out_of_band(&self, container_id: &str) {
        let server = self
            .containers
            .lock()
            .remove(container_id)
            .and_then(|container| container.server);
        stop_server(server).await;
    }

    /// Simulate the container exiting on its own.
    pub async fn stop_out_of_band(&self, container_id: &str) {
        let server = match self.containers.lock().get_mut(container_id) {
            Some(container) => {
                container.running = false;
                container.server.take()
            }
            None => None,
        };
        stop_server(server).await;
    }
}

/// Abort a container's HTTP server and wait until its listener is gone,
/// so the freed port is observably rebindable.
async fn stop_server(server: Option<tokio::task::JoinHandle<()>>) {
    if let Some(server) = server {
        server.abort();
        let _ = server.await;
    }
}

async fn serve_http(listener: tokio::net::TcpListener) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            break;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await;
        });
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if !self.accept_creates.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected(
                "mock engine refuses creates".to_string(),
            ));
        }

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let host_port = spec.host_port;

        let server = if self.serve_http.load(Ordering::SeqCst) {
            let delay = *self.ready_delay.lock();
            Some(tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", host_port)).await
                {
                    serve_http(listener).await;
                }
            }))
        } else {
            None
        };

        self.containers.lock().insert(
            id.clone(),
            MockContainer {
                user: spec.name.clone(),
                running: true,
                host_port,
                server,
            },
        );
        self.specs.lock().push(spec);

        Ok(id)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerAddress, EngineError> {
        self.containers
            .lock()
            .get(container_id)
            .map(|container| ContainerAddress {
                address: "127.0.0.1".to_string(),
                port: container.host_port,
            })
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))
    }

    async fn stop(&self, container_id: &str) -> Result<(), EngineError> {
        self.stop_calls.lock().push(container_id.to_string());
        let server = match self.containers.lock().get_mut(container_id) {
            Some(container) => {
                container.running = false;
                container.server.take()
            }
            None => None,
        };
        stop_server(server).await;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        self.remove_calls.lock().push(container_id.to_string());
        let server = self
            .containers
            .lock()
            .remove(container_id)
            .and_then(|container| container.server);
        stop_server(server).await;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<EngineContainer>, EngineError> {
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|(id, container)| EngineContainer {
                id: id.clone(),
                user: container.user.clone(),
                running: container.running,
                host_port: Some(container.host_port),
            })
            .collect())
    }

    async fn prune(&self) -> Result<Vec<String>, EngineError> {
        self.prune_calls.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock();
        let stopped: Vec<String> = containers
            .iter()
            .filter(|(_, container)| !container.running)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stopped {
            containers.remove(id);
        }
        Ok(stopped)
    }
}

pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub lifecycle: Arc<LifecycleManager>,
    pub registry: Arc<Registry>,
    pub ports: Arc<PortAllocator>,
    _directory_file: tempfile::NamedTempFile,
}

/// Build a lifecycle manager over the mock engine. Each test gets its own
/// port range so parallel tests never contend for host ports.
pub fn harness(port_range: (u16, u16)) -> Harness {
    harness_with(port_range, Duration::from_secs(5), Duration::from_millis(50))
}

pub fn harness_with(
    port_range: (u16, u16),
    ready_timeout: Duration,
    ready_interval: Duration,
) -> Harness {
    let mut directory_file = tempfile::NamedTempFile::new().unwrap();
    directory_file
        .write_all(
            br#"{
        "alice": {"uid": 1201, "gid": 5000, "district": "sunlab"},
        "bob": {"uid": 1202, "gid": 5000, "district": "sunlab"},
        "carol": {"uid": 1203, "gid": 5001, "district": "alden"}
    }"#,
        )
        .unwrap();
    directory_file.flush().unwrap();

    let engine = MockEngine::new();
    let registry = Arc::new(Registry::new());
    let ports = Arc::new(PortAllocator::new(port_range));

    let engine_handle: Arc<dyn ContainerEngine> = engine.clone();
    let lifecycle = LifecycleManager::new(
        engine_handle,
        Arc::clone(&registry),
        Arc::clone(&ports),
        Directory::new(directory_file.path()),
        LifecycleConfig {
            image: "world:test".to_string(),
            volume: "world-data".to_string(),
            ready_timeout,
            ready_interval,
        },
    );

    Harness {
        engine,
        lifecycle,
        registry,
        ports,
        _directory_file: directory_file,
    }
}
