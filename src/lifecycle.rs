//! Container lifecycle management
//!
//! Owns every transition a workspace goes through: provisioning (with
//! explicit single-flight deduplication), readiness polling, reconciliation
//! against the engine's ground truth, and teardown. The registry and port
//! pool are only ever mutated through this module and the proxy's
//! bookkeeping calls.

use crate::directory::{Directory, DirectoryEntry};
use crate::engine::{ContainerEngine, ContainerSpec};
use crate::error::GatewayError;
use crate::ports::PortAllocator;
use crate::registry::{Registry, Workspace, WorkspaceState, WorkspaceUpdate};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Hostname set inside every workspace container.
const CONTAINER_HOSTNAME: &str = "term-world";

/// Mount point of the shared volume inside workspaces.
const VOLUME_TARGET: &str = "/world";

/// Per-attempt connect/read timeout for the readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings for provisioning and readiness polling.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Image workspace containers run
    pub image: String,
    /// Shared volume bound at /world
    pub volume: String,
    /// Wall-clock deadline for the readiness poll
    pub ready_timeout: Duration,
    /// Backoff between readiness attempts
    pub ready_interval: Duration,
}

/// Which workspaces a teardown covers.
#[derive(Debug, Clone)]
pub enum TeardownScope {
    /// One user's workspace
    Single(String),
    /// Every tracked workspace (process shutdown)
    All,
}

/// Result shared with followers attached to an in-flight provisioning.
/// The error is flattened to its message so it can fan out.
type SharedOutcome = Result<Workspace, String>;

/// Creates, adopts, and destroys workspace containers.
///
/// Returned as `Arc<Self>` because it is shared across the proxy server,
/// the activity monitor, and the shutdown path.
pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    ports: Arc<PortAllocator>,
    directory: Directory,
    config: LifecycleConfig,
    /// In-flight provisioning per user; followers await the leader's
    /// result here instead of issuing a second create.
    in_flight: DashMap<String, watch::Receiver<Option<SharedOutcome>>>,
    /// Set once shutdown begins; refuses new provisioning.
    draining: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<Registry>,
        ports: Arc<PortAllocator>,
        directory: Directory,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            registry,
            ports,
            directory,
            config,
            in_flight: DashMap::new(),
            draining: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Resolve a routable workspace for the user, provisioning one if
    /// needed. Concurrent calls for the same user share one creation.
    pub async fn provision(&self, user: &str) -> Result<Workspace, GatewayError> {
        if self.is_draining() {
            return Err(GatewayError::Draining);
        }

        if let Some(workspace) = self.registry.get(user) {
            if workspace.is_routable() {
                return Ok(workspace);
            }
        }

        // Single-flight: first caller becomes the leader, the rest attach
        // to its result channel.
        let leader_tx = match self.in_flight.entry(user.to_string()) {
            Entry::Occupied(slot) => {
                let rx = slot.get().clone();
                drop(slot);
                debug!(user, "Attaching to in-flight provisioning");
                return await_leader(rx).await;
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                tx
            }
        };

        let result = self.provision_as_leader(user).await;

        self.in_flight.remove(user);
        let shared = result
            .as_ref()
            .map(Clone::clone)
            .map_err(|e| e.to_string());
        let _ = leader_tx.send(Some(shared));

        result
    }

    /// The leader path: allocate, create, poll, publish.
    async fn provision_as_leader(&self, user: &str) -> Result<Workspace, GatewayError> {
        if !self.registry.begin_provisioning(user) {
            // An entry appeared since the fast path: routable means a
            // racing provision finished; anything else is mid-teardown.
            if let Some(workspace) = self.registry.get(user) {
                if workspace.is_routable() {
                    return Ok(workspace);
                }
            }
            return Err(GatewayError::Provision(format!(
                "workspace for '{}' is being torn down, retry shortly",
                user
            )));
        }

        // The port is claimed before the first await so no concurrent
        // provisioning can be handed the same one.
        let port = match self.ports.acquire() {
            Ok(port) => port,
            Err(e) => {
                self.registry.remove(user);
                return Err(e);
            }
        };

        match self.create_and_await_ready(user, port).await {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                // Leave nothing dangling: container (if any), registry
                // entry, and port are all reclaimed on failure.
                if let Some(removed) = self.registry.remove(user) {
                    if !removed.container_id.is_empty() {
                        let _ = self.engine.stop(&removed.container_id).await;
                        let _ = self.engine.remove(&removed.container_id).await;
                    }
                }
                self.ports.release(port);
                warn!(user, error = %e, "Provisioning failed");
                Err(e)
            }
        }
    }

    async fn create_and_await_ready(
        &self,
        user: &str,
        port: u16,
    ) -> Result<Workspace, GatewayError> {
        // The directory is re-read per attempt so roster changes apply
        // without a restart.
        let entry = self.directory.lookup(user)?;

        let spec = ContainerSpec {
            name: user.to_string(),
            image: self.config.image.clone(),
            hostname: CONTAINER_HOSTNAME.to_string(),
            env: workspace_env(user, &entry),
            volume_bind: format!("{}:{}", self.config.volume, VOLUME_TARGET),
            host_port: port,
        };

        let container_id = self
            .engine
            .create_and_start(spec)
            .await
            .map_err(|e| GatewayError::Provision(e.to_string()))?;

        self.registry.upsert(
            user,
            WorkspaceUpdate {
                container_id: Some(container_id.clone()),
                address: Some("127.0.0.1".to_string()),
                port: Some(port),
                state: Some(WorkspaceState::AwaitingReady),
            },
        );

        self.await_ready("127.0.0.1", port).await?;

        // Shutdown may have started while we were polling; publishing the
        // workspace now would leave a container running past the drain.
        if self.is_draining() {
            return Err(GatewayError::Draining);
        }

        self.registry.upsert(
            user,
            WorkspaceUpdate {
                state: Some(WorkspaceState::Ready),
                ..Default::default()
            },
        );
        self.registry.touch(user);

        info!(user, container_id, port, "Workspace ready");

        self.registry.get(user).ok_or_else(|| {
            GatewayError::Provision(format!("workspace for '{}' vanished during provisioning", user))
        })
    }

    /// Poll the workspace root until it answers any HTTP response.
    ///
    /// The poll is bounded: a fixed backoff between attempts and a
    /// wall-clock deadline, after which the attempt fails rather than
    /// retrying forever.
    pub async fn await_ready(&self, address: &str, port: u16) -> Result<(), GatewayError> {
        let start = Instant::now();

        loop {
            if probe_root(address, port).await {
                debug!(address, port, elapsed_ms = start.elapsed().as_millis() as u64, "Workspace answered readiness probe");
                return Ok(());
            }

            if start.elapsed() >= self.config.ready_timeout {
                return Err(GatewayError::ReadinessTimeout {
                    elapsed: start.elapsed(),
                });
            }

            tokio::time::sleep(self.config.ready_interval).await;
        }
    }

    /// Resynchronize the registry against the engine's ground truth.
    ///
    /// Running containers the registry does not know are adopted (restart
    /// recovery); registry entries whose container is gone are evicted.
    /// Idempotent: with no engine change, a second run mutates nothing.
    pub async fn reconcile(&self) -> Result<(), GatewayError> {
        let containers = self.engine.list().await?;

        let mut engine_users = HashSet::new();
        for container in &containers {
            engine_users.insert(container.user.clone());

            if self.registry.get(&container.user).is_some() {
                continue;
            }

            if !container.running {
                // Stopped leftover from a previous life; the prune sweep
                // would collect it eventually, reclaim it now.
                let _ = self.engine.remove(&container.id).await;
                engine_users.remove(&container.user);
                continue;
            }

            let address = match self.engine.inspect(&container.id).await {
                Ok(address) => address,
                Err(e) => {
                    warn!(user = %container.user, container_id = %container.id, error = %e, "Cannot adopt container, removing it");
                    let _ = self.engine.remove(&container.id).await;
                    engine_users.remove(&container.user);
                    continue;
                }
            };

            if !self.ports.claim(address.port) {
                warn!(user = %container.user, port = address.port, "Adopted container's port was already claimed");
            }

            self.registry.upsert(
                &container.user,
                WorkspaceUpdate {
                    container_id: Some(container.id.clone()),
                    address: Some(address.address.clone()),
                    port: Some(address.port),
                    state: Some(WorkspaceState::Ready),
                },
            );
            info!(user = %container.user, container_id = %container.id, port = address.port, "Adopted running workspace container");
        }

        // Evict registry entries the engine no longer backs.
        for workspace in self.registry.list_all() {
            if workspace.container_id.is_empty() {
                // Provisioning in flight; the leader owns this entry.
                continue;
            }
            if workspace.state == WorkspaceState::Stopping {
                // Teardown owns it.
                continue;
            }
            if !engine_users.contains(&workspace.user) {
                info!(user = %workspace.user, container_id = %workspace.container_id, "Evicting workspace whose container disappeared");
                self.evict(&workspace.user);
            }
        }

        Ok(())
    }

    /// Evict registry entries whose container the engine just pruned, and
    /// any entry whose container has otherwise disappeared out-of-band.
    pub async fn sweep_pruned(&self) {
        let pruned = match self.engine.prune().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Prune sweep failed");
                return;
            }
        };

        if !pruned.is_empty() {
            let pruned: HashSet<&String> = pruned.iter().collect();
            for workspace in self.registry.list_all() {
                if pruned.contains(&workspace.container_id) {
                    info!(user = %workspace.user, container_id = %workspace.container_id, "Workspace container was pruned, evicting");
                    self.evict(&workspace.user);
                }
            }
        }

        // Catch containers removed by hand (`docker rm -f`), which prune
        // does not report.
        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "Reconciliation sweep failed");
        }
    }

    /// Stop and remove one workspace or all of them.
    ///
    /// Engine failures on stop/remove are logged but never abort the
    /// sequence; the trailing prune is the backstop that reclaims
    /// engine-side state regardless.
    pub async fn teardown(&self, scope: TeardownScope) {
        match scope {
            TeardownScope::Single(user) => {
                self.teardown_user(&user).await;
            }
            TeardownScope::All => {
                self.draining.store(true, Ordering::SeqCst);
                let users: Vec<String> = self
                    .registry
                    .list_all()
                    .into_iter()
                    .map(|workspace| workspace.user)
                    .collect();
                info!(count = users.len(), "Tearing down all workspaces");
                for user in users {
                    self.teardown_user(&user).await;
                }
            }
        }

        if let Err(e) = self.engine.prune().await {
            warn!(error = %e, "Trailing prune failed");
        }
    }

    async fn teardown_user(&self, user: &str) {
        // Claiming the Stopping state is atomic; a second teardown (or a
        // late single teardown racing all-teardown) gets None and no-ops.
        let Some(workspace) = self.registry.begin_stopping(user) else {
            debug!(user, "Teardown requested for absent or already-stopping workspace");
            return;
        };

        if !workspace.container_id.is_empty() {
            if let Err(e) = self.engine.stop(&workspace.container_id).await {
                warn!(user, container_id = %workspace.container_id, error = %e, "Stop failed during teardown");
            }
            if let Err(e) = self.engine.remove(&workspace.container_id).await {
                warn!(user, container_id = %workspace.container_id, error = %e, "Remove failed during teardown");
            }
        }

        self.evict(user);
        info!(user, container_id = %workspace.container_id, "Workspace torn down");
    }

    /// Drop a stale registry entry (backend unreachable mid-session).
    /// The container itself, if it still exists, is collected by the
    /// prune sweep or replaced on the next provisioning.
    pub fn evict_stale(&self, user: &str) {
        warn!(user, "Evicting stale workspace after proxy failure");
        self.evict(user);
    }

    fn evict(&self, user: &str) {
        if let Some(removed) = self.registry.remove(user) {
            if removed.port != 0 {
                self.ports.release(removed.port);
            }
        }
    }
}

/// Await the result of a provisioning led by another caller.
async fn await_leader(
    mut rx: watch::Receiver<Option<SharedOutcome>>,
) -> Result<Workspace, GatewayError> {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return outcome.map_err(GatewayError::Provision);
        }
        if rx.changed().await.is_err() {
            return Err(GatewayError::Provision(
                "provisioning aborted before completion".to_string(),
            ));
        }
    }
}

/// Environment handed to a workspace container.
fn workspace_env(user: &str, entry: &DirectoryEntry) -> Vec<String> {
    vec![
        format!("VS_USER={}", user),
        format!("VS_USER_ID={}", entry.uid),
        format!("DISTRICT={}", entry.district),
        format!("GID={}", entry.gid),
    ]
}

/// One readiness attempt: connect and issue a root GET. Any parseable
/// HTTP status line counts as ready.
async fn probe_root(address: &str, port: u16) -> bool {
    let target = format!("{}:{}", address, port);

    let connect = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::net::TcpStream::connect(&target),
    )
    .await;

    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        target
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read = tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read {
        Ok(Ok(status_line)) => status_line.starts_with("HTTP/"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_env_matches_directory_entry() {
        let entry = DirectoryEntry {
            uid: 1201,
            gid: 5000,
            district: "sunlab".to_string(),
        };

        let env = workspace_env("alice", &entry);
        assert_eq!(
            env,
            vec![
                "VS_USER=alice",
                "VS_USER_ID=1201",
                "DISTRICT=sunlab",
                "GID=5000",
            ]
        );
    }

    #[tokio::test]
    async fn probe_root_rejects_closed_port() {
        // Bind then drop to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!probe_root("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn probe_root_accepts_any_http_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            use tokio::io::AsyncReadExt;
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        assert!(probe_root("127.0.0.1", port).await);
    }
}
