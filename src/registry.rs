//! In-memory session registry mapping users to workspace state
//!
//! The registry is the single source of truth for which container serves
//! which user. Compound state transitions happen under the per-entry mutex
//! and never across an await point; single-field updates (activity
//! timestamp, connection count) take the lock only briefly.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::debug;

/// Lifecycle state of a workspace.
///
/// Absence from the registry is the "absent" state; `Removed` is recorded
/// on the final snapshot returned by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    /// Creation requested, container not yet accepted by the engine
    Provisioning,
    /// Container created, waiting for it to accept connections
    AwaitingReady,
    /// Serving traffic
    Ready,
    /// Flagged by the idle sweep, teardown pending
    Idle,
    /// Stop+remove in progress
    Stopping,
    /// Torn down; the record is evicted immediately after
    Removed,
}

/// One per-user workspace: a container plus its registry metadata.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub user: String,
    /// Engine-assigned container identity; empty until the engine accepts
    /// the create call
    pub container_id: String,
    /// Host address the container is reachable at
    pub address: String,
    /// Host port bound to the container
    pub port: u16,
    /// Currently open proxied upgrade connections
    pub connection_count: usize,
    /// Last observed traffic
    pub last_active: Instant,
    pub state: WorkspaceState,
}

impl Workspace {
    fn placeholder(user: &str) -> Self {
        Self {
            user: user.to_string(),
            container_id: String::new(),
            address: String::new(),
            port: 0,
            connection_count: 0,
            last_active: Instant::now(),
            state: WorkspaceState::Provisioning,
        }
    }

    /// Whether the workspace can receive proxied traffic.
    pub fn is_routable(&self) -> bool {
        matches!(self.state, WorkspaceState::Ready | WorkspaceState::Idle)
    }
}

/// Partial update merged into an existing workspace record.
#[derive(Debug, Default)]
pub struct WorkspaceUpdate {
    pub container_id: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub state: Option<WorkspaceState>,
}

/// Keyed store over user identity. At most one workspace per user.
pub struct Registry {
    workspaces: DashMap<String, Mutex<Workspace>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            workspaces: DashMap::new(),
        }
    }

    /// Snapshot of the workspace for a user, if one exists.
    pub fn get(&self, user: &str) -> Option<Workspace> {
        self.workspaces.get(user).map(|w| w.lock().clone())
    }

    pub fn state_of(&self, user: &str) -> Option<WorkspaceState> {
        self.workspaces.get(user).map(|w| w.lock().state)
    }

    /// Atomically insert a `Provisioning` placeholder if and only if no
    /// workspace exists for the user. Returns false when an entry is
    /// already present, in any state.
    pub fn begin_provisioning(&self, user: &str) -> bool {
        match self.workspaces.entry(user.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Mutex::new(Workspace::placeholder(user)));
                debug!(user, "Workspace entered provisioning");
                true
            }
        }
    }

    /// Merge fields into the workspace record, inserting a fresh record
    /// when none exists (used by reconcile to adopt engine-known
    /// containers). Unset fields are left untouched.
    pub fn upsert(&self, user: &str, update: WorkspaceUpdate) {
        let entry = self
            .workspaces
            .entry(user.to_string())
            .or_insert_with(|| Mutex::new(Workspace::placeholder(user)));

        let mut workspace = entry.lock();
        if let Some(container_id) = update.container_id {
            workspace.container_id = container_id;
        }
        if let Some(address) = update.address {
            workspace.address = address;
        }
        if let Some(port) = update.port {
            workspace.port = port;
        }
        if let Some(state) = update.state {
            workspace.state = state;
        }
    }

    /// Set only the lifecycle state. Returns the previous state, or None
    /// when the user has no workspace.
    pub fn set_state(&self, user: &str, state: WorkspaceState) -> Option<WorkspaceState> {
        self.workspaces.get(user).map(|w| {
            let mut workspace = w.lock();
            std::mem::replace(&mut workspace.state, state)
        })
    }

    /// Atomically claim the workspace for teardown: move it to `Stopping`
    /// and return its snapshot. Returns None when there is no workspace or
    /// another teardown already owns it, making double teardown a no-op.
    pub fn begin_stopping(&self, user: &str) -> Option<Workspace> {
        let entry = self.workspaces.get(user)?;
        let mut workspace = entry.lock();
        if workspace.state == WorkspaceState::Stopping {
            return None;
        }
        let snapshot = workspace.clone();
        workspace.state = WorkspaceState::Stopping;
        Some(snapshot)
    }

    /// Record observed traffic for the user's workspace.
    pub fn touch(&self, user: &str) {
        if let Some(workspace) = self.workspaces.get(user) {
            workspace.lock().last_active = Instant::now();
        }
    }

    /// Record a newly opened proxied connection.
    pub fn connection_opened(&self, user: &str) {
        if let Some(workspace) = self.workspaces.get(user) {
            let mut workspace = workspace.lock();
            workspace.connection_count += 1;
            workspace.last_active = Instant::now();
        }
    }

    /// Record a closed proxied connection. The activity timestamp is
    /// refreshed so the idle clock starts at socket close, not at the
    /// last data frame. Returns the remaining open-connection count.
    pub fn connection_closed(&self, user: &str) -> usize {
        match self.workspaces.get(user) {
            Some(workspace) => {
                let mut workspace = workspace.lock();
                workspace.connection_count = workspace.connection_count.saturating_sub(1);
                workspace.last_active = Instant::now();
                workspace.connection_count
            }
            None => 0,
        }
    }

    /// Evict the workspace, returning its final snapshot marked `Removed`.
    pub fn remove(&self, user: &str) -> Option<Workspace> {
        self.workspaces.remove(user).map(|(_, workspace)| {
            let mut workspace = workspace.into_inner();
            workspace.state = WorkspaceState::Removed;
            debug!(user = %workspace.user, container_id = %workspace.container_id, "Workspace evicted");
            workspace
        })
    }

    /// Snapshots of all workspaces currently in one of the given states.
    pub fn list_by_state(&self, states: &[WorkspaceState]) -> Vec<Workspace> {
        self.workspaces
            .iter()
            .filter_map(|entry| {
                let workspace = entry.value().lock();
                states.contains(&workspace.state).then(|| workspace.clone())
            })
            .collect()
    }

    /// Snapshots of every tracked workspace.
    pub fn list_all(&self) -> Vec<Workspace> {
        self.workspaces
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_provisioning_is_exclusive() {
        let registry = Registry::new();

        assert!(registry.begin_provisioning("alice"));
        assert!(!registry.begin_provisioning("alice"));

        assert_eq!(registry.state_of("alice"), Some(WorkspaceState::Provisioning));
    }

    #[test]
    fn upsert_merges_without_clobbering() {
        let registry = Registry::new();
        registry.begin_provisioning("alice");

        registry.upsert(
            "alice",
            WorkspaceUpdate {
                container_id: Some("c0ffee".to_string()),
                address: Some("127.0.0.1".to_string()),
                port: Some(4242),
                state: Some(WorkspaceState::AwaitingReady),
            },
        );

        // A state-only update must not touch the other fields.
        registry.upsert(
            "alice",
            WorkspaceUpdate {
                state: Some(WorkspaceState::Ready),
                ..Default::default()
            },
        );

        let workspace = registry.get("alice").unwrap();
        assert_eq!(workspace.container_id, "c0ffee");
        assert_eq!(workspace.address, "127.0.0.1");
        assert_eq!(workspace.port, 4242);
        assert_eq!(workspace.state, WorkspaceState::Ready);
    }

    #[test]
    fn upsert_inserts_when_absent() {
        let registry = Registry::new();

        registry.upsert(
            "bob",
            WorkspaceUpdate {
                container_id: Some("deadbeef".to_string()),
                port: Some(5555),
                state: Some(WorkspaceState::Ready),
                ..Default::default()
            },
        );

        let workspace = registry.get("bob").unwrap();
        assert_eq!(workspace.container_id, "deadbeef");
        assert_eq!(workspace.state, WorkspaceState::Ready);
    }

    #[test]
    fn touch_refreshes_activity() {
        let registry = Registry::new();
        registry.begin_provisioning("alice");

        let before = registry.get("alice").unwrap().last_active;
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch("alice");

        assert!(registry.get("alice").unwrap().last_active > before);
    }

    #[test]
    fn connection_count_round_trip() {
        let registry = Registry::new();
        registry.begin_provisioning("alice");

        registry.connection_opened("alice");
        registry.connection_opened("alice");
        assert_eq!(registry.get("alice").unwrap().connection_count, 2);

        assert_eq!(registry.connection_closed("alice"), 1);
        assert_eq!(registry.connection_closed("alice"), 0);
        // Underflow is clamped.
        assert_eq!(registry.connection_closed("alice"), 0);
    }

    #[test]
    fn connection_closed_refreshes_activity() {
        let registry = Registry::new();
        registry.begin_provisioning("alice");
        registry.connection_opened("alice");

        let before = registry.get("alice").unwrap().last_active;
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.connection_closed("alice");

        assert!(registry.get("alice").unwrap().last_active > before);
    }

    #[test]
    fn remove_returns_removed_snapshot() {
        let registry = Registry::new();
        registry.begin_provisioning("alice");
        registry.upsert(
            "alice",
            WorkspaceUpdate {
                port: Some(3131),
                state: Some(WorkspaceState::Stopping),
                ..Default::default()
            },
        );

        let removed = registry.remove("alice").unwrap();
        assert_eq!(removed.state, WorkspaceState::Removed);
        assert_eq!(removed.port, 3131);

        assert!(registry.get("alice").is_none());
        assert!(registry.remove("alice").is_none());
    }

    #[test]
    fn begin_stopping_claims_exactly_once() {
        let registry = Registry::new();
        registry.begin_provisioning("alice");
        registry.set_state("alice", WorkspaceState::Ready);

        let claimed = registry.begin_stopping("alice").unwrap();
        assert_eq!(claimed.state, WorkspaceState::Ready);
        assert_eq!(registry.state_of("alice"), Some(WorkspaceState::Stopping));

        // A second teardown must not claim the same workspace.
        assert!(registry.begin_stopping("alice").is_none());
        assert!(registry.begin_stopping("nobody").is_none());
    }

    #[test]
    fn list_by_state_filters() {
        let registry = Registry::new();
        registry.begin_provisioning("alice");
        registry.begin_provisioning("bob");
        registry.set_state("bob", WorkspaceState::Ready);

        let ready = registry.list_by_state(&[WorkspaceState::Ready]);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].user, "bob");

        let routable = registry.list_by_state(&[WorkspaceState::Ready, WorkspaceState::Idle]);
        assert_eq!(routable.len(), 1);
    }

    #[test]
    fn is_routable_states() {
        let mut workspace = Workspace::placeholder("alice");
        assert!(!workspace.is_routable());

        workspace.state = WorkspaceState::Ready;
        assert!(workspace.is_routable());

        workspace.state = WorkspaceState::Idle;
        assert!(workspace.is_routable());

        workspace.state = WorkspaceState::Stopping;
        assert!(!workspace.is_routable());
    }
}
