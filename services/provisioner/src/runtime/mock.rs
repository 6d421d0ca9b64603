//! In-memory fleet for tests and dry runs.
//!
//! A [`MockFleet`] plays the part of every remote host at once. Each dialed
//! host gets a [`MockRuntime`] handle sharing the fleet's state, so tests can
//! inspect containers, count mutations and observe the global order in which
//! operations happened.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ContainerRuntime, ContainerSpec, ContainerState, Dialer, RuntimeError};
use crate::cluster::HostSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOpKind {
    Create,
    Remove,
    Start,
}

/// One recorded container operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockOp {
    /// Position in the fleet-wide operation log.
    pub seq: usize,
    pub host: String,
    pub container: String,
    pub kind: MockOpKind,
}

#[derive(Default)]
struct FleetState {
    containers: HashMap<String, BTreeMap<String, ContainerState>>,
    ops: Vec<MockOp>,
    unreachable: HashSet<String>,
    failing_creates: HashSet<(String, String)>,
    exit_codes: HashMap<(String, String), i64>,
    dial_delays: HashMap<String, Duration>,
    create_delays: HashMap<String, Duration>,
    dials: Vec<String>,
    open_handles: usize,
    next_id: u64,
}

impl FleetState {
    fn record(&mut self, host: &str, container: &str, kind: MockOpKind) {
        let seq = self.ops.len();
        self.ops.push(MockOp {
            seq,
            host: host.to_string(),
            container: container.to_string(),
            kind,
        });
    }
}

/// Shared state for a simulated set of hosts.
#[derive(Clone, Default)]
pub struct MockFleet {
    state: Arc<Mutex<FleetState>>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make dialing `address` fail.
    pub fn set_unreachable(&self, address: &str) {
        self.state().unreachable.insert(address.to_string());
    }

    /// Make creating `container` on `address` fail.
    pub fn fail_create(&self, address: &str, container: &str) {
        self.state()
            .failing_creates
            .insert((address.to_string(), container.to_string()));
    }

    /// Drop every injected failure; containers and the operation log stay.
    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.unreachable.clear();
        state.failing_creates.clear();
        state.exit_codes.clear();
    }

    /// Exit code reported when waiting on `container` (default 0).
    pub fn set_exit_code(&self, address: &str, container: &str, code: i64) {
        self.state()
            .exit_codes
            .insert((address.to_string(), container.to_string()), code);
    }

    /// Delay before a dial to `address` completes.
    pub fn set_dial_delay(&self, address: &str, delay: Duration) {
        self.state().dial_delays.insert(address.to_string(), delay);
    }

    /// Delay before any container create on `address` completes.
    pub fn set_create_delay(&self, address: &str, delay: Duration) {
        self.state().create_delays.insert(address.to_string(), delay);
    }

    /// Simulate a crashed container that the runtime did not restart.
    pub fn stop(&self, address: &str, container: &str) {
        if let Some(c) = self
            .state()
            .containers
            .get_mut(address)
            .and_then(|containers| containers.get_mut(container))
        {
            c.running = false;
        }
    }

    /// Every operation so far, in order.
    pub fn operations(&self) -> Vec<MockOp> {
        self.state().ops.clone()
    }

    /// Number of creates and removes so far.
    pub fn mutation_count(&self) -> usize {
        self.state()
            .ops
            .iter()
            .filter(|op| matches!(op.kind, MockOpKind::Create | MockOpKind::Remove))
            .count()
    }

    /// Containers currently present on `address`.
    pub fn containers(&self, address: &str) -> Vec<ContainerState> {
        self.state()
            .containers
            .get(address)
            .map(|containers| containers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn container(&self, address: &str, name: &str) -> Option<ContainerState> {
        self.state()
            .containers
            .get(address)
            .and_then(|containers| containers.get(name))
            .cloned()
    }

    /// Addresses dialed so far, in completion order.
    pub fn dials(&self) -> Vec<String> {
        self.state().dials.clone()
    }

    /// Handles dialed and not yet closed or dropped.
    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }
}

#[async_trait]
impl Dialer for MockFleet {
    async fn dial(&self, host: &HostSpec) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
        let delay = self.state().dial_delays.get(&host.address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.unreachable.contains(&host.address) {
            return Err(RuntimeError::Unreachable(format!(
                "connection to {}:{} refused",
                host.address, host.ssh_port
            )));
        }
        state.dials.push(host.address.clone());
        state.open_handles += 1;
        drop(state);

        debug!(host = %host.address, "Mock: dialed host");
        Ok(Box::new(MockRuntime {
            fleet: self.clone(),
            address: host.address.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One host's view of a [`MockFleet`].
pub struct MockRuntime {
    fleet: MockFleet,
    address: String,
    closed: AtomicBool,
}

impl MockRuntime {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.fleet.state();
            state.open_handles = state.open_handles.saturating_sub(1);
        }
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::Channel(format!(
                "channel to {} already closed",
                self.address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        self.ensure_open()?;
        Ok(self.fleet.container(&self.address, name))
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.ensure_open()?;

        let delay = self.fleet.state().create_delays.get(&self.address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let mut state = self.fleet.state();
        if state
            .failing_creates
            .contains(&(self.address.clone(), spec.name.clone()))
        {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("injected failure creating {}", spec.name),
            });
        }

        let hosts = state.containers.entry(self.address.clone()).or_default();
        if hosts.contains_key(&spec.name) {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("container name {} is already in use", spec.name),
            });
        }

        state.next_id += 1;
        let id = format!("mock-{:012x}", state.next_id);
        state
            .containers
            .entry(self.address.clone())
            .or_default()
            .insert(
                spec.name.clone(),
                ContainerState {
                    id: id.clone(),
                    spec: spec.clone(),
                    running: true,
                },
            );
        state.record(&self.address, &spec.name, MockOpKind::Create);

        info!(host = %self.address, container = %spec.name, id = %id, "Mock: container created");
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.ensure_open()?;
        let mut state = self.fleet.state();
        let container = state
            .containers
            .get_mut(&self.address)
            .and_then(|containers| containers.get_mut(name))
            .ok_or_else(|| RuntimeError::Api {
                status: 404,
                message: format!("no such container: {}", name),
            })?;
        container.running = true;
        state.record(&self.address, name, MockOpKind::Start);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.ensure_open()?;
        let mut state = self.fleet.state();
        let removed = state
            .containers
            .get_mut(&self.address)
            .and_then(|containers| containers.remove(name));
        if removed.is_some() {
            state.record(&self.address, name, MockOpKind::Remove);
        }
        Ok(())
    }

    async fn wait(&self, name: &str) -> Result<i64, RuntimeError> {
        self.ensure_open()?;
        let mut state = self.fleet.state();
        let code = state
            .exit_codes
            .get(&(self.address.clone(), name.to_string()))
            .copied()
            .unwrap_or(0);
        let container = state
            .containers
            .get_mut(&self.address)
            .and_then(|containers| containers.get_mut(name))
            .ok_or_else(|| RuntimeError::Api {
                status: 404,
                message: format!("no such container: {}", name),
            })?;
        container.running = false;
        Ok(code)
    }

    async fn close(&self) -> Result<(), RuntimeError> {
        self.release();
        debug!(host = %self.address, "Mock: closed host");
        Ok(())
    }
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        self.release();
    }
}
