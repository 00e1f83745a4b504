//! Broadcast routing between network peers and local roles.
//!
//! [`Router::send_to_all`] is the only path between two roles, or between
//! a role and a network peer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use plumelink_shared::{codec, Code, CommandSet, RoleId};

use crate::dark::DarkCaptureProgress;
use crate::socket::{Ingress, Registry};

/// Where one broadcast ended up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Local role queues reached
    pub local: usize,
    /// Network peers written to
    pub remote: usize,
    /// Writes that failed, each closing its connection
    pub failed: usize,
}

impl Delivery {
    pub fn total(&self) -> usize {
        self.local + self.remote
    }
}

/// Something that can fan a command set out to everyone it should reach.
pub trait Broadcast: Send + Sync {
    fn send_to_all(&self, cmd: &CommandSet) -> Delivery;
}

/// Filters applied to commands arriving from the network before routing.
#[derive(Debug)]
pub struct IngressGate {
    dark: Arc<DarkCaptureProgress>,
    pause: Duration,
    pause_started: Mutex<Option<Instant>>,
}

impl IngressGate {
    pub fn new(dark: Arc<DarkCaptureProgress>, pause: Duration) -> Self {
        Self {
            dark,
            pause,
            pause_started: Mutex::new(None),
        }
    }

    pub fn dark(&self) -> &Arc<DarkCaptureProgress> {
        &self.dark
    }

    /// Hold back artifact notifications for the pause window.
    pub fn open_pause(&self) {
        if let Ok(mut started) = self.pause_started.lock() {
            *started = Some(Instant::now());
        }
    }

    /// Whether artifact notifications may go out now.
    pub fn notifications_allowed(&self) -> bool {
        if self.dark.is_running() {
            return false;
        }
        match self.pause_started.lock() {
            Ok(started) => started.map_or(true, |t| t.elapsed() >= self.pause),
            Err(_) => true,
        }
    }

    /// Apply the exit guard and the forced-exit rules.
    ///
    /// Returns `None` if nothing is left to route.
    pub fn admit(&self, mut cmd: CommandSet) -> Option<CommandSet> {
        if cmd.contains(Code::LOG) {
            self.open_pause();
        }

        if cmd.is_set(Code::DXT) || cmd.is_set(Code::RST) {
            // Devices wind down on EXT, so forced exits and restarts carry one
            cmd.insert(Code::EXT, true);
        } else if self.dark.is_running() && cmd.remove(Code::EXT).is_some() {
            info!("Exit refused from {}: dark capture running", cmd.source());
        }

        if cmd.is_routing_only() {
            return None;
        }
        Some(cmd)
    }
}

/// Routes command sets to local role queues and network peers.
pub struct Router {
    registry: Arc<Registry>,
    locals: RwLock<BTreeMap<RoleId, Sender<CommandSet>>>,
    gate: Arc<IngressGate>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, gate: Arc<IngressGate>) -> Self {
        Self {
            registry,
            locals: RwLock::new(BTreeMap::new()),
            gate,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<IngressGate> {
        &self.gate
    }

    /// Register a local role's inbound queue.
    pub fn attach(&self, role: RoleId, queue: Sender<CommandSet>) {
        if let Ok(mut locals) = self.locals.write() {
            locals.insert(role, queue);
        }
    }

    pub fn detach(&self, role: RoleId) {
        if let Ok(mut locals) = self.locals.write() {
            locals.remove(&role);
        }
    }

    /// Route a set received from a network peer.
    pub fn ingress(&self, cmd: CommandSet) -> Delivery {
        match self.gate.admit(cmd) {
            Some(cmd) => self.send_to_all(&cmd),
            None => Delivery::default(),
        }
    }

    fn send_remote(&self, cmd: &CommandSet, source: RoleId, delivery: &mut Delivery) {
        let bytes = codec::encode(cmd);
        for conn in self.registry.snapshot() {
            // No echo to the sender's own kind
            if conn.role() == source {
                continue;
            }
            match conn.write_message(&bytes) {
                Ok(()) => delivery.remote += 1,
                Err(e) => {
                    warn!("Dropping {} ({}): {e}", conn.peer(), conn.role());
                    self.registry.close(&conn.peer());
                    delivery.failed += 1;
                }
            }
        }
    }

    fn send_local(&self, cmd: &CommandSet, source: RoleId, delivery: &mut Delivery) {
        let Ok(locals) = self.locals.read() else {
            return;
        };
        for (role, queue) in locals.iter() {
            if *role == source || !cmd.is_addressed_to(*role) {
                continue;
            }
            match queue.send(cmd.clone()) {
                Ok(()) => delivery.local += 1,
                Err(_) => debug!("{role} queue closed"),
            }
        }
    }
}

impl Broadcast for Router {
    fn send_to_all(&self, cmd: &CommandSet) -> Delivery {
        let source = cmd.source();
        let mut delivery = Delivery::default();
        if cmd.is_addressed_to(RoleId::External) {
            self.send_remote(cmd, source, &mut delivery);
        }
        self.send_local(cmd, source, &mut delivery);
        debug!("Routed {cmd:?} from {source}: {delivery:?}");
        delivery
    }
}

impl Ingress for Router {
    fn ingress(&self, cmd: CommandSet) {
        Router::ingress(self, cmd);
    }
}
