//! Coordinated exit of the whole instrument.
//!
//! `Idle -> Draining -> Closing -> Waiting -> Terminated`. Goodbye goes out
//! before any connection is closed; the wait for other roles is bounded and
//! proceeds regardless once it elapses.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use plumelink_shared::{Code, CommandSet, RoleId};

use super::{RoleCtx, RoleStatus};
use crate::socket::SocketServer;

/// Poll period while waiting for roles to wind down.
const WAIT_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPhase {
    Idle,
    Draining,
    Closing,
    Waiting,
    Terminated,
}

/// Why the process is leaving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Exit,
    /// Leave and rely on the supervisor to relaunch
    Restart,
}

impl ExitReason {
    /// Process exit status.
    pub const fn code(self) -> u8 {
        match self {
            ExitReason::Exit => 0,
            ExitReason::Restart => 3,
        }
    }
}

/// Predicate-signal pair set once the shutdown sequence has finished.
#[derive(Debug, Default)]
pub struct ExitSignal {
    reason: Mutex<Option<ExitReason>>,
    cvar: Condvar,
}

impl ExitSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the reason and wake every waiter. Only the first reason is kept.
    pub fn finish(&self, reason: ExitReason) {
        let mut state = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            *state = Some(reason);
        }
        self.cvar.notify_all();
    }

    pub fn get(&self) -> Option<ExitReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the sequence finishes.
    pub fn wait(&self) -> ExitReason {
        let mut state = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(reason) = *state {
                return reason;
            }
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitReason> {
        let deadline = Instant::now() + timeout;
        let mut state = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        while state.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .cvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *state
    }
}

/// What the shutdown sequence closes and watches on the network side.
pub trait Endpoint: Send + Sync {
    fn close_connections(&self) -> usize;
    fn close_listener(&self);
    /// Whether no acceptor slot is still serving a peer.
    fn is_idle(&self) -> bool;
}

impl Endpoint for SocketServer {
    fn close_connections(&self) -> usize {
        SocketServer::close_connections(self)
    }

    fn close_listener(&self) {
        SocketServer::close_listener(self)
    }

    fn is_idle(&self) -> bool {
        SocketServer::is_idle(self)
    }
}

/// The orchestrator's shutdown state machine.
pub struct Shutdown {
    endpoint: Arc<dyn Endpoint>,
    roles: Vec<Arc<RoleStatus>>,
    exit: Arc<ExitSignal>,
    drain_pause: Duration,
    timeout: Duration,
    phase: ShutdownPhase,
}

impl Shutdown {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        roles: Vec<Arc<RoleStatus>>,
        exit: Arc<ExitSignal>,
        drain_pause: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            roles,
            exit,
            drain_pause,
            timeout,
            phase: ShutdownPhase::Idle,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    pub fn exit_signal(&self) -> &Arc<ExitSignal> {
        &self.exit
    }

    /// Run the whole sequence on the calling thread. Later calls are ignored.
    pub fn run(&mut self, ctx: &RoleCtx<'_>, reason: ExitReason) {
        if self.phase != ShutdownPhase::Idle {
            info!("Shutdown already {:?}; ignoring {reason:?}", self.phase);
            return;
        }

        self.enter(ShutdownPhase::Draining);
        ctx.announce(CommandSet::new().with(Code::GBY, 1));
        let mut wind_down = CommandSet::new().with(Code::EXT, true);
        wind_down.set_destination(&[RoleId::CameraA, RoleId::CameraB, RoleId::Spectrometer]);
        ctx.announce(wind_down);
        thread::sleep(self.drain_pause);

        self.enter(ShutdownPhase::Closing);
        let closed = self.endpoint.close_connections();
        self.endpoint.close_listener();
        info!("Closed {closed} connections and the listener");

        self.enter(ShutdownPhase::Waiting);
        let deadline = Instant::now() + self.timeout;
        while self.busy() {
            if Instant::now() >= deadline {
                warn!(
                    "Proceeding with {} roles still working after {:?}",
                    self.roles.iter().filter(|r| r.is_working()).count(),
                    self.timeout
                );
                break;
            }
            thread::sleep(WAIT_POLL);
        }

        self.enter(ShutdownPhase::Terminated);
        ctx.stop();
        self.exit.finish(reason);
    }

    fn busy(&self) -> bool {
        self.roles.iter().any(|r| r.is_working()) || !self.endpoint.is_idle()
    }

    fn enter(&mut self, phase: ShutdownPhase) {
        info!("Shutdown {:?} -> {phase:?}", self.phase);
        self.phase = phase;
    }
}
