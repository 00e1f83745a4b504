//! Role dispatchers.
//!
//! Each role runs one worker thread that pops command sets from its
//! inbound queue and calls the handler registered for each code. Handler
//! tables are static per role type. A code with no entry is simply not
//! addressed to this role.

pub mod camera;
pub mod external;
pub mod orchestrator;
pub mod shutdown;
pub mod spectrometer;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use plumelink_shared::{Code, CommandSet, RoleId, Value};

use crate::error::DeviceError;
use crate::router::{Broadcast, Delivery};

pub use camera::{Band, CameraRole};
pub use external::{ClientEvent, ExternalClient};
pub use orchestrator::Orchestrator;
pub use shutdown::{ExitReason, ExitSignal, Shutdown, ShutdownPhase};
pub use spectrometer::SpectrometerRole;

/// Why a handler could not act on its code. The worker answers with `ERR <code>`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Value not acceptable in the current state
    #[error("rejected")]
    Rejected,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type HandlerResult = Result<(), HandlerError>;

/// Handler for one code.
pub type Handler<R> = fn(&mut R, &mut RoleCtx<'_>, &Value) -> HandlerResult;

pub(crate) fn int(value: &Value) -> Result<i64, HandlerError> {
    value.as_int().ok_or(HandlerError::Rejected)
}

pub(crate) fn float(value: &Value) -> Result<f64, HandlerError> {
    value.as_float().ok_or(HandlerError::Rejected)
}

/// Value of a code that is only meaningful when true.
pub(crate) fn require(value: &Value) -> HandlerResult {
    if value.as_bool() {
        Ok(())
    } else {
        Err(HandlerError::Rejected)
    }
}

/// A logical participant with a static code-to-handler table.
pub trait Role: Send + Sized + 'static {
    fn id(&self) -> RoleId;

    fn handlers(&self) -> &'static [(Code, Handler<Self>)];

    /// Sees every set before its codes are dispatched.
    fn received(&mut self, _ctx: &mut RoleCtx<'_>) {}

    /// Runs once per loop iteration, whether or not a set arrived.
    fn tick(&mut self, _ctx: &mut RoleCtx<'_>) {}

    /// Runs once after the loop stops.
    fn finish(&mut self) {}
}

/// Outcome of dispatching one code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler: the code was meant for another role
    Unhandled,
    /// The handler returned an error and `ERR` was sent back
    Failed,
    /// The handler panicked
    Faulted,
}

/// What a handler can see and do.
pub struct RoleCtx<'a> {
    id: RoleId,
    request: &'a CommandSet,
    out: &'a dyn Broadcast,
    stop: &'a AtomicBool,
}

impl<'a> RoleCtx<'a> {
    pub fn new(
        id: RoleId,
        request: &'a CommandSet,
        out: &'a dyn Broadcast,
        stop: &'a AtomicBool,
    ) -> Self {
        Self {
            id,
            request,
            out,
            stop,
        }
    }

    pub fn id(&self) -> RoleId {
        self.id
    }

    /// Who sent the set being handled.
    pub fn source(&self) -> RoleId {
        self.request.source()
    }

    /// The whole set being handled.
    pub fn request(&self) -> &CommandSet {
        self.request
    }

    /// Answer the requester. Goes to everyone if the requester is unknown.
    pub fn reply(&self, mut cmd: CommandSet) -> Delivery {
        cmd.set_source(self.id);
        let source = self.source();
        if source != RoleId::Unidentified && source != self.id {
            cmd.set_destination(&[source]);
        }
        self.out.send_to_all(&cmd)
    }

    /// Reply with a single code.
    pub fn reply_with(&self, code: Code, value: impl Into<Value>) -> Delivery {
        self.reply(CommandSet::new().with(code, value))
    }

    /// Send to every role and peer except ourselves, keeping any `DST` the set carries.
    pub fn announce(&self, mut cmd: CommandSet) -> Delivery {
        cmd.set_source(self.id);
        self.out.send_to_all(&cmd)
    }

    /// Ask this role's loop to stop after the current set.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Dispatch every code of `cmd` to `role`.
///
/// Faults are contained per code, so the rest of the set still runs.
pub fn dispatch<R: Role>(
    role: &mut R,
    cmd: &CommandSet,
    out: &dyn Broadcast,
    stop: &AtomicBool,
) -> Vec<(Code, Dispatch)> {
    let id = role.id();
    let table = role.handlers();
    let mut ctx = RoleCtx::new(id, cmd, out, stop);
    role.received(&mut ctx);

    let mut outcomes = Vec::with_capacity(cmd.len());
    for (code, value) in cmd.iter() {
        if matches!(code, Code::IDN | Code::DST) {
            continue;
        }
        let Some((_, handler)) = table.iter().find(|(c, _)| *c == code) else {
            trace!("{id} has no handler for {code}");
            outcomes.push((code, Dispatch::Unhandled));
            continue;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| handler(role, &mut ctx, value))) {
            Ok(Ok(())) => Dispatch::Handled,
            Ok(Err(e)) => {
                warn!("{id} could not act on {code} {value:?} from {}: {e}", ctx.source());
                ctx.reply_with(Code::ERR, vec![code.as_str().to_owned()]);
                Dispatch::Failed
            }
            Err(_) => {
                error!("{id} handler for {code} panicked");
                Dispatch::Faulted
            }
        };
        outcomes.push((code, outcome));
    }
    outcomes
}

/// Shared view of a role worker's state.
#[derive(Debug, Default)]
pub struct RoleStatus {
    working: AtomicBool,
    stop: AtomicBool,
}

impl RoleStatus {
    /// Whether the dispatch loop is still running.
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// A role running on its own thread.
pub struct RoleHandle {
    id: RoleId,
    status: Arc<RoleStatus>,
    thread: JoinHandle<()>,
}

impl RoleHandle {
    /// Start `role`'s dispatch loop on a named thread.
    pub fn spawn<R: Role>(
        mut role: R,
        inbound: Receiver<CommandSet>,
        out: Arc<dyn Broadcast>,
        poll: Duration,
    ) -> std::io::Result<Self> {
        let id = role.id();
        let status = Arc::new(RoleStatus::default());
        // Working from the moment of spawn, so a shutdown never sees a not-yet-started role as idle
        status.working.store(true, Ordering::Release);

        let thread_status = status.clone();
        let thread = Builder::new()
            .name(format!("role-{}", id.tag().to_lowercase()))
            .spawn(move || {
                run(&mut role, &inbound, &*out, &thread_status, poll);
                role.finish();
                thread_status.working.store(false, Ordering::Release);
                info!("{id} dispatcher stopped");
            });

        match thread {
            Ok(thread) => Ok(Self { id, status, thread }),
            Err(e) => {
                status.working.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn id(&self) -> RoleId {
        self.id
    }

    pub fn status(&self) -> &Arc<RoleStatus> {
        &self.status
    }

    pub fn stop(&self) {
        self.status.request_stop();
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("{} dispatcher thread panicked", self.id);
        }
    }
}

fn run<R: Role>(
    role: &mut R,
    inbound: &Receiver<CommandSet>,
    out: &dyn Broadcast,
    status: &RoleStatus,
    poll: Duration,
) {
    let id = role.id();
    let idle = CommandSet::new();
    info!("{id} dispatcher running");

    while !status.stop.load(Ordering::Acquire) {
        match inbound.recv_timeout(poll) {
            Ok(cmd) => {
                debug!("{id} received {cmd:?}");
                dispatch(role, &cmd, out, &status.stop);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let mut ctx = RoleCtx::new(id, &idle, out, &status.stop);
        role.tick(&mut ctx);
    }
}
