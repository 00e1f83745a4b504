//! Terminal and per-op file logging.
//!
//! Both outputs go through non-blocking writers so socket and device
//! threads never stall on a slow terminal or disk. The file output can be
//! moved to another op's log without touching the terminal output.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::{DefaultFields, Format, Full};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};
use tracing_subscriber::{EnvFilter, Registry};

use crate::context::InstrumentCtx;

type OpLogLayer = fmt::Layer<Registry, DefaultFields, Format<Full, ChronoUtc>, NonBlocking>;

static ACTIVE: OnceLock<OpLog> = OnceLock::new();

/// Writer handles for the installed subscriber. Dropping a guard flushes its writer.
pub struct OpLog {
    _terminal: WorkerGuard,
    current: Mutex<(PathBuf, WorkerGuard)>,
    swap: reload::Handle<OpLogLayer, Registry>,
}

impl OpLog {
    /// The log file currently written to.
    pub fn path(&self) -> PathBuf {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .clone()
    }

    /// Send file output to `{op_dir}/logs/{op_name}.log` from now on.
    pub fn redirect(&self, op_dir: &Path, op_name: &str) -> Result<PathBuf, String> {
        let path = log_path(op_dir, op_name);
        let (writer, guard) = tracing_appender::non_blocking(open_log(&path)?);

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        self.swap
            .modify(|layer| *layer = op_log_layer(writer))
            .map_err(|e| format!("Unable to switch log file: {e}"))?;
        // The old guard drops here, after the swap, flushing what the old layer wrote
        *current = (path.clone(), guard);
        Ok(path)
    }
}

fn op_log_layer(writer: NonBlocking) -> OpLogLayer {
    fmt::layer::<Registry>()
        .with_timer(ChronoUtc::rfc_3339())
        .with_thread_names(true)
        .with_writer(writer)
        .with_ansi(false)
}

fn open_log(path: &Path) -> Result<fs::File, String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| format!("Unable to create {}: {e}", dir.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Unable to open {}: {e}", path.display()))
}

/// Where an op's log file lives.
pub fn log_path(op_dir: &Path, op_name: &str) -> PathBuf {
    op_dir.join("logs").join(format!("{op_name}.log"))
}

/// The level filter: `RUST_LOG` if set, otherwise the context's directive.
pub fn log_filter(ctx: &InstrumentCtx) -> Result<EnvFilter, String> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&ctx.log_filter))
        .map_err(|e| format!("Bad log filter `{}`: {e}", ctx.log_filter))
}

/// Log to the terminal and to the op's log file.
///
/// The subscriber is process-wide. A second call (for example a second
/// instrument started in the same process) only redirects the file output.
pub fn init_logging(ctx: &InstrumentCtx) -> Result<&'static OpLog, String> {
    if let Some(active) = ACTIVE.get() {
        active.redirect(&ctx.op_dir, &ctx.op_name)?;
        return Ok(active);
    }

    let path = log_path(&ctx.op_dir, &ctx.op_name);
    let (file_writer, file_guard) = tracing_appender::non_blocking(open_log(&path)?);
    let (term_writer, term_guard) = tracing_appender::non_blocking(io::stdout());
    let (file_layer, swap) = reload::Layer::new(op_log_layer(file_writer));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(log_filter(ctx)?)
        .with(
            fmt::layer()
                .with_timer(ChronoUtc::rfc_3339())
                .with_thread_names(true)
                .with_target(false)
                .with_writer(term_writer),
        )
        .try_init()
        .map_err(|e| format!("Unable to install logger: {e}"))?;

    Ok(ACTIVE.get_or_init(|| OpLog {
        _terminal: term_guard,
        current: Mutex::new((path, file_guard)),
        swap,
    }))
}
