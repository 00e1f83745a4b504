//! Operation context shared by every part of the instrument.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plumelink_shared::DEFAULT_PORTS;

/// How long and how often to wait for a complete frame.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PollPolicy {
    /// Wait per attempt
    pub interval: Duration,
    /// Empty waits before giving up on this call
    pub attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            attempts: 5,
        }
    }
}

impl PollPolicy {
    /// Total time a read can wait before reporting no frame.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Settings for one run of the instrument.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct InstrumentCtx {
    /// Address the socket server listens on
    pub listen_ip: IpAddr,

    /// Candidate ports, tried in order; port 0 asks the OS for any free port
    pub ports: Vec<u16>,

    /// Connections the server keeps accepting at once
    pub acceptor_slots: usize,

    /// Frame read poll policy
    pub poll: PollPolicy,

    /// Per-port budget for a client connect
    pub connect_timeout: Duration,

    /// Longest a single write may block before the peer is dropped
    pub write_timeout: Duration,

    /// Bounded wait on a role's inbound queue, so stop requests are seen promptly
    pub dispatch_poll: Duration,

    /// Pause between the goodbye broadcast and closing connections
    pub drain_pause: Duration,

    /// Ceiling on waiting for the other roles to go idle during shutdown
    pub shutdown_timeout: Duration,

    /// Artifact notifications are held back this long after a `LOG` request
    pub notification_pause: Duration,

    /// Exit once every dark sequence has completed
    pub exit_when_dark_complete: bool,

    /// Log level directive, overridden by `RUST_LOG`
    pub log_filter: String,

    /// A name for this op, used for the log file
    pub op_name: String,

    /// A directory for the log and the network publication file
    pub op_dir: PathBuf,
}

impl Default for InstrumentCtx {
    fn default() -> Self {
        // Current time to the second, with ':' removed so the name is a valid file name everywhere
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(':', "");
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: DEFAULT_PORTS.to_vec(),
            acceptor_slots: 2,
            poll: PollPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            dispatch_poll: Duration::from_millis(100),
            drain_pause: Duration::from_secs(3),
            shutdown_timeout: Duration::from_secs(5),
            notification_pause: Duration::from_secs(10),
            exit_when_dark_complete: false,
            log_filter: "info".to_owned(),
            op_name,
            op_dir: fs::canonicalize("./").unwrap_or_default(),
        }
    }
}

impl InstrumentCtx {
    /// Read a JSON context file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Unable to read {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("Unable to parse {}: {e}", path.display()))
    }

    /// Write this context as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Unable to serialize context: {e}"))?;
        fs::write(path, text).map_err(|e| format!("Unable to write {}: {e}", path.display()))
    }

    /// A context for loopback tests: any free port, short pauses.
    pub fn loopback() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: vec![0],
            poll: PollPolicy {
                interval: Duration::from_millis(100),
                attempts: 5,
            },
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            dispatch_poll: Duration::from_millis(20),
            drain_pause: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(2),
            notification_pause: Duration::from_millis(500),
            ..Self::default()
        }
    }
}
