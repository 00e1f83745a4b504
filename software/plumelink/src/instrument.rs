//! Wiring of the master process: server, router, roles, devices and relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{error, info};

use plumelink_shared::{CommandSet, RoleId};

use crate::context::InstrumentCtx;
use crate::dark::DarkCaptureProgress;
use crate::device::{
    Artifact, CameraSettings, MockDevice, RetryPolicy, SpectrometerSettings,
};
use crate::dispatch::{
    Band, CameraRole, ExitReason, ExitSignal, Orchestrator, RoleHandle, Shutdown,
    SpectrometerRole,
};
use crate::error::CommsError;
use crate::relay::ArtifactRelay;
use crate::router::{Broadcast, Delivery, IngressGate, Router};
use crate::socket::{Registry, SocketServer};

/// Mock-up device parameters.
#[derive(Clone, Debug)]
pub struct MockConfig {
    /// Shutter speeds (us) walked by a camera dark sequence
    pub camera_sweep: Vec<i64>,
    /// Integration times (ms) walked by a spectrometer dark sequence
    pub spectrometer_sweep: Vec<i64>,
    pub frame_gap: Duration,
    pub retry: RetryPolicy,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            camera_sweep: vec![1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000],
            spectrometer_sweep: vec![1, 10, 50, 100, 500, 1_000],
            frame_gap: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

/// Which devices the master process hosts.
#[derive(Clone, Debug)]
pub enum Devices {
    /// Orchestrator only
    None,
    /// Both cameras and the spectrometer as software mock-ups
    Mock(MockConfig),
}

/// A running master process.
pub struct Instrument {
    server: Arc<SocketServer>,
    router: Arc<Router>,
    roles: Vec<RoleHandle>,
    devices: Vec<JoinHandle<()>>,
    relay: Option<ArtifactRelay>,
    exit: Arc<ExitSignal>,
}

impl Instrument {
    /// Bind, spawn every worker, then start accepting peers.
    ///
    /// Captured artifacts go to `sink` if one is given.
    pub fn start(
        ctx: &InstrumentCtx,
        devices: Devices,
        sink: Option<Sender<(RoleId, Artifact)>>,
    ) -> Result<Self, CommsError> {
        let registry = Arc::new(Registry::new());
        let dark = Arc::new(DarkCaptureProgress::new());
        let gate = Arc::new(IngressGate::new(dark.clone(), ctx.notification_pause));
        let router = Arc::new(Router::new(registry.clone(), gate.clone()));
        let server = Arc::new(SocketServer::bind(ctx, registry.clone())?);
        let out: Arc<dyn Broadcast> = router.clone();

        let mut roles = Vec::new();
        let mut threads = Vec::new();
        let mut sources = Vec::new();

        if let Devices::Mock(mock) = devices {
            for band in [Band::A, Band::B] {
                let name = match band {
                    Band::A => "cam_a",
                    Band::B => "cam_b",
                };
                let device = MockDevice::spawn(
                    name,
                    CameraSettings::default(),
                    true,
                    mock.camera_sweep.clone(),
                    mock.frame_gap,
                    mock.retry,
                )?;
                let inbound = attach(&router, band.role());
                roles.push(RoleHandle::spawn(
                    CameraRole::new(band, device.link),
                    inbound,
                    out.clone(),
                    ctx.dispatch_poll,
                )?);
                sources.push((band.role(), device.artifacts));
                threads.push(device.thread);
            }

            let device = MockDevice::spawn(
                "spec",
                SpectrometerSettings::default(),
                false,
                mock.spectrometer_sweep.clone(),
                mock.frame_gap,
                mock.retry,
            )?;
            let inbound = attach(&router, RoleId::Spectrometer);
            roles.push(RoleHandle::spawn(
                SpectrometerRole::new(device.link),
                inbound,
                out.clone(),
                ctx.dispatch_poll,
            )?);
            sources.push((RoleId::Spectrometer, device.artifacts));
            threads.push(device.thread);
        }

        let exit = ExitSignal::new();
        let shutdown = Shutdown::new(
            server.clone(),
            roles.iter().map(|r| r.status().clone()).collect(),
            exit.clone(),
            ctx.drain_pause,
            ctx.shutdown_timeout,
        );
        let orchestrator = Orchestrator::new(registry, dark, shutdown, ctx.exit_when_dark_complete);
        let inbound = attach(&router, RoleId::Orchestrator);
        roles.push(RoleHandle::spawn(
            orchestrator,
            inbound,
            out.clone(),
            ctx.dispatch_poll,
        )?);

        let relay = if sources.is_empty() {
            None
        } else {
            Some(ArtifactRelay::spawn(
                sources,
                out,
                gate,
                sink,
                ctx.dispatch_poll,
            )?)
        };

        server.start(router.clone())?;
        info!("Instrument listening on {}", server.local_addr());

        Ok(Self {
            server,
            router,
            roles,
            devices: threads,
            relay,
            exit,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Send `cmd` to every role and peer it is addressed to, as the orchestrator.
    pub fn command(&self, mut cmd: CommandSet) -> Delivery {
        if !cmd.has_source() {
            cmd.set_source(RoleId::Orchestrator);
        }
        self.router.send_to_all(&cmd)
    }

    /// The exit reason, if the shutdown sequence has already finished.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitReason> {
        self.exit.wait_timeout(timeout)
    }

    /// Block until an exit or restart completes, then join every worker.
    pub fn wait(self) -> ExitReason {
        let reason = self.exit.wait();
        info!("Instrument leaving: {reason:?}");

        for role in &self.roles {
            role.stop();
        }
        for role in self.roles {
            let id = role.id();
            self.router.detach(id);
            role.join();
        }
        for device in self.devices {
            if device.join().is_err() {
                error!("Device thread panicked");
            }
        }
        if let Some(relay) = self.relay {
            relay.join();
        }
        self.server.close_listener();
        self.server.close_connections();
        self.server.join();
        reason
    }
}

fn attach(router: &Router, role: RoleId) -> Receiver<CommandSet> {
    let (tx, rx) = unbounded();
    router.attach(role, tx);
    rx
}
