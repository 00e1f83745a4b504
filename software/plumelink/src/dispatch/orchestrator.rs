//! Supervisory role (MAS).

use std::sync::Arc;

use tracing::{debug, info, warn};

use plumelink_shared::{Code, CommandSet, RoleId, Value};

use super::shutdown::{ExitReason, Shutdown};
use super::{int, require, Handler, HandlerError, HandlerResult, Role, RoleCtx};
use crate::dark::DarkCaptureProgress;
use crate::socket::Registry;

const HANDLERS: &[(Code, Handler<Orchestrator>)] = &[
    (Code::HLO, Orchestrator::hello),
    (Code::LOG, Orchestrator::log),
    (Code::LST, Orchestrator::list),
    (Code::GBY, Orchestrator::goodbye),
    (Code::EXT, Orchestrator::exit),
    (Code::DXT, Orchestrator::forced_exit),
    (Code::RST, Orchestrator::restart),
    (Code::DKC, Orchestrator::camera_dark_started),
    (Code::DKS, Orchestrator::spectrometer_dark_started),
    (Code::DFC, Orchestrator::camera_dark_finished),
    (Code::DFS, Orchestrator::spectrometer_dark_finished),
    (Code::ERR, Orchestrator::error),
];

/// Tracks peers and dark capture, and owns the shutdown sequence.
///
/// Never touches a device; anything it wants from another role goes
/// through the router.
pub struct Orchestrator {
    registry: Arc<Registry>,
    dark: Arc<DarkCaptureProgress>,
    shutdown: Shutdown,
    exit_when_dark_complete: bool,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        dark: Arc<DarkCaptureProgress>,
        shutdown: Shutdown,
        exit_when_dark_complete: bool,
    ) -> Self {
        Self {
            registry,
            dark,
            shutdown,
            exit_when_dark_complete,
        }
    }

    fn hello(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if value.as_bool() {
            ctx.reply_with(Code::HLO, false);
        }
        Ok(())
    }

    fn log(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        // Settings dumps come from the device roles
        if int(value)? == 0 {
            ctx.reply_with(Code::LOG, 0);
        }
        Ok(())
    }

    fn list(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        let peers = self
            .registry
            .peers()
            .into_iter()
            .map(|(addr, role)| format!("{addr}/{role}"))
            .collect::<Vec<_>>();
        ctx.reply_with(Code::CNX, peers);
        Ok(())
    }

    fn goodbye(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        let port = u16::try_from(int(value)?).map_err(|_| HandlerError::Rejected)?;
        match self.registry.close_by_port(port) {
            Some(peer) => info!("{} at {peer} said goodbye", ctx.source()),
            None => debug!("Goodbye for port {port} matched no connection"),
        }
        Ok(())
    }

    fn exit(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if !value.as_bool() {
            // A device confirming its own exit
            return if ctx.source().is_device() {
                Ok(())
            } else {
                Err(HandlerError::Rejected)
            };
        }
        let reason = if ctx.request().is_set(Code::RST) {
            ExitReason::Restart
        } else {
            ExitReason::Exit
        };
        info!("Exit requested by {}", ctx.source());
        self.shutdown.run(ctx, reason);
        Ok(())
    }

    fn forced_exit(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        warn!("Forced exit requested by {}", ctx.source());
        self.shutdown.run(ctx, ExitReason::Exit);
        Ok(())
    }

    fn restart(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        require(value)?;
        info!("Restart requested by {}", ctx.source());
        self.shutdown.run(ctx, ExitReason::Restart);
        Ok(())
    }

    fn camera_dark_started(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if !value.as_bool() {
            return Ok(());
        }
        match ctx.source() {
            camera @ (RoleId::CameraA | RoleId::CameraB) => self.dark.start(camera),
            _ => {
                self.dark.start(RoleId::CameraA);
                self.dark.start(RoleId::CameraB);
            }
        }
        Ok(())
    }

    fn spectrometer_dark_started(&mut self, _ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if value.as_bool() {
            self.dark.start(RoleId::Spectrometer);
        }
        Ok(())
    }

    fn camera_dark_finished(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        match ctx.source() {
            camera @ (RoleId::CameraA | RoleId::CameraB) if value.as_bool() => {
                self.dark_finished(ctx, camera);
                Ok(())
            }
            other => {
                debug!("Ignoring DFC from {other}");
                Ok(())
            }
        }
    }

    fn spectrometer_dark_finished(&mut self, ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        if value.as_bool() {
            self.dark_finished(ctx, RoleId::Spectrometer);
        }
        Ok(())
    }

    fn dark_finished(&mut self, ctx: &RoleCtx<'_>, device: RoleId) {
        info!("{device} dark capture finished");
        if self.dark.finish(device) {
            info!("Dark capture complete on every device");
            if self.exit_when_dark_complete {
                self.shutdown.run(ctx, ExitReason::Exit);
            }
        }
    }

    fn error(&mut self, ctx: &mut RoleCtx<'_>, _value: &Value) -> HandlerResult {
        warn!("{} reported errors on {:?}", ctx.source(), ctx.request().errors());
        Ok(())
    }
}

impl Role for Orchestrator {
    fn id(&self) -> RoleId {
        RoleId::Orchestrator
    }

    fn handlers(&self) -> &'static [(Code, Handler<Self>)] {
        HANDLERS
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::time::Duration;

    use super::*;
    use crate::dispatch::shutdown::{Endpoint, ExitSignal, ShutdownPhase};
    use crate::dispatch::testing::exchange;
    use crate::socket::Connection;

    struct Quiet;

    impl Endpoint for Quiet {
        fn close_connections(&self) -> usize {
            0
        }
        fn close_listener(&self) {}
        fn is_idle(&self) -> bool {
            true
        }
    }

    fn orchestrator(exit_when_dark_complete: bool) -> Orchestrator {
        let shutdown = Shutdown::new(
            Arc::new(Quiet),
            Vec::new(),
            ExitSignal::new(),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
        Orchestrator::new(
            Arc::new(Registry::new()),
            Arc::new(DarkCaptureProgress::new()),
            shutdown,
            exit_when_dark_complete,
        )
    }

    fn from(role: RoleId) -> CommandSet {
        CommandSet::from_role(role)
    }

    #[test]
    fn hello_reply_goes_back_to_client() {
        let mut mas = orchestrator(false);
        let sent = exchange(&mut mas, from(RoleId::External).with(Code::HLO, true));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source(), RoleId::Orchestrator);
        assert_eq!(sent[0].get(Code::HLO), Some(&Value::Bool(false)));
        assert_eq!(sent[0].destination(), Some(vec![RoleId::External]));
    }

    #[test]
    fn log_0_is_a_connection_test() {
        let mut mas = orchestrator(false);
        let sent = exchange(&mut mas, from(RoleId::External).with(Code::LOG, 0));
        assert_eq!(sent[0].get(Code::LOG), Some(&Value::Int(0)));
        assert!(exchange(&mut mas, from(RoleId::External).with(Code::LOG, 1)).is_empty());
    }

    #[test]
    fn list_and_goodbye_use_the_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer): (TcpStream, SocketAddr) = listener.accept().unwrap();

        let mut mas = orchestrator(false);
        mas.registry
            .insert(Arc::new(Connection::new(accepted, RoleId::External).unwrap()));

        let sent = exchange(&mut mas, from(RoleId::External).with(Code::LST, true));
        let listed = sent[0].get(Code::CNX).and_then(Value::as_list).unwrap();
        assert_eq!(listed, vec![format!("{peer}/EXN")]);

        let port = client.local_addr().unwrap().port();
        assert!(exchange(&mut mas, from(RoleId::External).with(Code::GBY, port)).is_empty());
        assert!(mas.registry.is_empty());
    }

    #[test]
    fn device_exit_confirmation_is_not_an_error() {
        let mut mas = orchestrator(false);
        assert!(exchange(&mut mas, from(RoleId::CameraA).with(Code::EXT, false)).is_empty());
        let sent = exchange(&mut mas, from(RoleId::External).with(Code::EXT, false));
        assert_eq!(sent[0].errors(), vec![Code::EXT]);
        assert_eq!(mas.shutdown.phase(), ShutdownPhase::Idle);
    }

    #[test]
    fn exit_with_restart_flag_restarts() {
        let mut mas = orchestrator(false);
        let sent = exchange(
            &mut mas,
            from(RoleId::External)
                .with(Code::EXT, true)
                .with(Code::RST, true),
        );
        assert_eq!(sent[0].get(Code::GBY).and_then(Value::as_int), Some(1));
        assert_eq!(mas.shutdown.phase(), ShutdownPhase::Terminated);
        assert_eq!(mas.shutdown.exit_signal().get(), Some(ExitReason::Restart));
    }

    #[test]
    fn dark_progress_is_per_device() {
        let mut mas = orchestrator(false);
        exchange(&mut mas, from(RoleId::External).with(Code::DKC, true));
        assert!(mas.dark.is_device_running(RoleId::CameraA));
        assert!(mas.dark.is_device_running(RoleId::CameraB));
        assert!(mas.dark.is_running());

        exchange(&mut mas, from(RoleId::CameraA).with(Code::DFC, true));
        assert!(!mas.dark.is_device_running(RoleId::CameraA));
        assert!(mas.dark.is_running());

        // DFC from a non-camera cannot clear a camera flag
        exchange(&mut mas, from(RoleId::External).with(Code::DFC, true));
        assert!(mas.dark.is_device_running(RoleId::CameraB));

        exchange(&mut mas, from(RoleId::CameraB).with(Code::DFC, true));
        assert!(!mas.dark.is_running());
        assert_eq!(mas.shutdown.phase(), ShutdownPhase::Idle);
    }

    #[test]
    fn exit_when_dark_complete() {
        let mut mas = orchestrator(true);
        exchange(&mut mas, from(RoleId::Orchestrator).with(Code::DKS, true));
        exchange(&mut mas, from(RoleId::Spectrometer).with(Code::DFS, true));
        assert_eq!(mas.shutdown.phase(), ShutdownPhase::Terminated);
        assert_eq!(mas.shutdown.exit_signal().get(), Some(ExitReason::Exit));
    }
}
