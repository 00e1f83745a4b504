//! External client role (EXN), running on the client side of a link.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use plumelink_shared::{Code, CommandSet, RoleId, Value};

use super::{Handler, HandlerResult, Role, RoleCtx, RoleHandle};
use crate::socket::ClientLink;

const HANDLERS: &[(Code, Handler<ExternalClient>)] = &[
    (Code::GBY, ExternalClient::goodbye),
    (Code::ERR, ExternalClient::error),
    (Code::NIA, ExternalClient::new_image_a),
    (Code::NMA, ExternalClient::new_metadata_a),
    (Code::NIB, ExternalClient::new_image_b),
    (Code::NMB, ExternalClient::new_metadata_b),
    (Code::NIS, ExternalClient::new_spectrum),
];

/// What the application sees from the instrument.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// A new artifact was captured; `path` is its file name on the instrument
    Notification { code: Code, path: String },
    /// Every received set, as decoded
    Message(CommandSet),
}

pub struct ExternalClient {
    link: Arc<ClientLink>,
    events: Sender<ClientEvent>,
}

impl ExternalClient {
    pub fn new(link: Arc<ClientLink>, events: Sender<ClientEvent>) -> Self {
        Self { link, events }
    }

    /// Run the client role on its own thread, fed by the link's inbound queue.
    pub fn spawn(
        link: Arc<ClientLink>,
        events: Sender<ClientEvent>,
        poll: Duration,
    ) -> std::io::Result<RoleHandle> {
        let inbound = link.inbound();
        let out = link.clone();
        RoleHandle::spawn(Self::new(link, events), inbound, out, poll)
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("Client event receiver dropped");
        }
    }

    /// Only the server's goodbye ends the link. Other peers leaving are relayed too.
    fn goodbye(&mut self, ctx: &mut RoleCtx<'_>, _value: &Value) -> HandlerResult {
        if ctx.source() != RoleId::Orchestrator {
            debug!("{} left the network", ctx.source());
            return Ok(());
        }
        info!("Instrument said goodbye; closing link");
        self.link.close();
        ctx.stop();
        Ok(())
    }

    fn error(&mut self, ctx: &mut RoleCtx<'_>, _value: &Value) -> HandlerResult {
        warn!("{} could not act on {:?}", ctx.source(), ctx.request().errors());
        Ok(())
    }

    fn notify(&self, code: Code, value: &Value) -> HandlerResult {
        if let Some(path) = value.as_str() {
            self.emit(ClientEvent::Notification {
                code,
                path: path.to_owned(),
            });
        }
        Ok(())
    }

    fn new_image_a(&mut self, _ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        self.notify(Code::NIA, value)
    }

    fn new_metadata_a(&mut self, _ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        self.notify(Code::NMA, value)
    }

    fn new_image_b(&mut self, _ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        self.notify(Code::NIB, value)
    }

    fn new_metadata_b(&mut self, _ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        self.notify(Code::NMB, value)
    }

    fn new_spectrum(&mut self, _ctx: &mut RoleCtx<'_>, value: &Value) -> HandlerResult {
        self.notify(Code::NIS, value)
    }
}

impl Role for ExternalClient {
    fn id(&self) -> RoleId {
        RoleId::External
    }

    fn handlers(&self) -> &'static [(Code, Handler<Self>)] {
        HANDLERS
    }

    fn received(&mut self, ctx: &mut RoleCtx<'_>) {
        self.emit(ClientEvent::Message(ctx.request().clone()));
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use crossbeam::channel::unbounded;

    use super::*;
    use crate::context::InstrumentCtx;
    use crate::dispatch::testing::exchange;

    #[test]
    fn notifications_and_messages_reach_the_application() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = InstrumentCtx::loopback();
        let link = ClientLink::connect(listener.local_addr().unwrap(), RoleId::External, &ctx, true)
            .unwrap();
        let (_server_side, _) = listener.accept().unwrap();

        let (tx, rx) = unbounded();
        let mut client = ExternalClient::new(Arc::new(link), tx);
        let cmd = CommandSet::from_role(RoleId::Orchestrator)
            .with(Code::NIA, "a.png")
            .with(Code::NMA, "a.json")
            .with(Code::LOG, 0);
        assert!(exchange(&mut client, cmd.clone()).is_empty());

        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Message(cmd));
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::Notification {
                code: Code::NIA,
                path: "a.png".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::Notification {
                code: Code::NMA,
                path: "a.json".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn server_goodbye_closes_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = InstrumentCtx::loopback();
        let link = Arc::new(
            ClientLink::connect(listener.local_addr().unwrap(), RoleId::External, &ctx, true)
                .unwrap(),
        );
        let (_server_side, _) = listener.accept().unwrap();

        let (tx, _rx) = unbounded();
        let mut client = ExternalClient::new(link.clone(), tx);
        exchange(&mut client, CommandSet::from_role(RoleId::Orchestrator).with(Code::GBY, 1));
        assert!(!link.is_connected());
    }

    #[test]
    fn another_peer_leaving_keeps_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = InstrumentCtx::loopback();
        let link = Arc::new(
            ClientLink::connect(listener.local_addr().unwrap(), RoleId::External, &ctx, true)
                .unwrap(),
        );
        let (_server_side, _) = listener.accept().unwrap();

        let (tx, rx) = unbounded();
        let mut client = ExternalClient::new(link.clone(), tx);
        let bye = CommandSet::from_role(RoleId::CameraB).with(Code::GBY, 9);
        exchange(&mut client, bye.clone());
        assert!(link.is_connected());
        assert_eq!(rx.try_recv().unwrap(), ClientEvent::Message(bye));
    }
}
