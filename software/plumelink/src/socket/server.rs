//! Listening socket with a small pool of continuously re-arming acceptors.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Builder, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use plumelink_shared::CommandSet;

use crate::context::{InstrumentCtx, PollPolicy};
use crate::error::CommsError;

use super::{Connection, FrameReader, Registry};

/// How often an idle acceptor checks for a stop request.
const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Destination for every command set received by the server.
pub trait Ingress: Send + Sync + 'static {
    fn ingress(&self, cmd: CommandSet);
}

impl<F> Ingress for F
where
    F: Fn(CommandSet) + Send + Sync + 'static,
{
    fn ingress(&self, cmd: CommandSet) {
        self(cmd)
    }
}

/// What an acceptor slot is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Waiting for a peer to connect
    Accepting = 0,
    /// Handshaking with or receiving from a peer
    Active = 1,
    /// Not running
    Closed = 2,
}

#[derive(Debug)]
struct AcceptorSlot {
    state: AtomicU8,
}

impl AcceptorSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Closed as u8),
        }
    }

    fn get(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            0 => SlotState::Accepting,
            1 => SlotState::Active,
            _ => SlotState::Closed,
        }
    }

    fn set(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Server side of the instrument network.
pub struct SocketServer {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<Registry>,
    slots: Vec<Arc<AcceptorSlot>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    poll: PollPolicy,
    write_timeout: Duration,
}

impl SocketServer {
    /// Bind the first candidate port that works.
    pub fn bind(ctx: &InstrumentCtx, registry: Arc<Registry>) -> Result<Self, CommsError> {
        let listener = ctx
            .ports
            .iter()
            .find_map(|&port| match TcpListener::bind((ctx.listen_ip, port)) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    debug!("Unable to bind {}:{port}: {e}", ctx.listen_ip);
                    None
                }
            })
            .ok_or_else(|| CommsError::NoPortAvailable {
                ports: ctx.ports.clone(),
            })?;

        // Nonblocking so acceptors can notice a stop request
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {local_addr}");

        let slots = (0..ctx.acceptor_slots.max(1))
            .map(|_| Arc::new(AcceptorSlot::new()))
            .collect();

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            registry,
            slots,
            threads: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            poll: ctx.poll,
            write_timeout: ctx.write_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start every acceptor slot, handing received commands to `ingress`.
    pub fn start(&self, ingress: Arc<dyn Ingress>) -> Result<(), CommsError> {
        let guard = self
            .listener
            .lock()
            .map_err(|_| CommsError::TransportClosed)?;
        let listener = guard.as_ref().ok_or(CommsError::TransportClosed)?;

        let mut threads = self
            .threads
            .lock()
            .map_err(|_| CommsError::TransportClosed)?;
        for (idx, slot) in self.slots.iter().enumerate() {
            let acceptor = Acceptor {
                idx,
                listener: listener.try_clone()?,
                slot: slot.clone(),
                stop: self.stop.clone(),
                registry: self.registry.clone(),
                ingress: ingress.clone(),
                poll: self.poll,
                write_timeout: self.write_timeout,
            };
            slot.set(SlotState::Accepting);
            let thread = Builder::new()
                .name(format!("acceptor-{idx}"))
                .spawn(move || acceptor.run())?;
            threads.push(thread);
        }

        Ok(())
    }

    /// State of each acceptor slot.
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(|s| s.get()).collect()
    }

    /// Whether every acceptor has stopped.
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|s| s.get() == SlotState::Closed)
    }

    /// Close every accepted connection.
    pub fn close_connections(&self) -> usize {
        self.registry.close_all()
    }

    /// Stop accepting and release the listening socket.
    pub fn close_listener(&self) {
        self.stop.store(true, Ordering::Release);
        if let Ok(mut listener) = self.listener.lock() {
            if listener.take().is_some() {
                info!("Closed listener on {}", self.local_addr);
            }
        }
    }

    /// Wait for every acceptor thread to exit.
    pub fn join(&self) {
        let threads = match self.threads.lock() {
            Ok(mut threads) => std::mem::take(&mut *threads),
            Err(_) => return,
        };
        for thread in threads {
            if thread.join().is_err() {
                warn!("Acceptor thread panicked");
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.close_listener();
        self.close_connections();
    }
}

/// One acceptor slot's worker: accept, handshake, receive, then re-arm.
struct Acceptor {
    idx: usize,
    listener: TcpListener,
    slot: Arc<AcceptorSlot>,
    stop: Arc<AtomicBool>,
    registry: Arc<Registry>,
    ingress: Arc<dyn Ingress>,
    poll: PollPolicy,
    write_timeout: Duration,
}

impl Acceptor {
    fn run(self) {
        while !self.stop.load(Ordering::Acquire) {
            self.slot.set(SlotState::Accepting);
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    warn!("Acceptor {} failed to accept: {e}", self.idx);
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
            };

            self.slot.set(SlotState::Active);
            match handshake(stream, self.poll, self.write_timeout) {
                Ok((conn, reader)) => {
                    info!("Accepted {addr} as {}", conn.role());
                    self.registry.insert(conn.clone());
                    receive_loop(reader, &conn, &*self.ingress);
                    self.registry.close(&conn.peer());
                    info!("Connection to {addr} ({}) ended", conn.role());
                }
                Err(e) => warn!("Rejected {addr}: {e}"),
            }
        }
        self.slot.set(SlotState::Closed);
        debug!("Acceptor {} stopped", self.idx);
    }
}

/// Read the mandatory identity message from a fresh connection.
fn handshake(
    stream: TcpStream,
    poll: PollPolicy,
    write_timeout: Duration,
) -> Result<(Arc<Connection>, FrameReader), CommsError> {
    // Accepted sockets may inherit the listener's nonblocking mode
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let mut reader = FrameReader::new(stream.try_clone()?, poll)?;
    let hello = reader
        .read_command(true)?
        .ok_or_else(|| CommsError::HandshakeFailed("no identity within poll budget".into()))?;
    if !hello.has_source() {
        return Err(CommsError::HandshakeFailed(
            "first message carried no valid IDN".into(),
        ));
    }
    if hello.len() > 1 {
        debug!("Ignoring {} extra codes in handshake", hello.len() - 1);
    }

    let conn = Arc::new(Connection::new(stream, hello.source())?);
    conn.set_write_timeout(write_timeout)?;
    Ok((conn, reader))
}

/// Decode frames until the peer leaves or the connection is closed locally.
fn receive_loop(mut reader: FrameReader, conn: &Connection, ingress: &dyn Ingress) {
    loop {
        match reader.read_command(true) {
            Ok(Some(mut cmd)) => {
                if !cmd.has_source() {
                    cmd.set_source(conn.role());
                }
                debug!("Received from {}: {cmd:?}", conn.peer());
                ingress.ingress(cmd);
            }
            Ok(None) if conn.is_closed() => break,
            Ok(None) => {}
            Err(e) if e.is_closed() => break,
            Err(e) => {
                warn!("Receive from {} failed: {e}", conn.peer());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    use crossbeam::channel::{unbounded, Receiver};
    use plumelink_shared::{Code, RoleId};

    fn server() -> (SocketServer, Receiver<CommandSet>) {
        let ctx = InstrumentCtx::loopback();
        let server = SocketServer::bind(&ctx, Arc::new(Registry::new())).unwrap();
        let (tx, rx) = unbounded();
        server
            .start(Arc::new(move |cmd: CommandSet| {
                let _ = tx.send(cmd);
            }))
            .unwrap();
        (server, rx)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(3) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn first_candidate_port_that_binds_wins() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = InstrumentCtx {
            ports: vec![taken.local_addr().unwrap().port(), 0],
            ..InstrumentCtx::loopback()
        };
        let server = SocketServer::bind(&ctx, Arc::new(Registry::new())).unwrap();
        assert_ne!(server.local_addr(), taken.local_addr().unwrap());
    }

    #[test]
    fn no_port_available() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = InstrumentCtx {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: vec![taken.local_addr().unwrap().port()],
            ..InstrumentCtx::loopback()
        };
        assert!(matches!(
            SocketServer::bind(&ctx, Arc::new(Registry::new())),
            Err(CommsError::NoPortAvailable { .. })
        ));
    }

    #[test]
    fn handshake_registers_and_tags_commands() {
        let (server, rx) = server();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .write_all(b"IDN EXN END\r\nHLO 1 END\r\nSSA 7000000 END\r\n")
            .unwrap();

        let hello = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(hello.source(), RoleId::External);
        assert!(hello.is_set(Code::HLO));

        let bad = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(bad.errors(), vec![Code::SSA]);

        assert!(wait_for(|| server.registry().len() == 1));
        assert_eq!(server.registry().peers()[0].1, RoleId::External);
    }

    #[test]
    fn missing_identity_is_rejected() {
        let (server, rx) = server();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(b"HLO 1 END\r\n").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(server.registry().is_empty());
    }

    #[test]
    fn slots_rearm_after_peer_leaves() {
        let (server, _rx) = server();
        for _ in 0..3 {
            let mut client = TcpStream::connect(server.local_addr()).unwrap();
            client.write_all(b"IDN EXN END\r\n").unwrap();
            assert!(wait_for(|| server.registry().len() == 1));
            drop(client);
            assert!(wait_for(|| server.registry().is_empty()));
        }
        assert!(wait_for(|| server
            .slot_states()
            .iter()
            .all(|s| *s == SlotState::Accepting)));
    }

    #[test]
    fn close_listener_stops_acceptors() {
        let (server, _rx) = server();
        server.close_listener();
        assert!(wait_for(|| server.is_idle()));
        server.join();
    }
}
