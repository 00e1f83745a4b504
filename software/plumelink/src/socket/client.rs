//! Client side: bounded-time connect, handshake, and a pair of workers
//! that move command sets on and off the socket.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use plumelink_shared::{CommandSet, Code, RoleId};

use crate::context::InstrumentCtx;
use crate::error::CommsError;
use crate::router::{Broadcast, Delivery};

use super::{Connection, FrameReader};

/// Connect to `addr`, giving up after `timeout`.
///
/// The blocking connect runs on a side thread. On timeout the result
/// channel is dropped, so a late connection is discarded by that thread.
pub fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, CommsError> {
    connect_with(addr, timeout, TcpStream::connect)
}

fn connect_with<F>(
    addr: SocketAddr,
    timeout: Duration,
    connect: F,
) -> Result<TcpStream, CommsError>
where
    F: FnOnce(SocketAddr) -> io::Result<TcpStream> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    Builder::new()
        .name(format!("connect-{}", addr.port()))
        .spawn(move || {
            let _ = tx.send(connect(addr));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => Ok(result?),
        Err(RecvTimeoutError::Timeout) => Err(CommsError::ConnectionTimeout { addr }),
        Err(RecvTimeoutError::Disconnected) => Err(CommsError::TransportClosed),
    }
}

/// Try each candidate port in turn until one connects.
pub fn connect_any(ip: IpAddr, ports: &[u16], timeout: Duration) -> Result<TcpStream, CommsError> {
    for &port in ports {
        let addr = SocketAddr::new(ip, port);
        match connect_with_timeout(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => debug!("Connect to {addr} failed: {e}"),
        }
    }
    Err(CommsError::NoPortAvailable {
        ports: ports.to_vec(),
    })
}

/// A connected, handshaken client.
///
/// Outbound sets are queued and written by a send worker; inbound frames
/// are decoded by a receive worker and queued for [`ClientLink::recv_timeout`].
pub struct ClientLink {
    role: RoleId,
    conn: Arc<Connection>,
    outbound: Sender<CommandSet>,
    inbound: Receiver<CommandSet>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientLink {
    /// Connect to a known address.
    pub fn connect(
        addr: SocketAddr,
        role: RoleId,
        ctx: &InstrumentCtx,
        report_errors: bool,
    ) -> Result<Self, CommsError> {
        let stream = connect_with_timeout(addr, ctx.connect_timeout)?;
        Self::establish(stream, role, ctx, report_errors)
    }

    /// Connect to the first candidate port that answers.
    pub fn connect_any(
        ip: IpAddr,
        ports: &[u16],
        role: RoleId,
        ctx: &InstrumentCtx,
        report_errors: bool,
    ) -> Result<Self, CommsError> {
        let stream = connect_any(ip, ports, ctx.connect_timeout)?;
        Self::establish(stream, role, ctx, report_errors)
    }

    fn establish(
        stream: TcpStream,
        role: RoleId,
        ctx: &InstrumentCtx,
        report_errors: bool,
    ) -> Result<Self, CommsError> {
        let poll = ctx.poll;
        stream.set_nodelay(true)?;
        let reader = FrameReader::new(stream.try_clone()?, poll)?;
        let conn = Arc::new(Connection::new(stream, role)?);
        conn.set_write_timeout(ctx.write_timeout)?;

        // Identity goes out before anything else
        conn.send(&CommandSet::from_role(role))?;
        info!("Connected to {} as {role}", conn.peer());

        let (out_tx, out_rx) = unbounded();
        let (in_tx, in_rx) = unbounded();
        let port = conn.local().port();

        let recv_conn = conn.clone();
        let recv = Builder::new()
            .name(format!("client-recv-{port}"))
            .spawn(move || recv_worker(reader, recv_conn, in_tx, report_errors))?;

        let send_conn = conn.clone();
        let interval = poll.interval;
        let send = Builder::new()
            .name(format!("client-send-{port}"))
            .spawn(move || send_worker(send_conn, out_rx, interval))?;

        Ok(Self {
            role,
            conn,
            outbound: out_tx,
            inbound: in_rx,
            workers: Mutex::new(vec![recv, send]),
        })
    }

    pub fn role(&self) -> RoleId {
        self.role
    }

    /// Our own port, which the server knows us by.
    pub fn local_port(&self) -> u16 {
        self.conn.local().port()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.conn.peer()
    }

    pub fn is_connected(&self) -> bool {
        !self.conn.is_closed()
    }

    /// Queue a command set, tagging it with our identity if it has none.
    pub fn send(&self, mut cmd: CommandSet) -> Result<(), CommsError> {
        if !self.is_connected() {
            return Err(CommsError::TransportClosed);
        }
        if !cmd.has_source() {
            cmd.set_source(self.role);
        }
        self.outbound
            .send(cmd)
            .map_err(|_| CommsError::TransportClosed)
    }

    /// Ask the server to drop us right away instead of waiting for a read timeout.
    pub fn goodbye(&self) -> Result<(), CommsError> {
        self.send(CommandSet::from_role(self.role).with(Code::GBY, self.local_port()))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<CommandSet> {
        self.inbound.recv_timeout(timeout).ok()
    }

    /// Receiver for decoded inbound sets, for plugging into a role worker.
    pub fn inbound(&self) -> Receiver<CommandSet> {
        self.inbound.clone()
    }

    /// Shut the socket down and wait for both workers.
    pub fn close(&self) {
        self.conn.close();
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for worker in workers {
            if worker.thread().id() == std::thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                warn!("Client worker panicked");
            }
        }
    }
}

impl Broadcast for ClientLink {
    /// Everything a client sends goes to the server.
    fn send_to_all(&self, cmd: &CommandSet) -> Delivery {
        match self.send(cmd.clone()) {
            Ok(()) => Delivery {
                remote: 1,
                ..Delivery::default()
            },
            Err(_) => Delivery {
                failed: 1,
                ..Delivery::default()
            },
        }
    }
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn recv_worker(
    mut reader: FrameReader,
    conn: Arc<Connection>,
    inbound: Sender<CommandSet>,
    report_errors: bool,
) {
    loop {
        match reader.read_command(report_errors) {
            Ok(Some(cmd)) => {
                if inbound.send(cmd).is_err() {
                    break;
                }
            }
            Ok(None) if conn.is_closed() => break,
            Ok(None) => {}
            Err(e) => {
                if !e.is_closed() {
                    warn!("Client receive failed: {e}");
                }
                break;
            }
        }
    }
    conn.close();
    debug!("Client receive worker for {} exiting", conn.peer());
}

fn send_worker(conn: Arc<Connection>, outbound: Receiver<CommandSet>, interval: Duration) {
    loop {
        match outbound.recv_timeout(interval) {
            Ok(cmd) => {
                if let Err(e) = conn.send(&cmd) {
                    if !e.is_closed() {
                        warn!("Client send failed: {e}");
                    }
                    conn.close();
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) if conn.is_closed() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Client send worker for {} exiting", conn.peer());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn handshake_is_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = InstrumentCtx::loopback();

        let link = ClientLink::connect(addr, RoleId::External, &ctx, true).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        link.send(CommandSet::new().with(Code::HLO, true)).unwrap();

        let mut buf = Vec::new();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut chunk = [0_u8; 64];
        while !buf.ends_with(b"HLO 1 END\r\n") {
            let n = server.read(&mut chunk).unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(buf, b"IDN EXN END\r\nIDN EXN HLO 1 END\r\n".to_vec());
        assert_eq!(
            link.local_port(),
            server.peer_addr().unwrap().port()
        );
    }

    #[test]
    fn falls_through_to_next_port() {
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);
        let live = TcpListener::bind("127.0.0.1:0").unwrap();
        let live_port = live.local_addr().unwrap().port();

        let stream = connect_any(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &[dead_port, live_port],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), live_port);
    }

    #[test]
    fn exhausted_ports_are_reported() {
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);
        assert!(matches!(
            connect_any(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                &[dead_port],
                Duration::from_millis(500)
            ),
            Err(CommsError::NoPortAvailable { .. })
        ));
    }

    #[test]
    fn server_hangup_disconnects_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ctx = InstrumentCtx::loopback();
        let link =
            ClientLink::connect(listener.local_addr().unwrap(), RoleId::External, &ctx, false)
                .unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server);

        let start = std::time::Instant::now();
        while link.is_connected() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!link.is_connected());
        assert!(matches!(
            link.send(CommandSet::new()),
            Err(CommsError::TransportClosed)
        ));
    }

    #[test]
    fn slow_connect_is_a_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let start = std::time::Instant::now();
        let result = connect_with(addr, Duration::from_millis(200), |addr| {
            std::thread::sleep(Duration::from_secs(2));
            TcpStream::connect(addr)
        });
        let waited = start.elapsed();
        assert!(matches!(result, Err(CommsError::ConnectionTimeout { addr: a }) if a == addr));
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_secs(1));
    }
}
