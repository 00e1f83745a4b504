//! One live TCP conversation and its framed reader.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, trace};

use plumelink_shared::{codec, CommandSet, FrameBuffer, RoleId};

use crate::context::PollPolicy;
use crate::error::CommsError;

const READ_CHUNK_LEN: usize = 4096;

/// Write timeout until the owner sets its own.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Write half of a connection, shared between the receive worker and
/// anyone broadcasting to it.
///
/// The role is fixed at construction, which happens only after the
/// handshake has identified the peer. Writes are serialized and bounded
/// by a write timeout. Closing goes through a separate handle, so it never
/// waits behind a writer stuck on a peer that stopped reading.
#[derive(Debug)]
pub struct Connection {
    stream: Mutex<TcpStream>,
    control: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    role: RoleId,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream, role: RoleId) -> Result<Self, CommsError> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let control = stream.try_clone()?;
        control.set_write_timeout(Some(DEFAULT_WRITE_TIMEOUT))?;
        Ok(Self {
            stream: Mutex::new(stream),
            control,
            peer,
            local,
            role,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn role(&self) -> RoleId {
        self.role
    }

    /// Bound every later write. A peer that stops reading turns into a write error.
    pub fn set_write_timeout(&self, timeout: Duration) -> Result<(), CommsError> {
        self.control.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write a whole encoded message or fail.
    pub fn write_message(&self, bytes: &[u8]) -> Result<(), CommsError> {
        if self.is_closed() {
            return Err(CommsError::TransportClosed);
        }
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| CommsError::TransportClosed)?;
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    pub fn send(&self, cmd: &CommandSet) -> Result<(), CommsError> {
        self.write_message(&codec::encode(cmd))
    }

    /// Shut the socket down in both directions.
    ///
    /// Returns `false` if it was already closed, in which case nothing is done.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Wakes readers and writers blocked on any clone of this socket
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            trace!("Shutdown of {} reported {e}", self.peer);
        }
        debug!("Closed connection to {} ({})", self.peer, self.role);
        true
    }
}

/// Read half of a connection: accumulates bytes until a terminator arrives.
pub struct FrameReader {
    stream: TcpStream,
    buf: FrameBuffer,
    poll: PollPolicy,
}

impl FrameReader {
    pub fn new(stream: TcpStream, poll: PollPolicy) -> Result<Self, CommsError> {
        stream.set_read_timeout(Some(poll.interval))?;
        Ok(Self {
            stream,
            buf: FrameBuffer::new(),
            poll,
        })
    }

    /// Wait for the next frame.
    ///
    /// `Ok(None)` means no terminator arrived within the poll budget and
    /// the caller should call again. A zero-length read means the peer
    /// has gone and yields [`CommsError::TransportClosed`].
    pub fn read_frame(&mut self) -> Result<Option<String>, CommsError> {
        let mut chunk = [0_u8; READ_CHUNK_LEN];
        let mut empty_waits = 0;

        while !self.buf.has_frame() {
            if empty_waits >= self.poll.attempts {
                return Ok(None);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(CommsError::TransportClosed),
                Ok(n) => self.buf.extend(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    empty_waits += 1;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    let err = CommsError::Io(e);
                    return Err(if err.is_closed() {
                        CommsError::TransportClosed
                    } else {
                        err
                    });
                }
            }
        }

        Ok(self.buf.next_frame())
    }

    /// Read one frame and decode it.
    pub fn read_command(&mut self, report_errors: bool) -> Result<Option<CommandSet>, CommsError> {
        Ok(self
            .read_frame()?
            .map(|text| codec::decode(&text, report_errors)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn quick() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(50),
            attempts: 2,
        }
    }

    #[test]
    fn back_to_back_frames_survive_one_read() {
        let (mut client, server) = pair();
        client.write_all(b"HLO 1 END\r\nLOG 0 END\r\n").unwrap();

        let mut reader = FrameReader::new(server, quick()).unwrap();
        assert_eq!(reader.read_frame().unwrap().as_deref(), Some("HLO 1 "));
        assert_eq!(reader.read_frame().unwrap().as_deref(), Some("LOG 0 "));
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn peer_hangup_is_transport_closed() {
        let (client, server) = pair();
        drop(client);
        let mut reader = FrameReader::new(server, quick()).unwrap();
        assert!(matches!(
            reader.read_frame(),
            Err(CommsError::TransportClosed)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (client, server) = pair();
        let conn = Connection::new(server, RoleId::External).unwrap();
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(matches!(
            conn.write_message(b"END\r\n"),
            Err(CommsError::TransportClosed)
        ));

        // The peer sees the shutdown as end of stream
        let mut reader = FrameReader::new(client, quick()).unwrap();
        assert!(matches!(
            reader.read_frame(),
            Err(CommsError::TransportClosed)
        ));
    }

    #[test]
    fn silent_peer_turns_into_a_write_error() {
        let (_silent, server) = pair();
        let conn = Connection::new(server, RoleId::External).unwrap();
        conn.set_write_timeout(Duration::from_millis(200)).unwrap();

        let start = Instant::now();
        assert!(conn.write_message(&vec![b'x'; 64 << 20]).is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn close_does_not_wait_for_a_stuck_writer() {
        let (_silent, server) = pair();
        let conn = Arc::new(Connection::new(server, RoleId::External).unwrap());
        conn.set_write_timeout(Duration::from_secs(3)).unwrap();

        let writer = {
            let conn = conn.clone();
            thread::spawn(move || conn.write_message(&vec![b'x'; 64 << 20]))
        };
        thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        assert!(conn.close());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(writer.join().unwrap().is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
