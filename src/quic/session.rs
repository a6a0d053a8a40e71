//! Datagram session operations
//!
//! A [`Connection`] never touches a socket. [`DatagramSession`] couples one
//! with something implementing [`DatagramOps`]: it flushes pending
//! transmits, waits for the socket or the next connection timer, and feeds
//! received datagrams back in. [`UdpDatagramOps`] is the plain UDP
//! implementation.

use super::connection::{Connection, Transmit};
use super::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Largest datagram we are prepared to receive
const RECV_BUFFER_SIZE: usize = 65535;

/// Datagram operations trait
///
/// Abstracts the socket so the same driver runs over UDP or an in-memory
/// transport.
pub trait DatagramOps {
    /// Wait until a datagram can be received
    ///
    /// Returns true when the socket is readable, false on timeout
    fn poll(&self, timeout: Option<Duration>) -> Result<bool>;

    /// Receive one datagram
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send one datagram
    fn send_to(&mut self, buf: &[u8], destination: SocketAddr) -> Result<usize>;

    /// Local address of the socket
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// UDP socket operations
pub struct UdpDatagramOps {
    socket: UdpSocket,
}

impl UdpDatagramOps {
    /// Bind a UDP socket with address reuse enabled
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        debug!(%addr, "bound UDP socket");
        Ok(UdpDatagramOps { socket: socket.into() })
    }

    /// Wrap an already bound socket
    pub fn new(socket: UdpSocket) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(UdpDatagramOps { socket })
    }

    /// Get a reference to the underlying socket
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl DatagramOps for UdpDatagramOps {
    fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        use libc::{poll, pollfd, POLLIN};

        let mut pfd = pollfd {
            fd: self.socket.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        };
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, poll_timeout_ms(timeout)) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        Ok(result > 0)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).map_err(Error::from)
    }

    fn send_to(&mut self, buf: &[u8], destination: SocketAddr) -> Result<usize> {
        self.socket.send_to(buf, destination).map_err(Error::from)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::from)
    }
}

/// Milliseconds for `poll(2)`, rounded up so a sub-millisecond timer
/// still sleeps instead of returning at once; `None` waits forever
fn poll_timeout_ms(timeout: Option<Duration>) -> i32 {
    timeout.map_or(-1, |d| {
        let ms = (d.as_micros() + 999) / 1000;
        ms.min(i32::MAX as u128) as i32
    })
}

/// A connection driven over datagram operations
pub struct DatagramSession<S: DatagramOps> {
    ops: S,
    timeout: Option<Duration>,
    buf: Vec<u8>,
}

impl<S: DatagramOps> DatagramSession<S> {
    /// Create a new session
    pub fn new(ops: S) -> Self {
        DatagramSession {
            ops,
            timeout: Some(Duration::from_secs(10)),
            buf: vec![0; RECV_BUFFER_SIZE],
        }
    }

    /// Set the longest a single `drive` call waits for input
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Get the timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Send everything the connection has queued
    pub fn flush(&mut self, conn: &mut Connection, now: Instant) -> Result<usize> {
        let mut sent = 0;
        while let Some(transmit) = conn.poll_transmit(now) {
            self.send(&transmit)?;
            sent += 1;
        }
        Ok(sent)
    }

    fn send(&mut self, transmit: &Transmit) -> Result<()> {
        match self.ops.send_to(&transmit.contents, transmit.destination) {
            Ok(_) => {
                trace!(len = transmit.contents.len(), to = %transmit.destination, "datagram sent");
                Ok(())
            }
            // UDP is lossy anyway; recovery resends
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Run one round: flush, wait for input or the next timer, process
    ///
    /// Returns the number of datagrams received. `Error::Timeout` means
    /// nothing happened within the session timeout and no connection
    /// timer was due.
    pub fn drive(&mut self, conn: &mut Connection) -> Result<usize> {
        self.flush(conn, Instant::now())?;
        if conn.is_closed() {
            return Ok(0);
        }

        let now = Instant::now();
        let timer = conn.next_timeout().map(|at| at.saturating_duration_since(now));
        let wait = match (timer, self.timeout) {
            (Some(t), Some(limit)) => Some(t.min(limit)),
            (t, limit) => t.or(limit),
        };

        let mut received = 0;
        if self.ops.poll(wait)? {
            loop {
                match self.ops.recv_from(&mut self.buf) {
                    Ok((len, from)) => {
                        received += 1;
                        trace!(len, %from, "datagram received");
                        conn.handle_datagram(Instant::now(), from, &self.buf[..len]);
                    }
                    Err(Error::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err),
                }
            }
        }

        let now = Instant::now();
        if conn.next_timeout().map_or(false, |at| at <= now) {
            conn.on_timeout(now);
        } else if received == 0 && timer.map_or(true, |t| self.timeout.map_or(false, |limit| t > limit)) {
            return Err(Error::Timeout);
        }
        self.flush(conn, Instant::now())?;
        Ok(received)
    }

    /// Get a reference to the underlying operations
    pub fn get_ref(&self) -> &S {
        &self.ops
    }

    /// Get a mutable reference to the underlying operations
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.ops
    }
}
