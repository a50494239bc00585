//! RFCOMM stream sockets.
//!
//! [`Listener`] owns a bound, listening socket and runs the accept state
//! machine; [`Endpoint`] is one connected byte stream. Both sit on tokio's
//! `AsyncFd`, so the only suspension points are descriptor readiness waits.

use std::{
   future::Future,
   io,
   os::fd::{AsFd, OwnedFd},
   sync::atomic::{AtomicBool, Ordering},
};

use bluer::Address;
use log::{debug, info, warn};
use tokio::io::unix::AsyncFd;

use super::sys::{self, SockAddrRc};
use crate::error::{BtError, Result};

/// Channel the service listens on unless configured otherwise.
pub const DEFAULT_CHANNEL: u8 = 29;
pub const MAX_CHANNEL: u8 = 30;

pub fn validate_channel(channel: u8) -> Result<u8> {
   if (1..=MAX_CHANNEL).contains(&channel) {
      Ok(channel)
   } else {
      Err(BtError::InvalidArgument(format!(
         "RFCOMM channel must be 1-{MAX_CHANNEL}, got {channel}"
      )))
   }
}

/// Best-effort release of descriptors the process no longer needs.
///
/// Invoked once before retrying an operation that failed because the
/// descriptor table was full. Returns how many descriptors were released.
pub trait Reclaim: Send + Sync {
   fn reclaim(&self) -> impl Future<Output = usize> + Send;
}

/// Reclamation that has nothing to release.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReclaim;

impl Reclaim for NoReclaim {
   async fn reclaim(&self) -> usize {
      0
   }
}

/// States of one accept call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptState {
   /// Blocked until a connection is pending.
   Waiting,
   /// The exhaustion retry has been spent.
   Retrying,
   Accepted,
   Failed,
}

impl AcceptState {
   /// State after an accept attempt made while in `self`.
   pub fn advance<T>(self, attempt: &io::Result<T>) -> Self {
      match attempt {
         Ok(_) => Self::Accepted,
         Err(e) if sys::is_fd_exhaustion(e) => match self {
            Self::Waiting => Self::Retrying,
            _ => Self::Failed,
         },
         Err(e) if e.kind() == io::ErrorKind::Interrupted => Self::Waiting,
         Err(_) => Self::Failed,
      }
   }
}

/// One readiness wait plus one accept attempt.
pub(crate) trait AcceptSource: Sync {
   type Conn: Send;

   fn attempt(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

fn accept_error(err: io::Error) -> BtError {
   if err.kind() == io::ErrorKind::WouldBlock {
      BtError::WouldBlock
   } else {
      BtError::transport("accept", err)
   }
}

/// Drives `source` until a connection is accepted or the attempt fails for good.
///
/// Descriptor exhaustion triggers one reclamation and one retry; a second
/// exhaustion fails. Interruption returns to waiting and restores the retry.
pub(crate) async fn accept_loop<S, R>(source: &S, reclaim: &R) -> Result<S::Conn>
where
   S: AcceptSource,
   R: Reclaim,
{
   let mut state = AcceptState::Waiting;
   loop {
      let attempt = source.attempt().await;
      state = state.advance(&attempt);
      let err = match attempt {
         Ok(conn) => return Ok(conn),
         Err(err) => err,
      };

      match state {
         AcceptState::Retrying => {
            let released = reclaim.reclaim().await;
            warn!("Descriptor table full during accept ({err}), released {released}, retrying");
         },
         AcceptState::Waiting => {
            debug!("Accept interrupted, waiting again");
         },
         AcceptState::Accepted | AcceptState::Failed => return Err(accept_error(err)),
      }
   }
}

/// Creates an RFCOMM stream socket, retrying once after reclamation when the
/// descriptor table is full.
async fn open_socket<R: Reclaim>(reclaim: &R) -> Result<OwnedFd> {
   let open = || sys::socket(libc::SOCK_STREAM | libc::SOCK_NONBLOCK, sys::BTPROTO_RFCOMM);
   match open() {
      Ok(fd) => Ok(fd),
      Err(e) if sys::is_fd_exhaustion(&e) => {
         let released = reclaim.reclaim().await;
         warn!("Descriptor table full creating socket ({e}), released {released}, retrying");
         open().map_err(|e| BtError::transport("socket", e))
      },
      Err(e) => Err(BtError::transport("socket", e)),
   }
}

/// An unbound RFCOMM socket.
#[derive(Debug)]
pub struct Socket {
   fd: OwnedFd,
}

impl Socket {
   pub async fn new<R: Reclaim>(reclaim: &R) -> Result<Self> {
      Ok(Self {
         fd: open_socket(reclaim).await?,
      })
   }

   /// Binds to any local adapter on `channel`.
   pub fn bind(self, channel: u8) -> Result<BoundSocket> {
      let channel = validate_channel(channel)?;
      sys::bind(self.fd.as_fd(), &SockAddrRc::new(Address::any(), channel))
         .map_err(|e| BtError::transport("bind", e))?;
      Ok(BoundSocket {
         fd: self.fd,
         channel,
      })
   }
}

#[derive(Debug)]
pub struct BoundSocket {
   fd: OwnedFd,
   channel: u8,
}

impl BoundSocket {
   /// Starts listening. `backlog` reaches the kernel unmodified.
   pub fn listen<R: Reclaim>(self, backlog: i32, reclaim: R) -> Result<Listener<R>> {
      sys::listen(self.fd.as_fd(), backlog).map_err(|e| BtError::transport("listen", e))?;
      Ok(Listener {
         fd: AsyncFd::new(self.fd)?,
         channel: self.channel,
         nonblocking: AtomicBool::new(false),
         reclaim,
      })
   }
}

/// A listening RFCOMM socket.
pub struct Listener<R: Reclaim = NoReclaim> {
   fd: AsyncFd<OwnedFd>,
   channel: u8,
   nonblocking: AtomicBool,
   reclaim: R,
}

struct ListenerSource<'a, R: Reclaim>(&'a Listener<R>);

impl<R: Reclaim> AcceptSource for ListenerSource<'_, R> {
   type Conn = (OwnedFd, SockAddrRc);

   async fn attempt(&self) -> io::Result<Self::Conn> {
      let listener = self.0;
      if listener.nonblocking.load(Ordering::Relaxed) {
         return sys::accept_rc(listener.fd.get_ref().as_fd());
      }
      loop {
         let mut guard = listener.fd.readable().await?;
         match guard.try_io(|fd| sys::accept_rc(fd.get_ref().as_fd())) {
            Ok(result) => return result,
            Err(_would_block) => continue,
         }
      }
   }
}

impl<R: Reclaim> Listener<R> {
   /// Creates, binds and listens in one step.
   pub async fn bind(channel: u8, backlog: i32, reclaim: R) -> Result<Self> {
      let listener = Socket::new(&reclaim).await?.bind(channel)?.listen(backlog, reclaim)?;
      info!("Listening for RFCOMM connections on channel {channel}");
      Ok(listener)
   }

   pub const fn local_channel(&self) -> u8 {
      self.channel
   }

   /// In non-blocking mode `accept` returns [`BtError::WouldBlock`] instead of
   /// waiting when nothing is pending.
   pub fn set_nonblocking(&self, nonblocking: bool) {
      self.nonblocking.store(nonblocking, Ordering::Relaxed);
   }

   pub fn is_nonblocking(&self) -> bool {
      self.nonblocking.load(Ordering::Relaxed)
   }

   /// Accepts the next connection.
   pub async fn accept(&self) -> Result<(Endpoint, Address)> {
      let (fd, sa) = accept_loop(&ListenerSource(self), &self.reclaim).await?;
      let peer = sa.address();
      let endpoint = Endpoint::from_fd(fd, peer)?;
      info!("Accepted RFCOMM connection from {peer} on channel {}", self.channel);
      Ok((endpoint, peer))
   }

   pub fn close(self) -> Result<()> {
      sys::close(self.fd.into_inner()).map_err(|e| BtError::transport("close", e))
   }
}

/// A connected RFCOMM stream.
#[derive(Debug)]
pub struct Endpoint {
   fd: AsyncFd<OwnedFd>,
   peer: Address,
}

impl Endpoint {
   pub(crate) fn from_fd(fd: OwnedFd, peer: Address) -> Result<Self> {
      Ok(Self {
         fd: AsyncFd::new(fd)?,
         peer,
      })
   }

   /// Opens an outbound connection to `address` on `channel`.
   pub async fn connect<R: Reclaim>(address: Address, channel: u8, reclaim: &R) -> Result<Self> {
      let channel = validate_channel(channel)?;
      let fd = open_socket(reclaim).await?;
      debug!("Connecting to {address} channel {channel}");
      match sys::connect(fd.as_fd(), &SockAddrRc::new(address, channel)) {
         Ok(()) => {},
         Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {},
         Err(e) => return Err(BtError::transport("connect", e)),
      }

      let endpoint = Self::from_fd(fd, address)?;
      let _ = endpoint.fd.writable().await?;
      if let Some(e) = sys::take_error(endpoint.fd.get_ref().as_fd())? {
         return Err(BtError::transport("connect", e));
      }
      info!("Connected to {address} channel {channel}");
      Ok(endpoint)
   }

   pub const fn peer_address(&self) -> Address {
      self.peer
   }

   /// Reads into `buf`. Returns 0 once the peer has closed its side.
   pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
      loop {
         let mut guard = self.fd.readable().await?;
         match guard.try_io(|fd| sys::recv(fd.get_ref().as_fd(), buf)) {
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
            Ok(result) => return result.map_err(|e| BtError::transport("recv", e)),
            Err(_would_block) => {},
         }
      }
   }

   /// Writes some prefix of `buf` and returns its length.
   pub async fn send(&self, buf: &[u8]) -> Result<usize> {
      loop {
         let mut guard = self.fd.writable().await?;
         match guard.try_io(|fd| sys::send(fd.get_ref().as_fd(), buf)) {
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
            Ok(result) => return result.map_err(|e| BtError::transport("send", e)),
            Err(_would_block) => {},
         }
      }
   }

   pub async fn send_all(&self, mut buf: &[u8]) -> Result<()> {
      while !buf.is_empty() {
         match self.send(buf).await? {
            0 => return Err(BtError::ConnectionClosed),
            n => buf = &buf[n..],
         }
      }
      Ok(())
   }

   /// Shuts down both directions, leaving the descriptor open.
   pub fn shutdown(&self) -> Result<()> {
      match sys::shutdown(self.fd.get_ref().as_fd(), libc::SHUT_RDWR) {
         Err(e) if e.raw_os_error() != Some(libc::ENOTCONN) => Err(BtError::transport("shutdown", e)),
         _ => Ok(()),
      }
   }

   /// Shuts down both directions, then releases the descriptor.
   pub fn close(self) -> Result<()> {
      let shutdown = self.shutdown();
      let fd = self.fd.into_inner();
      if let Err(e) = &shutdown {
         warn!("Shutdown of stream to {} failed: {e}", self.peer);
      }
      sys::close(fd).map_err(|e| BtError::transport("close", e))?;
      debug!("Closed stream to {}", self.peer);
      shutdown
   }
}
