//! Per-connection I/O tasks.
//!
//! An [`Endpoint`] is split into a receive task and a send task. Callers hold
//! the returned receiver and a cheaply cloneable sender.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use super::rfcomm::Endpoint;
use crate::error::{BtError, Result};

pub type Packet = SmallVec<[u8; 64]>;

/// Read buffer size; larger than the default RFCOMM MTU.
const RECV_BUFFER_SIZE: usize = 1024;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of a session.
#[derive(Debug)]
pub struct SessionReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl SessionReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(BtError::ConnectionClosed)?
   }
}

/// Sender half of a session. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct SessionSender {
   peer: Address,
   tx: mpsc::Sender<Command>,
}

impl SessionSender {
   pub const fn peer(&self) -> Address {
      self.peer
   }

   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(BtError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| BtError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| BtError::RequestTimeout)?
         .map_err(|_| BtError::ConnectionClosed)?
   }
}

/// Shared view of whether the peer has finished sending.
#[derive(Debug, Clone, Default)]
pub struct PeerClosed(Arc<AtomicBool>);

impl PeerClosed {
   pub fn get(&self) -> bool {
      self.0.load(Ordering::Acquire)
   }

   fn set(&self) {
      self.0.store(true, Ordering::Release);
   }
}

/// Spawns the I/O tasks for `endpoint` into `jset`.
pub fn start(
   jset: &mut JoinSet<()>,
   endpoint: Arc<Endpoint>,
) -> (SessionReceiver, SessionSender, PeerClosed) {
   let peer = endpoint.peer_address();
   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);
   let closed = PeerClosed::default();

   jset.spawn(recv_thread(in_tx, endpoint.clone(), closed.clone()));
   jset.spawn(send_thread(cmd_rx, endpoint));

   (
      SessionReceiver { rx: in_rx },
      SessionSender { peer, tx: cmd_tx },
      closed,
   )
}

async fn recv_thread(tx: mpsc::Sender<Result<Packet>>, ep: Arc<Endpoint>, closed: PeerClosed) {
   let adr = ep.peer_address();
   let mut stack = [0u8; RECV_BUFFER_SIZE];
   loop {
      match ep.recv(&mut stack).await {
         Ok(0) => {
            debug!("{adr} closed the connection");
            closed.set();
            let _ = tx.send(Err(BtError::ConnectionLost)).await;
            return;
         },
         Ok(n) => {
            let recvd = &stack[..n];
            debug!("← {adr}: {}", hex::encode(recvd));
            if let Err(e) = tx.send(Ok(Packet::from_slice(recvd))).await {
               warn!("Failed to forward data from {adr}: {e:?}");
               return;
            }
         },
         Err(e) => {
            warn!("Receive from {adr} failed: {e}");
            closed.set();
            let _ = tx.send(Err(e)).await;
            return;
         },
      }
   }
}

async fn send_thread(mut rx: mpsc::Receiver<Command>, ep: Arc<Endpoint>) {
   let adr = ep.peer_address();
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = ep.send_all(&data).await {
               warn!("Failed to send data to {adr}: {e}");
               let _ = then.send(Err(e));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("Sender for {adr} dropped");
}
