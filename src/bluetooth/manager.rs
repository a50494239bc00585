//! RFCOMM connection manager.
//!
//! An actor owns every live session. The accept task feeds it inbound
//! endpoints, outbound connects are adopted the same way, and session pumps
//! report back through a loopback channel when their peer goes away.

use std::{
   collections::HashMap,
   mem,
   sync::Arc,
   time::Duration,
};

use bluer::Address;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use super::{
   rfcomm::{Endpoint, Listener, Reclaim, validate_channel},
   session::{self, PeerClosed, SessionReceiver, SessionSender},
};
use crate::{
   config::Config,
   error::{BtError, Result},
   event::{ConnectionEvent, EventSender},
};

/// Maximum time to wait for an outbound connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum delay between accept attempts after repeated failures
const MAX_ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Time given to session tasks to wind down on shutdown
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Summary of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
   pub address: Address,
   pub inbound: bool,
}

impl ConnectionInfo {
   pub fn to_json(&self) -> serde_json::Value {
      serde_json::json!({
          "address": self.address.to_string(),
          "inbound": self.inbound,
      })
   }
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Endpoint lifecycle
   Adopt(Endpoint, bool, Option<oneshot::Sender<Result<()>>>), // endpoint, inbound, reply
   SessionClosed(Address, u64),                                // address, session id
   Reclaim(oneshot::Sender<usize>),

   // User commands
   Sender(Address, oneshot::Sender<Result<SessionSender>>),
   Disconnect(Address, oneshot::Sender<Result<()>>),
   ListConnections(oneshot::Sender<Vec<ConnectionInfo>>),
   Shutdown(oneshot::Sender<()>),
}

// === Reclamation ===

/// Releases the descriptors of sessions whose peer already hung up.
#[derive(Clone)]
pub struct ManagerReclaim {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl Reclaim for ManagerReclaim {
   async fn reclaim(&self) -> usize {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(ManagerCommand::Reclaim(tx)).await.is_err() {
         return 0;
      }
      rx.await.unwrap_or_default()
   }
}

// === Main Manager ===

/// Handle to the connection manager.
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct ConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   reclaim: ManagerReclaim,
   channel: u8,
}

impl ConnectionManager {
   /// Binds the listener and starts the actor and accept task.
   pub async fn new(event_tx: EventSender, config: &Config) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let reclaim = ManagerReclaim {
         inbox: command_tx.clone(),
      };

      // The actor must be running before bind: socket creation may ask it to reclaim.
      let (actor, accept_shutdown) = ManagerActor::new(event_tx, command_rx);
      tokio::spawn(actor.run());

      let listener = Listener::bind(
         config.rfcomm_channel,
         config.listen_backlog,
         reclaim.clone(),
      )
      .await?;
      listener.set_nonblocking(config.nonblocking_accept);
      let channel = listener.local_channel();
      info!(
         "Listening on RFCOMM channel {channel} ({})",
         if listener.is_nonblocking() { "nonblocking" } else { "blocking" }
      );

      tokio::spawn(accept_task(
         listener,
         command_tx.clone(),
         config.accept_poll_interval(),
         accept_shutdown,
      ));

      Ok(Self {
         inbox: command_tx,
         reclaim,
         channel,
      })
   }

   /// Channel the listener is bound to.
   pub const fn channel(&self) -> u8 {
      self.channel
   }

   /// Opens an outbound session to `address`.
   pub async fn connect(&self, address: Address, channel: u8) -> Result<()> {
      let channel = validate_channel(channel)?;
      let endpoint = time::timeout(
         CONNECT_TIMEOUT,
         Endpoint::connect(address, channel, &self.reclaim),
      )
      .await
      .map_err(|_| BtError::RequestTimeout)??;

      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Adopt(endpoint, false, Some(tx)))
         .await
         .map_err(|_| BtError::ManagerShutdown)?;
      rx.await.map_err(|_| BtError::ManagerShutdown)?
   }

   pub async fn send(&self, address: Address, data: &[u8]) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Sender(address, tx))
         .await
         .map_err(|_| BtError::ManagerShutdown)?;
      let sender = rx.await.map_err(|_| BtError::ManagerShutdown)??;
      sender.send(data).await
   }

   pub async fn disconnect(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Disconnect(address, tx))
         .await
         .map_err(|_| BtError::ManagerShutdown)?;
      rx.await.map_err(|_| BtError::ManagerShutdown)?
   }

   pub async fn connections(&self) -> Vec<ConnectionInfo> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::ListConnections(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   /// Stops the accept task, closes every session and stops the actor.
   pub async fn shutdown(&self) {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(ManagerCommand::Shutdown(tx)).await.is_ok() {
         let _ = rx.await;
      }
   }
}

// === Accept Task ===

async fn accept_task<R: Reclaim>(
   listener: Listener<R>,
   inbox: mpsc::Sender<ManagerCommand>,
   poll_interval: Duration,
   mut shutdown: oneshot::Receiver<()>,
) {
   let mut failures = 0u32;
   loop {
      let accepted = select! {
         result = listener.accept() => result,
         _ = &mut shutdown => break,
      };
      match accepted {
         Ok((endpoint, _peer)) => {
            failures = 0;
            if inbox
               .send(ManagerCommand::Adopt(endpoint, true, None))
               .await
               .is_err()
            {
               break;
            }
         },
         Err(BtError::WouldBlock) => {
            time::sleep(poll_interval).await;
         },
         Err(e) => {
            failures = failures.saturating_add(1);
            let delay = calc_retry_delay(failures);
            error!("Accept on channel {} failed: {e}, retrying in {delay:?}", listener.local_channel());
            time::sleep(delay).await;
         },
      }
   }

   info!("Accept task on channel {} stopping", listener.local_channel());
   if let Err(e) = listener.close() {
      warn!("Failed to close listener: {e}");
   }
}

// === Sessions ===

struct Session {
   id: u64,
   inbound: bool,
   endpoint: Option<Arc<Endpoint>>,
   sender: SessionSender,
   closed: PeerClosed,
   jset: JoinSet<()>,
}

impl Session {
   /// Stops the session tasks, then shuts down and releases the stream.
   async fn close(mut self) -> Result<()> {
      let mut jset = mem::take(&mut self.jset);
      let endpoint = self.endpoint.take();
      let address = self.sender.peer();
      drop(self);

      if time::timeout(SESSION_SHUTDOWN_TIMEOUT, jset.shutdown())
         .await
         .is_err()
      {
         warn!("Session tasks for {address} did not stop in time");
      }

      match endpoint.map(Arc::try_unwrap) {
         Some(Ok(endpoint)) => endpoint.close(),
         Some(Err(_)) => {
            debug!("Stream to {address} still referenced, released on last drop");
            Ok(())
         },
         None => Ok(()),
      }
   }
}

impl Drop for Session {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

// === Manager Actor ===

struct ManagerActor {
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   accept_shutdown: Option<oneshot::Sender<()>>,

   // State
   sessions: HashMap<Address, Session>,
   next_session_id: u64,
}

impl ManagerActor {
   fn new(
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> (Self, oneshot::Receiver<()>) {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (shutdown_tx, shutdown_rx) = oneshot::channel();
      let actor = Self {
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         accept_shutdown: Some(shutdown_tx),
         sessions: HashMap::new(),
         next_session_id: 0,
      };
      (actor, shutdown_rx)
   }

   async fn run(mut self) {
      info!("Connection manager starting up");

      let mut done = None;
      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 match cmd {
                     Some(ManagerCommand::Shutdown(reply)) => {
                         info!("Connection manager shutdown requested");
                         done = Some(reply);
                         break;
                     }
                     Some(cmd) => self.handle_command(cmd).await,
                     None => {
                         info!("Connection manager shutting down");
                         break;
                     }
                 }
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
      if let Some(done) = done {
         let _ = done.send(());
      }
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Adopt(endpoint, inbound, reply) => {
            let result = self.adopt(endpoint, inbound);
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::SessionClosed(addr, id) => {
            self.handle_session_closed(addr, id).await;
         },
         ManagerCommand::Reclaim(reply) => {
            let released = self.reclaim().await;
            let _ = reply.send(released);
         },
         ManagerCommand::Sender(addr, reply) => {
            let result = self
               .sessions
               .get(&addr)
               .map(|session| session.sender.clone())
               .ok_or(BtError::SessionNotFound(addr));
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(addr, reply) => {
            let result = self.disconnect(addr).await;
            let _ = reply.send(result);
         },
         ManagerCommand::ListConnections(reply) => {
            let mut list: Vec<ConnectionInfo> = self
               .sessions
               .iter()
               .map(|(address, session)| ConnectionInfo {
                  address: *address,
                  inbound: session.inbound,
               })
               .collect();
            list.sort_by_key(|info| info.address);
            let _ = reply.send(list);
         },
         ManagerCommand::Shutdown(reply) => {
            // `run` intercepts shutdown; the loopback never carries it.
            self.cleanup().await;
            let _ = reply.send(());
         },
      }
   }

   fn adopt(&mut self, endpoint: Endpoint, inbound: bool) -> Result<()> {
      let addr = endpoint.peer_address();
      if self.sessions.contains_key(&addr) {
         warn!("Rejecting second connection from {addr}");
         if let Err(e) = endpoint.close() {
            debug!("Closing duplicate stream to {addr}: {e}");
         }
         return Err(BtError::AlreadyConnected(addr));
      }

      let id = self.next_session_id;
      self.next_session_id += 1;

      let endpoint = Arc::new(endpoint);
      let mut jset = JoinSet::new();
      let (receiver, sender, closed) = session::start(&mut jset, endpoint.clone());
      jset.spawn(pump(
         addr,
         id,
         receiver,
         self.event_tx.clone(),
         self.loopback_tx.clone(),
      ));

      self.sessions.insert(
         addr,
         Session {
            id,
            inbound,
            endpoint: Some(endpoint),
            sender,
            closed,
            jset,
         },
      );
      info!(
         "Session {id} with {addr} established ({})",
         if inbound { "inbound" } else { "outbound" }
      );
      self
         .event_tx
         .emit(addr, ConnectionEvent::ConnectionOpened { inbound });
      Ok(())
   }

   async fn handle_session_closed(&mut self, addr: Address, id: u64) {
      // A newer session may already occupy the address.
      if self.sessions.get(&addr).is_none_or(|s| s.id != id) {
         return;
      }
      if let Some(session) = self.sessions.remove(&addr) {
         self.release(addr, session).await;
      }
   }

   async fn disconnect(&mut self, addr: Address) -> Result<()> {
      let session = self
         .sessions
         .remove(&addr)
         .ok_or(BtError::SessionNotFound(addr))?;
      info!("Disconnecting {addr}");
      self.release(addr, session).await;
      Ok(())
   }

   async fn release(&self, addr: Address, session: Session) {
      if let Err(e) = session.close().await {
         warn!("Closing stream to {addr} failed: {e}");
      }
      self.event_tx.emit(addr, ConnectionEvent::ConnectionClosed);
   }

   /// Drops every session whose peer has already closed its side.
   async fn reclaim(&mut self) -> usize {
      let stale: Vec<Address> = self
         .sessions
         .iter()
         .filter(|(_, session)| session.closed.get())
         .map(|(addr, _)| *addr)
         .collect();

      for addr in &stale {
         if let Some(session) = self.sessions.remove(addr) {
            self.release(*addr, session).await;
         }
      }
      if !stale.is_empty() {
         info!("Reclaimed {} stale sessions", stale.len());
      }
      stale.len()
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up connection manager");
      if let Some(shutdown) = self.accept_shutdown.take() {
         let _ = shutdown.send(());
      }
      for (addr, session) in mem::take(&mut self.sessions) {
         self.release(addr, session).await;
      }
   }
}

/// Forwards received data as events until the session ends.
async fn pump(
   addr: Address,
   id: u64,
   mut receiver: SessionReceiver,
   event_tx: EventSender,
   loopback: mpsc::Sender<ManagerCommand>,
) {
   loop {
      match receiver.recv().await {
         Ok(packet) => event_tx.emit(addr, ConnectionEvent::DataReceived(packet)),
         Err(BtError::ConnectionLost | BtError::ConnectionClosed) => break,
         Err(e) => {
            event_tx.emit(addr, ConnectionEvent::SessionError(SmolStr::new(e.to_string())));
            break;
         },
      }
   }
   if let Err(e) = loopback.send(ManagerCommand::SessionClosed(addr, id)).await {
      warn!("Channel overflow sending session closed: {e}");
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_millis(500);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_ACCEPT_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..250);
   delay + Duration::from_millis(jitter)
}
