//! HCI/RFCOMM D-Bus service.
//!
//! Exposes raw HCI adapter control (names, class of device, discovery) and an
//! RFCOMM connection listener on the session bus.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{hci::Adapter, manager::ConnectionManager};
use dbus::{HciService, OBJECT_PATH};
use event::{ConnectionEvent, EventBus};

mod bluetooth;
mod config;
mod dbus;
mod device;
mod error;
mod event;

use crate::{dbus::HciServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting hcicomm D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration: RFCOMM channel {}, backlog {}",
      config.rfcomm_channel, config.listen_backlog
   );

   // The listener runs without an adapter; adapter methods then report unavailable.
   let adapter = match Adapter::open().await {
      Ok(adapter) => {
         info!("Using adapter hci{}", adapter.dev_id());
         Some(adapter.with_timeouts(config.hci_timeout(), config.remote_name_timeout()))
      },
      Err(e) => {
         warn!("No HCI adapter available: {e}");
         None
      },
   };

   // Create event channel
   let event_bus = EventProcessor::new();

   let connections = ConnectionManager::new(event_bus.clone(), &config).await?;

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.hcicomm")?
      .serve_at(OBJECT_PATH, HciService::new(adapter, connections.clone()))?
      .build()
      .await?;

   info!("hcicomm D-Bus service started at org.hcicomm");

   // Start event processor
   event_bus.spawn_dispatcher(connection.clone()).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down hcicomm service...");

   connections.shutdown().await;

   let iface = connection
      .object_server()
      .interface::<_, HciService>(OBJECT_PATH)
      .await?;
   iface.get_mut().await.close_adapter().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Address, ConnectionEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<(Address, ConnectionEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<HciService>,
      (peer, event): (Address, ConnectionEvent),
   ) -> Result<()> {
      let addr_str = peer.to_string();
      match event {
         ConnectionEvent::ConnectionOpened { inbound } => {
            iface.connection_opened(&addr_str, inbound).await?;
         },
         ConnectionEvent::ConnectionClosed => {
            iface.connection_closed(&addr_str).await?;
         },
         ConnectionEvent::DataReceived(data) => {
            iface.data_received(&addr_str, &hex::encode(&data)).await?;
         },
         ConnectionEvent::SessionError(message) => {
            iface.session_error(&addr_str, &message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, HciService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, peer: Address, event: ConnectionEvent) {
      self.queue.push((peer, event));
      self.notifier.notify_waiters();
   }
}
