//! Event handling for connection activity.
//!
//! Connection-level events flow from the session tasks to whatever turns them
//! into D-Bus signals.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::bluetooth::session::Packet;

/// Events that can be emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
   ConnectionOpened { inbound: bool },
   ConnectionClosed,
   DataReceived(Packet),
   SessionError(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, peer: Address, event: ConnectionEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

#[cfg(test)]
pub(crate) mod testing {
   use parking_lot::Mutex;

   use super::*;

   /// Records every emitted event in order.
   #[derive(Default)]
   pub struct RecordingBus {
      pub events: Mutex<Vec<(Address, ConnectionEvent)>>,
   }

   impl EventBus for RecordingBus {
      fn emit(&self, peer: Address, event: ConnectionEvent) {
         self.events.lock().push((peer, event));
      }
   }
}
