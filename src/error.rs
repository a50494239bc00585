//! Error types for the HCI/RFCOMM service.
//!
//! Adapter failures are uniform: whatever the kernel reported, callers only
//! learn that the operation is unavailable. Caller mistakes
//! (`InvalidArgument`, `TypeMismatch`) are rejected before any syscall.

use std::io;

use bluer::Address;
use thiserror::Error;

/// Main error type for the service.
#[derive(Error, Debug)]
pub enum BtError {
   #[error("Adapter operation unavailable: {op}")]
   AdapterUnavailable {
      op: &'static str,
      #[source]
      source: io::Error,
   },

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Type mismatch: expected {0}")]
   TypeMismatch(&'static str),

   #[error("Transport error during {op}: {source}")]
   Transport {
      op: &'static str,
      #[source]
      source: io::Error,
   },

   #[error("No connection pending")]
   WouldBlock,

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] io::Error),

   #[error("No session for {0}")]
   SessionNotFound(Address),

   #[error("Already connected to {0}")]
   AlreadyConnected(Address),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl BtError {
   pub(crate) fn adapter(op: &'static str, source: io::Error) -> Self {
      Self::AdapterUnavailable { op, source }
   }

   pub(crate) fn transport(op: &'static str, source: io::Error) -> Self {
      Self::Transport { op, source }
   }

   /// True for caller mistakes that were rejected before touching the system.
   pub const fn is_caller_error(&self) -> bool {
      matches!(self, Self::InvalidArgument(_) | Self::TypeMismatch(_))
   }
}

/// Convenience type alias for Results with `BtError`.
pub type Result<T> = std::result::Result<T, BtError>;
