//! Bluetooth access over raw kernel sockets.
//!
//! HCI adapter control and discovery live in [`hci`] and [`inquiry`];
//! RFCOMM streams in [`rfcomm`], with per-connection tasks in [`session`]
//! and the daemon-level registry in [`manager`].

pub mod hci;
pub mod inquiry;
pub mod manager;
pub mod rfcomm;
pub mod session;
mod sys;

use std::str::FromStr;

use bluer::Address;

use crate::error::{BtError, Result};

/// Parses a colon-separated device address.
pub fn parse_address(s: &str) -> Result<Address> {
   Address::from_str(s).map_err(|e| BtError::InvalidArgument(format!("{s:?}: {e}")))
}
