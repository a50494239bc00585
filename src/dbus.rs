use std::io;

use log::{info, warn};
use zbus::{fdo, interface, object_server::SignalEmitter, zvariant};

use crate::{
   bluetooth::{hci::Adapter, manager::ConnectionManager, parse_address},
   error::BtError,
};

pub const OBJECT_PATH: &str = "/org/hcicomm/adapter";

pub struct HciService {
   adapter: Option<Adapter>,
   connections: ConnectionManager,
}

impl HciService {
   pub const fn new(adapter: Option<Adapter>, connections: ConnectionManager) -> Self {
      Self {
         adapter,
         connections,
      }
   }

   /// Releases the adapter; later adapter calls report it unavailable.
   pub async fn close_adapter(&mut self) {
      if let Some(adapter) = self.adapter.take()
         && let Err(e) = adapter.close().await
      {
         warn!("Failed to close adapter: {e}");
      }
   }

   fn adapter(&self) -> fdo::Result<&Adapter> {
      self.adapter.as_ref().ok_or_else(|| {
         to_fdo(BtError::adapter(
            "open",
            io::Error::from_raw_os_error(libc::ENODEV),
         ))
      })
   }
}

/// Caller mistakes become `InvalidArgs`, everything else `Failed`.
fn to_fdo(e: BtError) -> fdo::Error {
   if e.is_caller_error() {
      fdo::Error::InvalidArgs(e.to_string())
   } else {
      fdo::Error::Failed(e.to_string())
   }
}

fn string_arg(value: &zvariant::Value<'_>) -> Result<String, BtError> {
   value
      .downcast_ref::<String>()
      .map_err(|_| BtError::TypeMismatch("string"))
}

#[interface(name = "org.hcicomm.Adapter")]
impl HciService {
   async fn scan(&self) -> fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .adapter()?
         .scan()
         .await
         .map_err(to_fdo)?
         .iter()
         .map(|d| d.to_json())
         .collect();
      Ok(serde_json::Value::Array(devices).to_string())
   }

   async fn local_name(&self) -> fdo::Result<String> {
      self.adapter()?.local_name().await.map_err(to_fdo)
   }

   async fn set_local_name(&self, name: zvariant::Value<'_>) -> fdo::Result<String> {
      let name = string_arg(&name).map_err(to_fdo)?;
      let name = self
         .adapter()?
         .set_local_name(&name)
         .await
         .map_err(to_fdo)?;
      info!("Local name set to {name:?}");
      Ok(name)
   }

   async fn local_address(&self) -> fdo::Result<String> {
      let address = self.adapter()?.local_address().await.map_err(to_fdo)?;
      Ok(address.to_string())
   }

   async fn local_class(&self) -> fdo::Result<String> {
      let class = self.adapter()?.local_class().await.map_err(to_fdo)?;
      Ok(class.to_string())
   }

   async fn set_local_class(&self, class: zvariant::Value<'_>) -> fdo::Result<bool> {
      let class = string_arg(&class).map_err(to_fdo)?;
      self
         .adapter()?
         .set_local_class(&class)
         .await
         .map_err(to_fdo)
   }

   async fn remote_name(&self, address: zvariant::Value<'_>) -> fdo::Result<String> {
      let address = string_arg(&address)
         .and_then(|s| parse_address(&s))
         .map_err(to_fdo)?;
      self
         .adapter()?
         .remote_name(address)
         .await
         .map_err(to_fdo)
   }

   async fn connections(&self) -> String {
      let list: Vec<serde_json::Value> = self
         .connections
         .connections()
         .await
         .iter()
         .map(|c| c.to_json())
         .collect();
      serde_json::Value::Array(list).to_string()
   }

   async fn connect(&self, address: String, channel: u8) -> fdo::Result<bool> {
      let addr = parse_address(&address).map_err(to_fdo)?;
      self
         .connections
         .connect(addr, channel)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn send(&self, address: String, data: String) -> fdo::Result<bool> {
      let addr = parse_address(&address).map_err(to_fdo)?;
      let data = hex::decode(data).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
      self
         .connections
         .send(addr, &data)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn disconnect(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address).map_err(to_fdo)?;
      self.connections.disconnect(addr).await.map_err(to_fdo)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn connection_opened(
      emitter: &SignalEmitter<'_>,
      address: &str,
      inbound: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_closed(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_received(
      emitter: &SignalEmitter<'_>,
      address: &str,
      data: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_error(
      emitter: &SignalEmitter<'_>,
      address: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn channel(&self) -> u8 {
      self.connections.channel()
   }
}
