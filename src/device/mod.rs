//! Remote device descriptions produced by inquiry.

pub mod class;

use bluer::Address;
use serde_json::json;

use class::{ClassOfDevice, DeviceClass};

/// One inquiry response, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeviceInfo {
   pub address: Address,
   pub device_class: DeviceClass,
}

impl RemoteDeviceInfo {
   pub fn new(address: Address, class: ClassOfDevice) -> Self {
      Self {
         address,
         device_class: class.decode(),
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "bdaddr": self.address.to_string(),
          "dev_class": self.device_class.to_string(),
      })
   }
}
