//! Device discovery.

use std::io;

use log::{debug, info};

use super::{
   hci::{Adapter, Controller},
   sys,
};
use crate::{
   device::{RemoteDeviceInfo, class::ClassOfDevice},
   error::Result,
};

/// Inquiry length in 1.28 s units.
pub const INQUIRY_LENGTH: u8 = 8;
/// Response cap requested from the controller.
pub const MAX_RESPONSES: u16 = 256;
/// Discard cached results and start a fresh inquiry.
pub const IREQ_CACHE_FLUSH: u16 = 0x0001;
/// General Inquiry Access Code.
pub const GIAC_LAP: [u8; 3] = [0x33, 0x8b, 0x9e];

/// Size of `struct hci_inquiry_req` including trailing padding.
pub const INQUIRY_HEADER_SIZE: usize = 10;
/// Size of one packed `inquiry_info` record.
pub const INQUIRY_INFO_SIZE: usize = 14;
const MAX_RECORDS: usize = 255;

const NUM_RSP_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryRequest {
   pub length: u8,
   pub max_responses: u16,
   pub flags: u16,
}

impl Default for InquiryRequest {
   fn default() -> Self {
      Self {
         length: INQUIRY_LENGTH,
         max_responses: MAX_RESPONSES,
         flags: IREQ_CACHE_FLUSH,
      }
   }
}

impl InquiryRequest {
   /// Builds the ioctl buffer: request header followed by room for every record.
   ///
   /// The kernel's response count is one byte; a cap that does not fit is sent
   /// as 0, which the kernel treats as its own maximum.
   pub fn encode(&self, dev_id: u16) -> Vec<u8> {
      let mut buf = vec![0u8; INQUIRY_HEADER_SIZE + MAX_RECORDS * INQUIRY_INFO_SIZE];
      buf[0..2].copy_from_slice(&dev_id.to_ne_bytes());
      buf[2..4].copy_from_slice(&self.flags.to_ne_bytes());
      buf[4..7].copy_from_slice(&GIAC_LAP);
      buf[7] = self.length;
      buf[NUM_RSP_OFFSET] = u8::try_from(self.max_responses).unwrap_or(0);
      buf
   }
}

/// Decodes a completed inquiry buffer, preserving the controller's order.
pub fn parse_inquiry(buf: &[u8]) -> io::Result<Vec<RemoteDeviceInfo>> {
   let Some(&count) = buf.get(NUM_RSP_OFFSET) else {
      return Err(io::Error::new(io::ErrorKind::InvalidData, "inquiry header truncated"));
   };
   let count = usize::from(count);
   let records = buf.get(INQUIRY_HEADER_SIZE..).unwrap_or_default();
   if records.len() < count * INQUIRY_INFO_SIZE {
      return Err(io::Error::new(
         io::ErrorKind::InvalidData,
         format!("inquiry reported {count} responses but returned {} bytes", records.len()),
      ));
   }

   Ok(records
      .chunks_exact(INQUIRY_INFO_SIZE)
      .take(count)
      .map(|record| {
         let mut bdaddr = [0u8; 6];
         bdaddr.copy_from_slice(&record[0..6]);
         let class = ClassOfDevice([record[9], record[10], record[11]]);
         RemoteDeviceInfo::new(sys::address_from_bdaddr(bdaddr), class)
      })
      .collect())
}

impl<C: Controller> Adapter<C> {
   /// Runs a fresh general inquiry and returns every responding device.
   ///
   /// Fails as a whole; no partial list is returned.
   pub async fn scan(&self) -> Result<Vec<RemoteDeviceInfo>> {
      let req = InquiryRequest::default();
      info!("hci{}: inquiry started", self.dev_id());
      let devices = self
         .run("inquiry", move |ctl| parse_inquiry(&ctl.inquiry(&req)?))
         .await?;
      debug!("hci{}: inquiry found {} devices", self.dev_id(), devices.len());
      Ok(devices)
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::Ordering;

   use bluer::Address;

   use super::*;
   use crate::{bluetooth::hci::sim::SimController, error::BtError};

   fn record(bdaddr: [u8; 6], class: [u8; 3]) -> [u8; INQUIRY_INFO_SIZE] {
      let mut r = [0u8; INQUIRY_INFO_SIZE];
      r[0..6].copy_from_slice(&bdaddr);
      r[6] = 0x01;
      r[9..12].copy_from_slice(&class);
      r[12..14].copy_from_slice(&0x1234u16.to_le_bytes());
      r
   }

   fn filled(records: &[[u8; INQUIRY_INFO_SIZE]]) -> Vec<u8> {
      let mut buf = InquiryRequest::default().encode(0);
      buf[NUM_RSP_OFFSET] = records.len() as u8;
      for (i, r) in records.iter().enumerate() {
         let at = INQUIRY_HEADER_SIZE + i * INQUIRY_INFO_SIZE;
         buf[at..at + INQUIRY_INFO_SIZE].copy_from_slice(r);
      }
      buf
   }

   #[test]
   fn test_request_header() {
      let buf = InquiryRequest::default().encode(3);
      assert_eq!(buf.len(), INQUIRY_HEADER_SIZE + 255 * INQUIRY_INFO_SIZE);
      assert_eq!(&buf[0..2], &3u16.to_ne_bytes());
      assert_eq!(&buf[2..4], &IREQ_CACHE_FLUSH.to_ne_bytes());
      assert_eq!(&buf[4..7], &GIAC_LAP);
      assert_eq!(buf[7], 8);
      // 256 does not fit; 0 asks for the kernel maximum
      assert_eq!(buf[8], 0);

      let small = InquiryRequest {
         max_responses: 10,
         ..InquiryRequest::default()
      };
      assert_eq!(small.encode(0)[8], 10);
   }

   #[test]
   fn test_parse_preserves_order_and_reverses_addresses() {
      let buf = filled(&[
         record([0x13, 0x71, 0xda, 0x7d, 0x1a, 0x00], [0x0c, 0x01, 0x00]),
         record([0x01, 0x00, 0x00, 0x38, 0xc1, 0xa4], [0x0c, 0x02, 0x5a]),
      ]);
      let devices = parse_inquiry(&buf).unwrap();
      assert_eq!(devices.len(), 2);
      assert_eq!(devices[0].address.to_string(), "00:1A:7D:DA:71:13");
      assert_eq!(devices[0].device_class.to_string(), "Computer, Laptop");
      assert_eq!(devices[1].address.to_string(), "A4:C1:38:00:00:01");
      assert_eq!(devices[1].device_class.to_string(), "Phone, Smart phone");
   }

   #[test]
   fn test_parse_empty() {
      assert!(parse_inquiry(&filled(&[])).unwrap().is_empty());
   }

   #[test]
   fn test_parse_truncated_is_error() {
      let mut buf = filled(&[record([1; 6], [0; 3]), record([2; 6], [0; 3])]);
      buf.truncate(INQUIRY_HEADER_SIZE + INQUIRY_INFO_SIZE + 3);
      assert_eq!(parse_inquiry(&buf).unwrap_err().kind(), io::ErrorKind::InvalidData);
      assert!(parse_inquiry(&buf[..5]).is_err());
   }

   #[tokio::test]
   async fn test_scan_through_controller() {
      let adapter = Adapter::with_controller(SimController {
         responses: vec![
            record([0x02, 0, 0, 0, 0, 0], [0x04, 0x04, 0x20]),
            record([0x01, 0, 0, 0, 0, 0], [0x00, 0x07, 0x00]),
         ],
         ..SimController::default()
      });
      let devices = adapter.scan().await.unwrap();
      let addrs: Vec<Address> = devices.iter().map(|d| d.address).collect();
      assert_eq!(
         addrs,
         [
            Address::new([0, 0, 0, 0, 0, 0x02]),
            Address::new([0, 0, 0, 0, 0, 0x01])
         ]
      );
      assert_eq!(devices[0].device_class.major_name(), "Audio/Video");
      assert_eq!(devices[1].device_class.major_name(), "Uncategorized");
   }

   #[tokio::test]
   async fn test_scan_failure_returns_nothing() {
      let adapter = Adapter::with_controller(SimController {
         responses: vec![record([1; 6], [0; 3])],
         ..SimController::default()
      });
      adapter.controller().fail.store(true, Ordering::SeqCst);
      assert!(matches!(
         adapter.scan().await,
         Err(BtError::AdapterUnavailable { op: "inquiry", .. })
      ));
   }
}
