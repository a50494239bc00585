//! HCI adapter control.
//!
//! Commands are written to a raw HCI socket bound to one controller and the
//! matching completion event is read back under a temporary socket filter.
//! The blocking exchange runs on tokio's blocking pool; [`Adapter`] is the
//! async handle the rest of the service uses.

use std::{
   io,
   os::fd::{AsFd, BorrowedFd, OwnedFd},
   sync::Arc,
   time::{Duration, Instant},
};

use bluer::Address;
use log::{debug, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{
   inquiry::InquiryRequest,
   sys::{self, DevInfo, DevListReq, HciFilter, SockAddrHci},
};
use crate::{
   device::class::{ClassOfDevice, DeviceClass},
   error::{BtError, Result},
};

pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;

const OGF_LINK_CTL: u16 = 0x01;
const OGF_HOST_CTL: u16 = 0x03;

const OCF_REMOTE_NAME_REQ: u16 = 0x0019;
const OCF_CHANGE_LOCAL_NAME: u16 = 0x0013;
const OCF_READ_LOCAL_NAME: u16 = 0x0014;
const OCF_READ_CLASS_OF_DEV: u16 = 0x0023;
const OCF_WRITE_CLASS_OF_DEV: u16 = 0x0024;

pub const EVT_REMOTE_NAME_REQ_COMPLETE: u8 = 0x07;
pub const EVT_CMD_COMPLETE: u8 = 0x0e;
pub const EVT_CMD_STATUS: u8 = 0x0f;
pub const EVT_LE_META_EVENT: u8 = 0x3e;

/// Name field size on the wire.
pub const HCI_MAX_NAME_LENGTH: usize = 248;
/// Longest local name accepted by [`Adapter::set_local_name`].
pub const MAX_LOCAL_NAME: usize = 15;

const HCI_MAX_EVENT_SIZE: usize = 260;
const MAX_EVENTS_PER_REQUEST: usize = 10;

/// Completion timeout for class-of-device writes.
pub const WRITE_CLASS_TIMEOUT: Duration = Duration::from_millis(2000);

/// Page scan repetition mode R2.
const PSCAN_REP_MODE_R2: u8 = 0x02;

pub const fn opcode(ogf: u16, ocf: u16) -> u16 {
   (ocf & 0x03ff) | (ogf << 10)
}

/// One HCI command and the event that completes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
   pub opcode: u16,
   pub event: u8,
   pub params: Vec<u8>,
}

impl Request {
   pub fn new(ogf: u16, ocf: u16, event: u8, params: impl Into<Vec<u8>>) -> Self {
      Self {
         opcode: opcode(ogf, ocf),
         event,
         params: params.into(),
      }
   }

   /// Socket filter that lets through only the events this request can complete on.
   pub fn filter(&self) -> HciFilter {
      let mut filter = HciFilter::default();
      filter.set_ptype(HCI_EVENT_PKT);
      filter.set_event(EVT_CMD_STATUS);
      filter.set_event(EVT_CMD_COMPLETE);
      filter.set_event(EVT_LE_META_EVENT);
      filter.set_event(self.event);
      filter.set_opcode(self.opcode);
      filter
   }

   pub fn encode(&self) -> io::Result<heapless::Vec<u8, 259>> {
      let plen = u8::try_from(self.params.len())
         .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "command parameters too long"))?;
      let mut packet = heapless::Vec::new();
      let [lo, hi] = self.opcode.to_le_bytes();
      // capacity covers the 4-byte header plus 255 parameter bytes
      let _ = packet.extend_from_slice(&[HCI_COMMAND_PKT, lo, hi, plen]);
      let _ = packet.extend_from_slice(&self.params);
      Ok(packet)
   }
}

#[derive(Debug)]
pub enum EventMatch {
   /// Not ours; keep reading.
   Ignore,
   /// Completion parameters.
   Done(Vec<u8>),
   Failed(io::Error),
}

/// Classifies one packet read from the socket against a pending request.
pub fn match_event(req: &Request, packet: &[u8]) -> EventMatch {
   let [HCI_EVENT_PKT, evt, plen, body @ ..] = packet else {
      return EventMatch::Ignore;
   };
   let body = &body[..usize::from(*plen).min(body.len())];

   match *evt {
      EVT_CMD_STATUS => {
         let [status, _ncmd, lo, hi, ..] = *body else {
            return EventMatch::Ignore;
         };
         if u16::from_le_bytes([lo, hi]) != req.opcode {
            return EventMatch::Ignore;
         }
         if req.event != EVT_CMD_STATUS {
            if status != 0 {
               return EventMatch::Failed(io::Error::from_raw_os_error(libc::EIO));
            }
            return EventMatch::Ignore;
         }
         EventMatch::Done(vec![status])
      },
      EVT_CMD_COMPLETE => {
         let [_ncmd, lo, hi, ref rest @ ..] = *body else {
            return EventMatch::Ignore;
         };
         if u16::from_le_bytes([lo, hi]) != req.opcode {
            return EventMatch::Ignore;
         }
         EventMatch::Done(rest.to_vec())
      },
      EVT_REMOTE_NAME_REQ_COMPLETE => {
         if req.event != EVT_REMOTE_NAME_REQ_COMPLETE {
            return EventMatch::Ignore;
         }
         match (body.get(1..7), req.params.get(..6)) {
            (Some(got), Some(want)) if got == want => EventMatch::Done(body.to_vec()),
            _ => EventMatch::Ignore,
         }
      },
      // no LE commands are issued
      EVT_LE_META_EVENT => EventMatch::Ignore,
      e if e == req.event => EventMatch::Done(body.to_vec()),
      _ => EventMatch::Ignore,
   }
}

/// Blocking access to one controller.
///
/// Implementations are called from the blocking pool, never from async
/// context.
pub trait Controller: Send + Sync + 'static {
   fn dev_id(&self) -> u16;

   /// Sends `req` and returns the completion parameters.
   fn request(&self, req: &Request, timeout: Option<Duration>) -> io::Result<Vec<u8>>;

   /// Runs an inquiry and returns the kernel's filled-in request buffer.
   fn inquiry(&self, req: &InquiryRequest) -> io::Result<Vec<u8>>;

   fn local_address(&self) -> io::Result<Address>;

   fn close(self) -> io::Result<()>
   where
      Self: Sized;
}

/// Raw HCI socket bound to a controller.
#[derive(Debug)]
pub struct HciSocket {
   dev_id: u16,
   fd: Mutex<OwnedFd>,
}

impl HciSocket {
   pub fn open(dev_id: u16) -> io::Result<Self> {
      let fd = sys::socket(libc::SOCK_RAW, sys::BTPROTO_HCI)?;
      sys::bind(fd.as_fd(), &SockAddrHci::raw(dev_id))?;
      Ok(Self {
         dev_id,
         fd: Mutex::new(fd),
      })
   }
}

impl Controller for HciSocket {
   fn dev_id(&self) -> u16 {
      self.dev_id
   }

   fn request(&self, req: &Request, timeout: Option<Duration>) -> io::Result<Vec<u8>> {
      let fd = self.fd.lock();
      let fd = fd.as_fd();

      let saved: HciFilter = sys::getsockopt(fd, sys::SOL_HCI, sys::HCI_FILTER)?;
      sys::setsockopt(fd, sys::SOL_HCI, sys::HCI_FILTER, &req.filter())?;

      let result = exchange(fd, req, timeout);

      if let Err(e) = sys::setsockopt(fd, sys::SOL_HCI, sys::HCI_FILTER, &saved) {
         warn!("hci{}: failed to restore socket filter: {e}", self.dev_id);
         result?;
         return Err(e);
      }
      result
   }

   fn inquiry(&self, req: &InquiryRequest) -> io::Result<Vec<u8>> {
      let ctl = sys::socket(libc::SOCK_RAW, sys::BTPROTO_HCI)?;
      let mut buf = req.encode(self.dev_id);
      sys::ioctl(ctl.as_fd(), sys::HCIINQUIRY, buf.as_mut_slice())?;
      Ok(buf)
   }

   fn local_address(&self) -> io::Result<Address> {
      let info = device_info(self.fd.lock().as_fd(), self.dev_id)?;
      if !info.is_up() {
         return Err(io::Error::from_raw_os_error(libc::ENETDOWN));
      }
      Ok(sys::address_from_bdaddr(info.bdaddr))
   }

   fn close(self) -> io::Result<()> {
      sys::close(self.fd.into_inner())
   }
}

fn exchange(fd: BorrowedFd<'_>, req: &Request, timeout: Option<Duration>) -> io::Result<Vec<u8>> {
   let packet = req.encode()?;
   debug!("→ hci {:04x}: {}", req.opcode, hex::encode(&packet));
   sys::write_all(fd, &packet)?;

   let deadline = timeout.map(|t| Instant::now() + t);
   let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
   let mut events = 0;
   while events < MAX_EVENTS_PER_REQUEST {
      if let Some(deadline) = deadline {
         let remaining = deadline.saturating_duration_since(Instant::now());
         match sys::poll_readable(fd, remaining) {
            Ok(true) => {},
            Ok(false) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
         }
      }

      let n = match sys::read(fd, &mut buf) {
         Ok(n) => n,
         Err(e)
            if matches!(
               e.kind(),
               io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ) =>
         {
            continue;
         },
         Err(e) => return Err(e),
      };
      events += 1;
      debug!("← hci {:04x}: {}", req.opcode, hex::encode(&buf[..n]));

      match match_event(req, &buf[..n]) {
         EventMatch::Ignore => {},
         EventMatch::Done(params) => return Ok(params),
         EventMatch::Failed(e) => return Err(e),
      }
   }
   Err(io::Error::from_raw_os_error(libc::ETIMEDOUT))
}

pub fn device_info(fd: BorrowedFd<'_>, dev_id: u16) -> io::Result<DevInfo> {
   let mut info = DevInfo {
      dev_id,
      ..DevInfo::default()
   };
   sys::ioctl(fd, sys::HCIGETDEVINFO, &mut info)?;
   Ok(info)
}

/// Picks the controller to use: the first one that is up and has an address
/// assigned, otherwise the first one that is up.
pub fn default_route() -> io::Result<u16> {
   let ctl = sys::socket(libc::SOCK_RAW, sys::BTPROTO_HCI)?;
   let mut list = DevListReq {
      dev_num: sys::HCI_MAX_DEV as u16,
      ..DevListReq::default()
   };
   sys::ioctl(ctl.as_fd(), sys::HCIGETDEVLIST, &mut list)?;

   let count = usize::from(list.dev_num).min(sys::HCI_MAX_DEV);
   let up: SmallVec<[u16; sys::HCI_MAX_DEV]> = list.dev_req[..count]
      .iter()
      .filter(|req| req.dev_opt & (1 << sys::HCI_UP) != 0)
      .map(|req| req.dev_id)
      .collect();

   for &dev_id in &up {
      match device_info(ctl.as_fd(), dev_id) {
         Ok(info) if info.bdaddr != [0; 6] => return Ok(dev_id),
         Ok(_) => {},
         Err(e) => debug!("hci{dev_id}: device info unavailable: {e}"),
      }
   }
   up.first()
      .copied()
      .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))
}

fn check_status(params: &[u8]) -> io::Result<&[u8]> {
   match params.split_first() {
      Some((0, rest)) => Ok(rest),
      _ => Err(io::Error::from_raw_os_error(libc::EIO)),
   }
}

fn decode_name(raw: &[u8]) -> String {
   let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
   String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Handle on one local controller.
///
/// Every system-level failure surfaces as [`BtError::AdapterUnavailable`];
/// argument errors are reported before anything is sent.
pub struct Adapter<C: Controller = HciSocket> {
   dev_id: u16,
   ctl: Arc<C>,
   timeout: Option<Duration>,
   name_timeout: Option<Duration>,
}

impl Adapter<HciSocket> {
   /// Opens the default controller.
   pub async fn open() -> Result<Self> {
      tokio::task::spawn_blocking(|| {
         let dev_id = default_route()?;
         HciSocket::open(dev_id)
      })
      .await
      .map_err(|e| BtError::adapter("open", io::Error::other(e)))?
      .map(Self::with_controller)
      .map_err(|e| BtError::adapter("open", e))
   }
}

impl<C: Controller> Adapter<C> {
   pub fn with_controller(ctl: C) -> Self {
      Self {
         dev_id: ctl.dev_id(),
         ctl: Arc::new(ctl),
         timeout: None,
         name_timeout: None,
      }
   }

   /// Bounds how long command exchanges wait for their completion event.
   #[must_use]
   pub fn with_timeouts(mut self, timeout: Option<Duration>, name_timeout: Option<Duration>) -> Self {
      self.timeout = timeout;
      self.name_timeout = name_timeout;
      self
   }

   pub const fn dev_id(&self) -> u16 {
      self.dev_id
   }

   pub(crate) fn controller(&self) -> Arc<C> {
      Arc::clone(&self.ctl)
   }

   pub(crate) async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
   where
      T: Send + 'static,
      F: FnOnce(&C) -> io::Result<T> + Send + 'static,
   {
      let ctl = self.controller();
      let dev_id = self.dev_id;
      tokio::task::spawn_blocking(move || f(&ctl))
         .await
         .map_err(|e| BtError::adapter(op, io::Error::other(e)))?
         .map_err(|e| {
            debug!("hci{dev_id}: {op} failed: {e}");
            BtError::adapter(op, e)
         })
   }

   pub async fn local_name(&self) -> Result<String> {
      let req = Request::new(OGF_HOST_CTL, OCF_READ_LOCAL_NAME, EVT_CMD_COMPLETE, []);
      let timeout = self.timeout;
      self
         .run("read local name", move |ctl| {
            let params = ctl.request(&req, timeout)?;
            Ok(decode_name(check_status(&params)?))
         })
         .await
   }

   /// Changes the advertised name. Names of 16 bytes or more are rejected.
   pub async fn set_local_name(&self, name: &str) -> Result<String> {
      if name.len() > MAX_LOCAL_NAME {
         return Err(BtError::InvalidArgument(format!(
            "local name must be at most {MAX_LOCAL_NAME} bytes, got {}",
            name.len()
         )));
      }
      if name.as_bytes().contains(&0) {
         return Err(BtError::InvalidArgument("local name contains NUL".into()));
      }

      let mut params = vec![0u8; HCI_MAX_NAME_LENGTH];
      params[..name.len()].copy_from_slice(name.as_bytes());
      let req = Request::new(OGF_HOST_CTL, OCF_CHANGE_LOCAL_NAME, EVT_CMD_COMPLETE, params);
      let timeout = self.timeout;
      self
         .run("write local name", move |ctl| {
            check_status(&ctl.request(&req, timeout)?)?;
            Ok(())
         })
         .await?;
      Ok(name.to_owned())
   }

   pub async fn local_address(&self) -> Result<Address> {
      self.run("read local address", |ctl| ctl.local_address()).await
   }

   pub async fn local_class_raw(&self) -> Result<ClassOfDevice> {
      let req = Request::new(OGF_HOST_CTL, OCF_READ_CLASS_OF_DEV, EVT_CMD_COMPLETE, []);
      let timeout = self.timeout;
      self
         .run("read class of device", move |ctl| {
            let params = ctl.request(&req, timeout)?;
            match *check_status(&params)? {
               [b0, b1, b2, ..] => Ok(ClassOfDevice([b0, b1, b2])),
               _ => Err(io::Error::from_raw_os_error(libc::EIO)),
            }
         })
         .await
   }

   pub async fn local_class(&self) -> Result<DeviceClass> {
      Ok(self.local_class_raw().await?.decode())
   }

   /// Writes the class of device given as exactly six hex digits.
   pub async fn set_local_class(&self, hex: &str) -> Result<bool> {
      let class = ClassOfDevice::from_hex(hex)?;
      let req = Request::new(OGF_HOST_CTL, OCF_WRITE_CLASS_OF_DEV, EVT_CMD_COMPLETE, class.0);
      self
         .run("write class of device", move |ctl| {
            check_status(&ctl.request(&req, Some(WRITE_CLASS_TIMEOUT))?)?;
            Ok(())
         })
         .await?;
      match class.preset_name() {
         Some(preset) => debug!("hci{}: class of device set to {class} ({preset})", self.dev_id),
         None => debug!("hci{}: class of device set to {class}", self.dev_id),
      }
      Ok(true)
   }

   /// Asks a remote device for its user-friendly name.
   pub async fn remote_name(&self, address: Address) -> Result<String> {
      let mut params = Vec::with_capacity(10);
      params.extend_from_slice(&sys::bdaddr_from_address(address));
      params.extend_from_slice(&[PSCAN_REP_MODE_R2, 0, 0, 0]);
      let req = Request::new(
         OGF_LINK_CTL,
         OCF_REMOTE_NAME_REQ,
         EVT_REMOTE_NAME_REQ_COMPLETE,
         params,
      );
      let timeout = self.name_timeout;
      self
         .run("remote name request", move |ctl| {
            let params = ctl.request(&req, timeout)?;
            let rest = check_status(&params)?;
            Ok(decode_name(rest.get(6..).unwrap_or_default()))
         })
         .await
   }

   /// Releases the control socket.
   pub async fn close(self) -> Result<()> {
      let dev_id = self.dev_id;
      match Arc::try_unwrap(self.ctl) {
         Ok(ctl) => tokio::task::spawn_blocking(move || ctl.close())
            .await
            .map_err(|e| BtError::adapter("close", io::Error::other(e)))?
            .map_err(|e| BtError::adapter("close", e)),
         Err(_) => {
            debug!("hci{dev_id}: close deferred until in-flight requests finish");
            Ok(())
         },
      }
   }
}


#[cfg(test)]
mod tests {
   use std::sync::atomic::Ordering;

   use super::{sim::SimController, *};
   use crate::device::class::MajorClass;

   fn adapter() -> Adapter<SimController> {
      Adapter::with_controller(SimController::default())
   }

   #[test]
   fn test_opcode_packing() {
      assert_eq!(opcode(OGF_HOST_CTL, OCF_READ_LOCAL_NAME), 0x0c14);
      assert_eq!(opcode(OGF_HOST_CTL, OCF_WRITE_CLASS_OF_DEV), 0x0c24);
      assert_eq!(opcode(OGF_LINK_CTL, OCF_REMOTE_NAME_REQ), 0x0419);
   }

   #[test]
   fn test_command_encoding() {
      let req = Request::new(OGF_HOST_CTL, OCF_WRITE_CLASS_OF_DEV, EVT_CMD_COMPLETE, [0x0c, 0x01, 0x00]);
      assert_eq!(req.encode().unwrap().as_slice(), &[0x01, 0x24, 0x0c, 0x03, 0x0c, 0x01, 0x00]);

      let empty = Request::new(OGF_HOST_CTL, OCF_READ_LOCAL_NAME, EVT_CMD_COMPLETE, []);
      assert_eq!(empty.encode().unwrap().as_slice(), &[0x01, 0x14, 0x0c, 0x00]);

      let long = Request::new(OGF_HOST_CTL, OCF_CHANGE_LOCAL_NAME, EVT_CMD_COMPLETE, vec![0; 256]);
      assert_eq!(long.encode().unwrap_err().kind(), io::ErrorKind::InvalidInput);
   }

   #[test]
   fn test_filter_admits_completion_events() {
      let req = Request::new(OGF_LINK_CTL, OCF_REMOTE_NAME_REQ, EVT_REMOTE_NAME_REQ_COMPLETE, [0; 10]);
      let filter = req.filter();
      assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
      assert_eq!(
         filter.event_mask[0],
         (1 << EVT_CMD_STATUS) | (1 << EVT_CMD_COMPLETE) | (1 << EVT_REMOTE_NAME_REQ_COMPLETE)
      );
      assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT - 32));
      assert_eq!(u16::from_le(filter.opcode), 0x0419);
   }

   #[test]
   fn test_match_command_complete() {
      let req = Request::new(OGF_HOST_CTL, OCF_READ_CLASS_OF_DEV, EVT_CMD_COMPLETE, []);
      let ours = [0x04, 0x0e, 0x07, 0x01, 0x23, 0x0c, 0x00, 0x0c, 0x01, 0x00];
      assert!(matches!(match_event(&req, &ours), EventMatch::Done(p) if p == [0x00, 0x0c, 0x01, 0x00]));

      let other = [0x04, 0x0e, 0x04, 0x01, 0x14, 0x0c, 0x00];
      assert!(matches!(match_event(&req, &other), EventMatch::Ignore));

      let acl = [0x02, 0x0e, 0x00];
      assert!(matches!(match_event(&req, &acl), EventMatch::Ignore));
   }

   #[test]
   fn test_match_command_status() {
      let req = Request::new(OGF_LINK_CTL, OCF_REMOTE_NAME_REQ, EVT_REMOTE_NAME_REQ_COMPLETE, [0; 10]);
      let pending = [0x04, 0x0f, 0x04, 0x00, 0x01, 0x19, 0x04];
      assert!(matches!(match_event(&req, &pending), EventMatch::Ignore));

      let rejected = [0x04, 0x0f, 0x04, 0x0c, 0x01, 0x19, 0x04];
      match match_event(&req, &rejected) {
         EventMatch::Failed(e) => assert_eq!(e.raw_os_error(), Some(libc::EIO)),
         other => panic!("unexpected {other:?}"),
      }
   }

   #[test]
   fn test_match_remote_name_by_address() {
      let mut params = vec![1, 2, 3, 4, 5, 6];
      params.extend_from_slice(&[PSCAN_REP_MODE_R2, 0, 0, 0]);
      let req = Request::new(OGF_LINK_CTL, OCF_REMOTE_NAME_REQ, EVT_REMOTE_NAME_REQ_COMPLETE, params);

      let mut ours = vec![0x04, 0x07, 0x0b, 0x00, 1, 2, 3, 4, 5, 6, b'a', b'b', 0, 0];
      ours[2] = (ours.len() - 3) as u8;
      assert!(matches!(match_event(&req, &ours), EventMatch::Done(p) if p[7..9] == *b"ab"));

      let theirs = [0x04, 0x07, 0x07, 0x00, 9, 9, 9, 9, 9, 9];
      assert!(matches!(match_event(&req, &theirs), EventMatch::Ignore));
   }

   #[test]
   fn test_decode_name_stops_at_nul() {
      assert_eq!(decode_name(b"hci\0garbage"), "hci");
      assert_eq!(decode_name(b"full"), "full");
   }

   #[tokio::test]
   async fn test_local_name_round_trip() {
      let adapter = adapter();
      assert_eq!(adapter.local_name().await.unwrap(), "sim0");
      assert_eq!(adapter.set_local_name("kitchen-radio").await.unwrap(), "kitchen-radio");
      assert_eq!(adapter.local_name().await.unwrap(), "kitchen-radio");
   }

   #[tokio::test]
   async fn test_set_local_name_length_limit() {
      let adapter = adapter();
      assert!(adapter.set_local_name("exactly15bytes!").await.is_ok());

      let err = adapter.set_local_name("sixteen-bytes-xx").await.unwrap_err();
      assert!(matches!(err, BtError::InvalidArgument(_)));
      let err = adapter.set_local_name("twenty-characters-xx").await.unwrap_err();
      assert!(matches!(err, BtError::InvalidArgument(_)));
      assert_eq!(adapter.local_name().await.unwrap(), "exactly15bytes!");
      let err = adapter.set_local_name("nul\0name").await.unwrap_err();
      assert!(matches!(err, BtError::InvalidArgument(_)));
      assert_eq!(adapter.controller().writes.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_local_class_round_trip() {
      let adapter = adapter();
      let class = adapter.local_class().await.unwrap();
      assert_eq!(class.major(), Some(MajorClass::Computer));
      assert_eq!(class.minor(), "Laptop");

      assert!(adapter.set_local_class("5a020c").await.unwrap());
      assert_eq!(adapter.local_class_raw().await.unwrap(), ClassOfDevice::from_u32(0x5a020c));
      assert_eq!(adapter.local_class().await.unwrap().to_string(), "Phone, Smart phone");
   }

   #[tokio::test]
   async fn test_set_local_class_rejects_bad_hex_without_writing() {
      let adapter = adapter();
      for bad in ["", "12345", "1234567", "zz0000"] {
         let err = adapter.set_local_class(bad).await.unwrap_err();
         assert!(matches!(err, BtError::InvalidArgument(_)), "{bad:?}");
      }
      assert_eq!(adapter.controller().writes.load(Ordering::SeqCst), 0);
      assert_eq!(adapter.controller().requests.load(Ordering::SeqCst), 0);
   }

   #[tokio::test]
   async fn test_failures_are_uniformly_unavailable() {
      let adapter = adapter();
      adapter.controller().fail.store(true, Ordering::SeqCst);

      assert!(matches!(adapter.local_name().await, Err(BtError::AdapterUnavailable { .. })));
      assert!(matches!(adapter.local_address().await, Err(BtError::AdapterUnavailable { .. })));
      assert!(matches!(adapter.local_class().await, Err(BtError::AdapterUnavailable { .. })));
      assert!(matches!(
         adapter.set_local_class("000104").await,
         Err(BtError::AdapterUnavailable { .. })
      ));
   }

   #[tokio::test]
   async fn test_local_address_display() {
      let adapter = adapter();
      assert_eq!(adapter.local_address().await.unwrap().to_string(), "00:1A:7D:DA:71:13");
   }

   #[tokio::test]
   async fn test_remote_name() {
      let peer = Address::new([0xa4, 0xc1, 0x38, 0x00, 0x00, 0x01]);
      let adapter = Adapter::with_controller(SimController {
         remote: vec![(peer, "Headset".into())],
         ..SimController::default()
      });
      assert_eq!(adapter.remote_name(peer).await.unwrap(), "Headset");

      let absent = Address::new([0xa4, 0xc1, 0x38, 0x00, 0x00, 0x02]);
      assert!(matches!(
         adapter.remote_name(absent).await,
         Err(BtError::AdapterUnavailable { .. })
      ));
   }

   #[tokio::test]
   async fn test_close_releases_controller() {
      let ctl = SimController::default();
      let closed = Arc::clone(&ctl.closed);
      let adapter = Adapter::with_controller(ctl);
      adapter.close().await.unwrap();
      assert!(closed.load(Ordering::SeqCst));
   }
}
