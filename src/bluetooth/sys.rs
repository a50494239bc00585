//! Raw BlueZ kernel interface.
//!
//! Socket families, ioctl numbers and the `#[repr(C)]` structures shared with
//! the kernel, plus thin wrappers that turn `-1`/`errno` into `io::Result`.

use std::{
   io, mem,
   os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd},
   time::Duration,
};

use bluer::Address;
use libc::{c_int, c_void, socklen_t};

pub const BTPROTO_HCI: c_int = 1;
pub const BTPROTO_RFCOMM: c_int = 3;

pub const SOL_HCI: c_int = 0;
pub const HCI_FILTER: c_int = 2;
pub const HCI_CHANNEL_RAW: u16 = 0;

/// Device flag bit: interface is up.
pub const HCI_UP: u32 = 0;
pub const HCI_MAX_DEV: usize = 16;

const fn ior_int(nr: u32) -> u32 {
   (2 << 30) | ((mem::size_of::<c_int>() as u32) << 16) | ((b'H' as u32) << 8) | nr
}

pub const HCIGETDEVLIST: u32 = ior_int(210);
pub const HCIGETDEVINFO: u32 = ior_int(211);
pub const HCIINQUIRY: u32 = ior_int(240);

/// Converts a kernel `bdaddr_t` (least significant octet first).
pub fn address_from_bdaddr(mut bdaddr: [u8; 6]) -> Address {
   bdaddr.reverse();
   Address::new(bdaddr)
}

/// Converts to a kernel `bdaddr_t` (least significant octet first).
pub fn bdaddr_from_address(address: Address) -> [u8; 6] {
   let mut bdaddr = address.0;
   bdaddr.reverse();
   bdaddr
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockAddrHci {
   pub hci_family: libc::sa_family_t,
   pub hci_dev: u16,
   pub hci_channel: u16,
}

impl SockAddrHci {
   pub const fn raw(dev_id: u16) -> Self {
      Self {
         hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
         hci_dev: dev_id,
         hci_channel: HCI_CHANNEL_RAW,
      }
   }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockAddrRc {
   pub rc_family: libc::sa_family_t,
   pub rc_bdaddr: [u8; 6],
   pub rc_channel: u8,
}

impl SockAddrRc {
   pub fn new(address: Address, channel: u8) -> Self {
      Self {
         rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
         rc_bdaddr: bdaddr_from_address(address),
         rc_channel: channel,
      }
   }

   pub fn address(&self) -> Address {
      address_from_bdaddr(self.rc_bdaddr)
   }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DevReq {
   pub dev_id: u16,
   pub dev_opt: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DevListReq {
   pub dev_num: u16,
   pub dev_req: [DevReq; HCI_MAX_DEV],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DevStats {
   pub err_rx: u32,
   pub err_tx: u32,
   pub cmd_tx: u32,
   pub evt_rx: u32,
   pub acl_tx: u32,
   pub acl_rx: u32,
   pub sco_tx: u32,
   pub sco_rx: u32,
   pub byte_rx: u32,
   pub byte_tx: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DevInfo {
   pub dev_id: u16,
   pub name: [u8; 8],
   pub bdaddr: [u8; 6],
   pub flags: u32,
   pub dev_type: u8,
   pub features: [u8; 8],
   pub pkt_type: u32,
   pub link_policy: u32,
   pub link_mode: u32,
   pub acl_mtu: u16,
   pub acl_pkts: u16,
   pub sco_mtu: u16,
   pub sco_pkts: u16,
   pub stat: DevStats,
}

impl DevInfo {
   pub const fn is_up(&self) -> bool {
      self.flags & (1 << HCI_UP) != 0
   }
}

/// Socket-level HCI packet filter.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HciFilter {
   pub type_mask: u32,
   pub event_mask: [u32; 2],
   pub opcode: u16,
}

impl HciFilter {
   pub const fn set_ptype(&mut self, ptype: u8) {
      self.type_mask |= 1 << (ptype & 31);
   }

   pub const fn set_event(&mut self, event: u8) {
      let bit = event & 63;
      self.event_mask[(bit >> 5) as usize] |= 1 << (bit & 31);
   }

   pub const fn set_opcode(&mut self, opcode: u16) {
      self.opcode = opcode.to_le();
   }
}

/// Plain kernel ABI data: every bit pattern the kernel may write is a valid value.
///
/// # Safety
///
/// Implementors must be integers, byte slices, or `#[repr(C)]` structs made
/// only of such fields.
pub unsafe trait Pod {}

unsafe impl Pod for c_int {}
unsafe impl Pod for [u8] {}
unsafe impl Pod for DevListReq {}
unsafe impl Pod for DevInfo {}
unsafe impl Pod for HciFilter {}

fn cvt(ret: c_int) -> io::Result<c_int> {
   if ret < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(ret)
   }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
   if ret < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(ret as usize)
   }
}

/// Opens an `AF_BLUETOOTH` socket with close-on-exec set.
pub fn socket(ty: c_int, protocol: c_int) -> io::Result<OwnedFd> {
   let fd = cvt(unsafe { libc::socket(libc::AF_BLUETOOTH, ty | libc::SOCK_CLOEXEC, protocol) })?;
   Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn bind<T>(fd: BorrowedFd<'_>, addr: &T) -> io::Result<()> {
   cvt(unsafe {
      libc::bind(
         fd.as_raw_fd(),
         (addr as *const T).cast::<libc::sockaddr>(),
         mem::size_of::<T>() as socklen_t,
      )
   })?;
   Ok(())
}

pub fn connect<T>(fd: BorrowedFd<'_>, addr: &T) -> io::Result<()> {
   cvt(unsafe {
      libc::connect(
         fd.as_raw_fd(),
         (addr as *const T).cast::<libc::sockaddr>(),
         mem::size_of::<T>() as socklen_t,
      )
   })?;
   Ok(())
}

/// Backlog is handed to the kernel as given.
pub fn listen(fd: BorrowedFd<'_>, backlog: c_int) -> io::Result<()> {
   cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
   Ok(())
}

/// Accepts one RFCOMM connection. The new descriptor is non-blocking.
pub fn accept_rc(fd: BorrowedFd<'_>) -> io::Result<(OwnedFd, SockAddrRc)> {
   let mut sa = SockAddrRc::default();
   let mut len = mem::size_of::<SockAddrRc>() as socklen_t;
   let new_fd = cvt(unsafe {
      libc::accept4(
         fd.as_raw_fd(),
         (&raw mut sa).cast::<libc::sockaddr>(),
         &raw mut len,
         libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
      )
   })?;
   Ok((unsafe { OwnedFd::from_raw_fd(new_fd) }, sa))
}

pub fn shutdown(fd: BorrowedFd<'_>, how: c_int) -> io::Result<()> {
   cvt(unsafe { libc::shutdown(fd.as_raw_fd(), how) })?;
   Ok(())
}

/// Closes the descriptor and reports the status `close(2)` returned.
pub fn close(fd: OwnedFd) -> io::Result<()> {
   cvt(unsafe { libc::close(fd.into_raw_fd()) })?;
   Ok(())
}

pub fn recv(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
   cvt_size(unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast::<c_void>(), buf.len(), 0) })
}

pub fn send(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
   cvt_size(unsafe {
      libc::send(
         fd.as_raw_fd(),
         buf.as_ptr().cast::<c_void>(),
         buf.len(),
         libc::MSG_NOSIGNAL,
      )
   })
}

pub fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
   cvt_size(unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast::<c_void>(), buf.len()) })
}

pub fn write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> io::Result<()> {
   while !buf.is_empty() {
      match cvt_size(unsafe {
         libc::write(fd.as_raw_fd(), buf.as_ptr().cast::<c_void>(), buf.len())
      }) {
         Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
         Ok(n) => buf = &buf[n..],
         Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
         Err(e) => return Err(e),
      }
   }
   Ok(())
}

/// Issues an ioctl whose argument is a pointer to `arg`.
pub fn ioctl<T: Pod + ?Sized>(fd: BorrowedFd<'_>, request: u32, arg: &mut T) -> io::Result<c_int> {
   cvt(unsafe {
      libc::ioctl(
         fd.as_raw_fd(),
         request as libc::Ioctl,
         (arg as *mut T).cast::<c_void>(),
      )
   })
}

pub fn getsockopt<T: Pod + Default>(fd: BorrowedFd<'_>, level: c_int, name: c_int) -> io::Result<T> {
   let mut value = T::default();
   let mut len = mem::size_of::<T>() as socklen_t;
   cvt(unsafe {
      libc::getsockopt(
         fd.as_raw_fd(),
         level,
         name,
         (&raw mut value).cast::<c_void>(),
         &raw mut len,
      )
   })?;
   Ok(value)
}

pub fn setsockopt<T: Pod>(fd: BorrowedFd<'_>, level: c_int, name: c_int, value: &T) -> io::Result<()> {
   cvt(unsafe {
      libc::setsockopt(
         fd.as_raw_fd(),
         level,
         name,
         (value as *const T).cast::<c_void>(),
         mem::size_of::<T>() as socklen_t,
      )
   })?;
   Ok(())
}

/// Pending socket error (`SO_ERROR`), if any.
pub fn take_error(fd: BorrowedFd<'_>) -> io::Result<Option<io::Error>> {
   let err: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
   Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
}

/// Waits until `fd` is readable. Returns `false` when `timeout` elapses first.
pub fn poll_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
   let mut pfd = libc::pollfd {
      fd: fd.as_raw_fd(),
      events: libc::POLLIN,
      revents: 0,
   };
   let millis = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
   let n = cvt(unsafe { libc::poll(&raw mut pfd, 1, millis) })?;
   Ok(n > 0)
}

/// True when the error means the process or system descriptor table is full.
pub fn is_fd_exhaustion(err: &io::Error) -> bool {
   matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
}
