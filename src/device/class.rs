//! Class of Device (`CoD`) decoding.
//!
//! Turns the raw 3-byte class field reported by inquiry responses and by the
//! local controller into a `"{major}, {minor}"` description, following the
//! Bluetooth assigned-numbers taxonomy. Decoding is total: anything outside
//! the published tables degrades to a fixed "reserved" description.

use std::fmt;

use smol_str::{SmolStr, format_smolstr};

use crate::error::{BtError, Result};

/// Fallback for any major/minor combination without an assigned name.
pub const UNKNOWN_MINOR: &str = "Unknown (reserved) minor device class";
/// Fallback for major values outside the 8-entry major table (8..=31).
pub const UNKNOWN_MAJOR: &str = "Unknown (reserved) major device class";

/// Major device classes with an entry in the major-name table.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum MajorClass {
   Miscellaneous = 0,
   Computer = 1,
   Phone = 2,
   #[strum(to_string = "LAN Access")]
   LanAccess = 3,
   #[strum(to_string = "Audio/Video")]
   AudioVideo = 4,
   Peripheral = 5,
   Imaging = 6,
   Uncategorized = 7,
}

impl MajorClass {
   pub fn name(self) -> &'static str {
      self.into()
   }
}

const COMPUTER_MINORS: &[&str] = &[
   "Uncategorized",
   "Desktop workstation",
   "Server",
   "Laptop",
   "Handheld",
   "Palm",
   "Wearable",
];

const PHONE_MINORS: &[&str] = &[
   "Uncategorized",
   "Cellular",
   "Cordless",
   "Smart phone",
   "Wired modem or voice gateway",
   "Common ISDN Access",
   "Sim Card Reader",
];

/// Indexed by `minor / 8`.
const LAN_UTILIZATION: &[&str] = &[
   "Fully available",
   "1-17% utilized",
   "17-33% utilized",
   "33-50% utilized",
   "50-67% utilized",
   "67-83% utilized",
   "83-99% utilized",
   "No service available",
];

/// `None` marks reserved slots.
const AUDIO_VIDEO_MINORS: &[Option<&str>] = &[
   Some("Uncategorized"),
   Some("Device conforms to the Headset profile"),
   Some("Hands-free"),
   None,
   Some("Microphone"),
   Some("Loudspeaker"),
   Some("Headphones"),
   Some("Portable Audio"),
   Some("Car Audio"),
   Some("Set-top box"),
   Some("HiFi Audio Device"),
   Some("VCR"),
   Some("Video Camera"),
   Some("Camcorder"),
   Some("Video Monitor"),
   Some("Video Display and Loudspeaker"),
   Some("Video Conferencing"),
   None,
   Some("Gaming/Toy"),
];

/// Imaging minors are flags; the first set flag in this order wins.
const IMAGING_FLAGS: &[(u8, &str)] = &[
   (0x04, "Display"),
   (0x08, "Camera"),
   (0x10, "Scanner"),
   (0x20, "Printer"),
];

/// Indexed by `minor - 1`.
const WEARABLE_MINORS: &[&str] = &["Wrist Watch", "Pager", "Jacket", "Helmet", "Glasses"];

/// Indexed by `minor - 1`.
const TOY_MINORS: &[&str] = &["Robot", "Vehicle", "Doll / Action Figure", "Controller", "Game"];

fn one_based(table: &[&'static str], minor: u8) -> Option<&'static str> {
   minor
      .checked_sub(1)
      .and_then(|i| table.get(usize::from(i)))
      .copied()
}

fn lan_access(minor: u8) -> Option<&'static str> {
   if minor == 0 {
      return Some("Uncategorized");
   }
   LAN_UTILIZATION.get(usize::from(minor / 8)).copied()
}

fn imaging(minor: u8) -> Option<&'static str> {
   IMAGING_FLAGS
      .iter()
      .find(|(flag, _)| minor & flag != 0)
      .map(|(_, name)| *name)
}

/// Peripheral minors carry two independent subfields: the keyboard/pointing
/// bits (`0x30`) and the device-type nibble (`0x0F`).
fn peripheral(minor: u8) -> Option<SmolStr> {
   let pointing = match minor & 0x30 {
      0x10 => Some("Keyboard"),
      0x20 => Some("Pointing device"),
      0x30 => Some("Combo keyboard/pointing device"),
      _ => None,
   };
   let kind = match minor & 0x0f {
      0 => None,
      1 => Some("Joystick"),
      2 => Some("Gamepad"),
      3 => Some("Remote control"),
      4 => Some("Sensing device"),
      5 => Some("Digitizer tablet"),
      6 => Some("Card reader"),
      _ => Some("(reserved)"),
   };
   match (pointing, kind) {
      (Some(pointing), Some(kind)) => Some(format_smolstr!("{pointing}/{kind}")),
      (Some(part), None) | (None, Some(part)) => Some(SmolStr::new_static(part)),
      (None, None) => None,
   }
}

/// Resolves the minor description for a `(major, minor)` pair.
///
/// `major` is the 5-bit major field, `minor` the 6-bit minor field. Returns
/// an empty string for Miscellaneous and the uncategorised sentinel (63), and
/// [`UNKNOWN_MINOR`] for everything without an assigned name.
pub fn minor_name(major: u8, minor: u8) -> SmolStr {
   let name = match major {
      0 | 63 => Some(""),
      1 => COMPUTER_MINORS.get(usize::from(minor)).copied(),
      2 => PHONE_MINORS.get(usize::from(minor)).copied(),
      3 => lan_access(minor),
      4 => AUDIO_VIDEO_MINORS.get(usize::from(minor)).copied().flatten(),
      5 => {
         return peripheral(minor).unwrap_or_else(|| SmolStr::new_static(UNKNOWN_MINOR));
      },
      6 => imaging(minor),
      7 => one_based(WEARABLE_MINORS, minor),
      8 => one_based(TOY_MINORS, minor),
      _ => None,
   };
   SmolStr::new_static(name.unwrap_or(UNKNOWN_MINOR))
}

/// Raw class-of-device field in wire order (`0` is the least significant byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClassOfDevice(pub [u8; 3]);

impl ClassOfDevice {
   pub const MISC: Self = Self::from_u32(0x000000);
   pub const COMPUTER_UNCATEGORIZED: Self = Self::from_u32(0x000100);
   pub const COMPUTER_DESKTOP: Self = Self::from_u32(0x000104);
   pub const COMPUTER_SERVER: Self = Self::from_u32(0x000108);
   pub const COMPUTER_LAPTOP: Self = Self::from_u32(0x00010c);
   pub const COMPUTER_HANDHELD: Self = Self::from_u32(0x000110);
   pub const COMPUTER_PALM: Self = Self::from_u32(0x000114);
   pub const COMPUTER_WEARABLE: Self = Self::from_u32(0x000118);
   pub const PHONE_UNCATEGORIZED: Self = Self::from_u32(0x000200);
   pub const PHONE_CELLULAR: Self = Self::from_u32(0x000204);
   pub const PHONE_CORDLESS: Self = Self::from_u32(0x000208);
   pub const PHONE_SMARTPHONE: Self = Self::from_u32(0x00020c);
   pub const PHONE_WIRED_MODEM: Self = Self::from_u32(0x000210);
   pub const PHONE_ISDN_ACCESS: Self = Self::from_u32(0x000214);
   pub const PHONE_SIM_READER: Self = Self::from_u32(0x000218);

   const PRESETS: [(Self, &'static str); 15] = [
      (Self::MISC, "MISC"),
      (Self::COMPUTER_UNCATEGORIZED, "COMPUTER_UNCATEGORIZED"),
      (Self::COMPUTER_DESKTOP, "COMPUTER_DESKTOP"),
      (Self::COMPUTER_SERVER, "COMPUTER_SERVER"),
      (Self::COMPUTER_LAPTOP, "COMPUTER_LAPTOP"),
      (Self::COMPUTER_HANDHELD, "COMPUTER_HANDHELD"),
      (Self::COMPUTER_PALM, "COMPUTER_PALM"),
      (Self::COMPUTER_WEARABLE, "COMPUTER_WEARABLE"),
      (Self::PHONE_UNCATEGORIZED, "PHONE_UNCATEGORIZED"),
      (Self::PHONE_CELLULAR, "PHONE_CELLULAR"),
      (Self::PHONE_CORDLESS, "PHONE_CORDLESS"),
      (Self::PHONE_SMARTPHONE, "PHONE_SMARTPHONE"),
      (Self::PHONE_WIRED_MODEM, "PHONE_WIRED_MODEM"),
      (Self::PHONE_ISDN_ACCESS, "PHONE_ISDN_ACCESS"),
      (Self::PHONE_SIM_READER, "PHONE_SIM_READER"),
   ];

   /// Name of the preset this value equals exactly, if any.
   pub fn preset_name(self) -> Option<&'static str> {
      Self::PRESETS
         .iter()
         .find(|(preset, _)| *preset == self)
         .map(|(_, name)| *name)
   }

   pub const fn from_u32(value: u32) -> Self {
      let [b0, b1, b2, _] = value.to_le_bytes();
      Self([b0, b1, b2])
   }

   pub const fn as_u32(self) -> u32 {
      u32::from_le_bytes([self.0[0], self.0[1], self.0[2], 0])
   }

   /// Parses exactly six hex digits, most significant first (`"5a020c"`).
   pub fn from_hex(s: &str) -> Result<Self> {
      if s.len() != 6 {
         return Err(BtError::InvalidArgument(format!(
            "class of device must be 6 hex digits, got {}",
            s.len()
         )));
      }
      if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
         return Err(BtError::InvalidArgument(format!(
            "class of device is not hexadecimal: {s:?}"
         )));
      }
      let value = u32::from_str_radix(s, 16)
         .map_err(|e| BtError::InvalidArgument(format!("class of device {s:?}: {e}")))?;
      Ok(Self::from_u32(value))
   }

   /// Major device class field (bits 8..=12 of the 24-bit value).
   pub const fn major_bits(self) -> u8 {
      self.0[1] & 0x1f
   }

   /// Minor device class field (bits 2..=7 of the 24-bit value).
   pub const fn minor_bits(self) -> u8 {
      self.0[0] >> 2
   }

   pub fn decode(self) -> DeviceClass {
      let major = self.major_bits();
      DeviceClass {
         major: MajorClass::from_repr(major),
         minor: minor_name(major, self.minor_bits()),
      }
   }
}

impl fmt::Display for ClassOfDevice {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:06x}", self.as_u32())
   }
}

/// Decoded class of device. Derived on demand from a [`ClassOfDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceClass {
   major: Option<MajorClass>,
   minor: SmolStr,
}

impl DeviceClass {
   /// The major category, or `None` when the raw major has no table entry.
   pub const fn major(&self) -> Option<MajorClass> {
      self.major
   }

   pub fn major_name(&self) -> &'static str {
      self.major().map_or(UNKNOWN_MAJOR, MajorClass::name)
   }

   pub fn minor(&self) -> &str {
      &self.minor
   }
}

impl fmt::Display for DeviceClass {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}, {}", self.major_name(), self.minor())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn cod(major: u8, minor: u8) -> ClassOfDevice {
      ClassOfDevice([minor << 2, major, 0])
   }

   #[test]
   fn test_computer_minors() {
      let expected = [
         "Uncategorized",
         "Desktop workstation",
         "Server",
         "Laptop",
         "Handheld",
         "Palm",
         "Wearable",
      ];
      for (minor, name) in expected.iter().enumerate() {
         let class = cod(1, minor as u8).decode();
         assert_eq!(class.major(), Some(MajorClass::Computer));
         assert_eq!(class.to_string(), format!("Computer, {name}"));
      }
      assert_eq!(cod(1, 3).decode().minor(), "Laptop");
      assert_eq!(cod(1, 7).decode().minor(), UNKNOWN_MINOR);
   }

   #[test]
   fn test_phone_minors() {
      assert_eq!(cod(2, 1).decode().to_string(), "Phone, Cellular");
      assert_eq!(cod(2, 3).decode().to_string(), "Phone, Smart phone");
      assert_eq!(cod(2, 6).decode().to_string(), "Phone, Sim Card Reader");
      assert_eq!(cod(2, 7).decode().minor(), UNKNOWN_MINOR);
   }

   #[test]
   fn test_lan_access_bands() {
      assert_eq!(cod(3, 0).decode().to_string(), "LAN Access, Uncategorized");
      assert_eq!(cod(3, 1).decode().minor(), "Fully available");
      assert_eq!(cod(3, 8).decode().minor(), "1-17% utilized");
      assert_eq!(cod(3, 15).decode().minor(), "1-17% utilized");
      assert_eq!(cod(3, 56).decode().minor(), "No service available");
      assert_eq!(cod(3, 63).decode().minor(), "No service available");
   }

   #[test]
   fn test_audio_video_reserved_slots() {
      assert_eq!(
         cod(4, 1).decode().to_string(),
         "Audio/Video, Device conforms to the Headset profile"
      );
      assert_eq!(cod(4, 2).decode().minor(), "Hands-free");
      assert_eq!(cod(4, 3).decode().minor(), UNKNOWN_MINOR);
      assert_eq!(cod(4, 6).decode().minor(), "Headphones");
      assert_eq!(cod(4, 17).decode().minor(), UNKNOWN_MINOR);
      assert_eq!(cod(4, 18).decode().minor(), "Gaming/Toy");
      assert_eq!(cod(4, 19).decode().minor(), UNKNOWN_MINOR);
   }

   #[test]
   fn test_peripheral_composition() {
      assert_eq!(cod(5, 16 | 1).decode().to_string(), "Peripheral, Keyboard/Joystick");
      assert_eq!(cod(5, 32).decode().minor(), "Pointing device");
      assert_eq!(cod(5, 2).decode().minor(), "Gamepad");
      assert_eq!(
         cod(5, 48 | 5).decode().minor(),
         "Combo keyboard/pointing device/Digitizer tablet"
      );
      assert_eq!(cod(5, 16 | 9).decode().minor(), "Keyboard/(reserved)");
      // Neither subfield set has no name of its own.
      assert_eq!(cod(5, 0).decode().minor(), UNKNOWN_MINOR);
   }

   #[test]
   fn test_imaging_flag_priority() {
      assert_eq!(cod(6, 0x04).decode().minor(), "Display");
      assert_eq!(cod(6, 0x3c).decode().minor(), "Display");
      assert_eq!(cod(6, 0x38).decode().minor(), "Camera");
      assert_eq!(cod(6, 0x30).decode().minor(), "Scanner");
      assert_eq!(cod(6, 0x20).decode().minor(), "Printer");
      assert_eq!(cod(6, 0x03).decode().minor(), UNKNOWN_MINOR);
   }

   #[test]
   fn test_wearable_and_toy() {
      assert_eq!(cod(7, 1).decode().to_string(), "Uncategorized, Wrist Watch");
      assert_eq!(cod(7, 5).decode().minor(), "Glasses");
      assert_eq!(cod(7, 0).decode().minor(), UNKNOWN_MINOR);
      assert_eq!(cod(7, 6).decode().minor(), UNKNOWN_MINOR);

      let toy = cod(8, 3).decode();
      assert_eq!(toy.major(), None);
      assert_eq!(toy.minor(), "Doll / Action Figure");
      assert_eq!(toy.to_string(), format!("{UNKNOWN_MAJOR}, Doll / Action Figure"));
   }

   #[test]
   fn test_miscellaneous_is_empty() {
      assert_eq!(cod(0, 0).decode().to_string(), "Miscellaneous, ");
      assert_eq!(cod(0, 17).decode().minor(), "");
      assert_eq!(minor_name(63, 5), "");
   }

   #[test]
   fn test_out_of_table_majors_fall_back() {
      for major in 9..=31u8 {
         let class = cod(major, 1).decode();
         assert_eq!(class.major(), None);
         assert_eq!(class.major_name(), UNKNOWN_MAJOR);
         assert_eq!(class.minor(), UNKNOWN_MINOR);
      }
   }

   #[test]
   fn test_decode_is_total() {
      for b1 in 0..=255u8 {
         for b0 in (0..=255u8).step_by(4) {
            let class = ClassOfDevice([b0, b1, 0xff]).decode();
            if class.major() != Some(MajorClass::Miscellaneous) {
               assert!(!class.minor().is_empty(), "empty minor for {b1:#x}/{b0:#x}");
            }
            assert_eq!(class, ClassOfDevice([b0, b1, 0xff]).decode());
         }
      }
   }

   #[test]
   fn test_service_and_format_bits_are_ignored() {
      // Low two bits are the format type, the top byte holds service classes.
      assert_eq!(
         ClassOfDevice([0x0c | 0x03, 0x01 | 0xe0, 0x5a]).decode(),
         ClassOfDevice::COMPUTER_LAPTOP.decode()
      );
   }

   #[test]
   fn test_from_hex() {
      let cod = ClassOfDevice::from_hex("5a020c").unwrap();
      assert_eq!(cod.0, [0x0c, 0x02, 0x5a]);
      assert_eq!(cod.as_u32(), 0x5a020c);
      assert_eq!(cod.to_string(), "0x5a020c");
      assert_eq!(cod.decode().to_string(), "Phone, Smart phone");

      assert_eq!(ClassOfDevice::from_hex("00010C").unwrap(), ClassOfDevice::COMPUTER_LAPTOP);
   }

   #[test]
   fn test_from_hex_rejects_malformed() {
      for bad in ["", "12345", "1234567", "+12345", "zzzzzz", "0x0104"] {
         let err = ClassOfDevice::from_hex(bad).unwrap_err();
         assert!(matches!(err, BtError::InvalidArgument(_)), "{bad:?} gave {err:?}");
      }
   }

   #[test]
   fn test_presets() {
      assert_eq!(ClassOfDevice::MISC.decode().to_string(), "Miscellaneous, ");
      assert_eq!(
         ClassOfDevice::COMPUTER_DESKTOP.decode().to_string(),
         "Computer, Desktop workstation"
      );
      assert_eq!(ClassOfDevice::COMPUTER_WEARABLE.decode().minor(), "Wearable");
      assert_eq!(
         ClassOfDevice::PHONE_WIRED_MODEM.decode().minor(),
         "Wired modem or voice gateway"
      );
      assert_eq!(ClassOfDevice::PHONE_SIM_READER.decode().minor(), "Sim Card Reader");
   }

   #[test]
   fn test_preset_names() {
      assert_eq!(ClassOfDevice::COMPUTER_LAPTOP.preset_name(), Some("COMPUTER_LAPTOP"));
      assert_eq!(
         ClassOfDevice::from_hex("00020c").unwrap().preset_name(),
         Some("PHONE_SMARTPHONE")
      );
      assert_eq!(ClassOfDevice::from_u32(0x5a020c).preset_name(), None);
   }
}
