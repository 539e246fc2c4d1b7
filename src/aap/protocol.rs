//! AAP protocol definitions and data structures.
//!
//! This module contains all the protocol-specific constants, pre-built
//! packets, and the builders for outbound control frames.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::bluetooth::l2cap::Packet;

/// Standard frame header carried by every non-handshake AAP frame.
pub const HDR_STANDARD: [u8; 4] = [0x04, 0x00, 0x04, 0x00];

/// Client hello, the only frame that does not carry the standard header.
pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
/// Enables the feature set the daemon relies on.
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4D, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
/// Subscribes to battery/ear/control notifications.
pub const PKT_REQUEST_NOTIFICATIONS: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0F, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
];

// Opcodes (byte at offset 4)
pub const OP_BATTERY: u8 = 0x04;
pub const OP_EAR_DETECTION: u8 = 0x06;
pub const OP_CONTROL: u8 = 0x09;
pub const OP_METADATA: u8 = 0x1D;
pub const OP_CA_DETECTION: u8 = 0x4B;

// Control sub-opcodes (byte at offset 6 of a control frame)
pub const CTRL_NOISE_CONTROL: u8 = 0x0D;
pub const CTRL_LISTENING_MODES: u8 = 0x1A;
pub const CTRL_CONV_AWARENESS: u8 = 0x28;
pub const CTRL_ADAPTIVE_LEVEL: u8 = 0x2E;

/// Every outbound control command is a fixed-length 11-byte frame.
pub const CONTROL_CMD_SIZE: usize = 11;

pub const PKT_NC_OFF: &[u8; CONTROL_CMD_SIZE] = &[
   0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x01, 0x00, 0x00, 0x00,
];
pub const PKT_NC_ANC: &[u8; CONTROL_CMD_SIZE] = &[
   0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x02, 0x00, 0x00, 0x00,
];
pub const PKT_NC_TRANSPARENCY: &[u8; CONTROL_CMD_SIZE] = &[
   0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x03, 0x00, 0x00, 0x00,
];
pub const PKT_NC_ADAPTIVE: &[u8; CONTROL_CMD_SIZE] = &[
   0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x04, 0x00, 0x00, 0x00,
];

pub const PKT_CA_ENABLE: &[u8; CONTROL_CMD_SIZE] = &[
   0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x28, 0x01, 0x00, 0x00, 0x00,
];
pub const PKT_CA_DISABLE: &[u8; CONTROL_CMD_SIZE] = &[
   0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x28, 0x02, 0x00, 0x00, 0x00,
];

/// Noise control modes as they appear on the wire.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(to_string = "off")]
   Off = 0x01,
   #[strum(to_string = "anc", serialize = "noise_cancellation", serialize = "cancellation")]
   Anc = 0x02,
   #[strum(to_string = "transparency", serialize = "transparent")]
   Transparency = 0x03,
   #[strum(to_string = "adaptive")]
   Adaptive = 0x04,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   /// Parses a user-supplied mode string. Unknown strings map to `Off`.
   pub fn from_user(s: &str) -> Self {
      s.parse().unwrap_or(Self::Off)
   }
}

/// Battery charging status for a single component.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
#[repr(u8)]
pub enum BatteryStatus {
   #[default]
   Unknown = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Battery component identifiers as they appear in battery frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u8)]
pub enum Component {
   /// Headphones form factor reports one battery; it is routed to Left.
   Single = 0x01,
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Battery reading for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryReading {
   /// Level in percent, `-1` when not reported.
   pub level: i8,
   pub status: BatteryStatus,
}

impl BatteryReading {
   pub const UNAVAILABLE: Self = Self {
      level: -1,
      status: BatteryStatus::Unknown,
   };

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }
}

impl Default for BatteryReading {
   fn default() -> Self {
      Self::UNAVAILABLE
   }
}

/// Components decoded from one battery frame.
///
/// Components absent from the frame are `None`; the device state keeps its
/// previous reading for those.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatteryUpdate {
   pub left: Option<BatteryReading>,
   pub right: Option<BatteryReading>,
   pub case: Option<BatteryReading>,
}

/// Raw ear placement decoded from one ear-detection frame.
///
/// Primary/secondary are mapped to left/right by the device state, which
/// tracks which earbud currently hosts the active microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarDetectionUpdate {
   pub primary_in_ear: bool,
   pub secondary_in_ear: bool,
}

/// Strings decoded from a metadata frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
   pub device_name: SmolStr,
   pub model_number: SmolStr,
   pub manufacturer: SmolStr,
}

/// The set of noise-control modes the peer cycles through on a long press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningModes {
   pub off: bool,
   pub transparency: bool,
   pub anc: bool,
   pub adaptive: bool,
}

impl ListeningModes {
   pub const BIT_OFF: u8 = 0x01;
   pub const BIT_TRANSPARENCY: u8 = 0x02;
   pub const BIT_ANC: u8 = 0x04;
   pub const BIT_ADAPTIVE: u8 = 0x08;

   pub const fn from_bits(bits: u8) -> Self {
      Self {
         off: bits & Self::BIT_OFF != 0,
         transparency: bits & Self::BIT_TRANSPARENCY != 0,
         anc: bits & Self::BIT_ANC != 0,
         adaptive: bits & Self::BIT_ADAPTIVE != 0,
      }
   }

   pub const fn bits(self) -> u8 {
      let mut bits = 0;
      if self.off {
         bits |= Self::BIT_OFF;
      }
      if self.transparency {
         bits |= Self::BIT_TRANSPARENCY;
      }
      if self.anc {
         bits |= Self::BIT_ANC;
      }
      if self.adaptive {
         bits |= Self::BIT_ADAPTIVE;
      }
      bits
   }

   pub const fn enabled_count(self) -> u32 {
      self.bits().count_ones()
   }
}

impl Default for ListeningModes {
   /// Transparency, ANC and Adaptive participate in the long-press cycle
   /// out of the box; Off does not.
   fn default() -> Self {
      Self {
         off: false,
         transparency: true,
         anc: true,
         adaptive: true,
      }
   }
}

/// Builds a noise-control command frame.
pub fn build_noise_control_cmd(mode: NoiseControlMode) -> Packet {
   let body = match mode {
      NoiseControlMode::Off => PKT_NC_OFF,
      NoiseControlMode::Anc => PKT_NC_ANC,
      NoiseControlMode::Transparency => PKT_NC_TRANSPARENCY,
      NoiseControlMode::Adaptive => PKT_NC_ADAPTIVE,
   };
   Packet::from_slice(body)
}

/// Builds a conversational-awareness command frame.
pub fn build_conv_awareness_cmd(enable: bool) -> Packet {
   Packet::from_slice(if enable { PKT_CA_ENABLE } else { PKT_CA_DISABLE })
}

/// Builds an adaptive-noise-level command frame. The level is clamped to
/// `[0, 100]` before it is embedded.
pub fn build_adaptive_level_cmd(level: i32) -> Packet {
   let mut pkt = Packet::from_slice(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00]);
   pkt.push(CTRL_ADAPTIVE_LEVEL);
   pkt.push(level.clamp(0, 100) as u8);
   pkt.extend_from_slice(&[0x00, 0x00, 0x00]);
   pkt
}

/// Builds a listening-modes command frame. The bitmask is embedded verbatim;
/// validating that at least two modes stay enabled is the caller's job.
pub fn build_listening_modes_cmd(modes: ListeningModes) -> Packet {
   let mut pkt = Packet::from_slice(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00]);
   pkt.push(CTRL_LISTENING_MODES);
   pkt.push(modes.bits());
   pkt.extend_from_slice(&[0x00, 0x00, 0x00]);
   pkt
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn noise_control_command_bytes() {
      assert_eq!(
         build_noise_control_cmd(NoiseControlMode::Anc).as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x02, 0x00, 0x00, 0x00]
      );
      assert_eq!(
         build_noise_control_cmd(NoiseControlMode::Off)[7],
         NoiseControlMode::Off as u8
      );
      for mode in [
         NoiseControlMode::Off,
         NoiseControlMode::Anc,
         NoiseControlMode::Transparency,
         NoiseControlMode::Adaptive,
      ] {
         assert_eq!(build_noise_control_cmd(mode).len(), CONTROL_CMD_SIZE);
      }
   }

   #[test]
   fn adaptive_level_command_clamps() {
      assert_eq!(build_adaptive_level_cmd(42)[7], 42);
      assert_eq!(build_adaptive_level_cmd(150)[7], 100);
      assert_eq!(build_adaptive_level_cmd(-5)[7], 0);
      assert_eq!(build_adaptive_level_cmd(0).len(), CONTROL_CMD_SIZE);
   }

   #[test]
   fn listening_modes_bitmask() {
      let modes = ListeningModes {
         off: false,
         transparency: true,
         anc: true,
         adaptive: false,
      };
      assert_eq!(modes.bits(), 0x06);
      assert_eq!(build_listening_modes_cmd(modes)[7], 0x06);
      assert_eq!(ListeningModes::from_bits(0x06), modes);
      assert_eq!(modes.enabled_count(), 2);
      assert_eq!(ListeningModes::from_bits(0x0F).enabled_count(), 4);
   }

   #[test]
   fn conv_awareness_command_bytes() {
      assert_eq!(build_conv_awareness_cmd(true)[7], 0x01);
      assert_eq!(build_conv_awareness_cmd(false)[7], 0x02);
   }

   #[test]
   fn noise_mode_strings() {
      assert_eq!(NoiseControlMode::from_user("anc"), NoiseControlMode::Anc);
      assert_eq!(NoiseControlMode::from_user("ANC"), NoiseControlMode::Anc);
      assert_eq!(
         NoiseControlMode::from_user("noise_cancellation"),
         NoiseControlMode::Anc
      );
      assert_eq!(
         NoiseControlMode::from_user("cancellation"),
         NoiseControlMode::Anc
      );
      assert_eq!(
         NoiseControlMode::from_user("Transparent"),
         NoiseControlMode::Transparency
      );
      assert_eq!(
         NoiseControlMode::from_user("adaptive"),
         NoiseControlMode::Adaptive
      );
      assert_eq!(NoiseControlMode::from_user("garbage"), NoiseControlMode::Off);

      assert_eq!(NoiseControlMode::Anc.to_str(), "anc");
      assert_eq!(NoiseControlMode::Transparency.to_str(), "transparency");
   }

   #[test]
   fn default_listening_modes() {
      let modes = ListeningModes::default();
      assert!(!modes.off);
      assert!(modes.transparency && modes.anc && modes.adaptive);
      assert!(modes.enabled_count() >= 2);
   }
}
