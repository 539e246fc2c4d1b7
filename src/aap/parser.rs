//! Packet parsing for the AAP protocol.
//!
//! This module classifies and decodes the frames received from the peer over
//! the L2CAP control channel. One received datagram is one frame; no
//! reassembly happens here. The parser is stateless: mapping primary/secondary
//! earbuds to left/right is left to the device state.

use smol_str::SmolStr;
use thiserror::Error;

use crate::aap::protocol::{
   BatteryReading, BatteryStatus, BatteryUpdate, CTRL_ADAPTIVE_LEVEL, CTRL_CONV_AWARENESS,
   CTRL_LISTENING_MODES, CTRL_NOISE_CONTROL, Component, EarDetectionUpdate, HDR_STANDARD,
   ListeningModes, Metadata, NoiseControlMode, OP_BATTERY, OP_CA_DETECTION, OP_CONTROL,
   OP_EAR_DETECTION, OP_METADATA,
};

/// Smallest valid battery frame: header + opcode + count + one record.
const MIN_BATTERY_SIZE: usize = 12;
/// Offset of the first metadata string (header + opcode + six opaque bytes).
const METADATA_STRINGS_OFFSET: usize = 12;

const MAX_DEVICE_NAME: usize = 63;
const MAX_MODEL_NUMBER: usize = 15;
const MAX_MANUFACTURER: usize = 31;

/// Ear placement byte: only `0x00` counts as in-ear. `0x01` is out of ear,
/// `0x02` is in the case.
const EAR_IN_EAR: u8 = 0x00;

/// A successfully decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AapPacket {
   Battery(BatteryUpdate),
   EarDetection(EarDetectionUpdate),
   NoiseControl(NoiseControlMode),
   ConversationalAwareness(bool),
   ListeningModes(ListeningModes),
   AdaptiveLevel(u8),
   /// Opaque ambient volume level from a CA-detection event.
   CaDetection(u8),
   Metadata(Metadata),
}

/// Why a frame could not be decoded.
///
/// `UnknownOpcode` and `UnknownControl` are not protocol violations; the
/// caller is expected to drop such frames without complaint.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
   #[error("frame does not start with the standard header")]
   InvalidHeader,

   #[error("frame too short: need {expected} bytes, got {actual}")]
   Incomplete { expected: usize, actual: usize },

   #[error("unknown opcode 0x{0:02X}")]
   UnknownOpcode(u8),

   #[error("unknown control sub-opcode 0x{0:02X}")]
   UnknownControl(u8),

   #[error("malformed {kind} frame: {reason}")]
   Malformed {
      kind: &'static str,
      reason: &'static str,
   },
}

impl ParseError {
   /// Frames the protocol simply does not cover, as opposed to frames that
   /// violate it.
   pub const fn is_unhandled(&self) -> bool {
      matches!(self, Self::UnknownOpcode(_) | Self::UnknownControl(_))
   }
}

fn need(data: &[u8], expected: usize) -> Result<(), ParseError> {
   if data.len() < expected {
      Err(ParseError::Incomplete {
         expected,
         actual: data.len(),
      })
   } else {
      Ok(())
   }
}

/// Classifies and decodes a single inbound frame.
pub fn parse_packet(data: &[u8]) -> Result<AapPacket, ParseError> {
   if data.len() < HDR_STANDARD.len() || data[..HDR_STANDARD.len()] != HDR_STANDARD {
      return Err(ParseError::InvalidHeader);
   }
   need(data, 6)?;

   match data[4] {
      OP_BATTERY => parse_battery(data).map(AapPacket::Battery),
      OP_EAR_DETECTION => parse_ear_detection(data).map(AapPacket::EarDetection),
      OP_CONTROL => parse_control(data),
      OP_METADATA => parse_metadata(data).map(AapPacket::Metadata),
      OP_CA_DETECTION => parse_ca_detection(data),
      op => Err(ParseError::UnknownOpcode(op)),
   }
}

/// Parses a battery frame: a count byte, then `count` five-byte records of
/// `[component][_][level][status][_]`.
fn parse_battery(data: &[u8]) -> Result<BatteryUpdate, ParseError> {
   need(data, MIN_BATTERY_SIZE)?;
   if data[5] != 0x00 {
      return Err(ParseError::Malformed {
         kind: "battery",
         reason: "nonzero opcode pad",
      });
   }

   let count = data[6] as usize;
   if count == 0 || count > 3 {
      return Err(ParseError::Malformed {
         kind: "battery",
         reason: "component count out of range",
      });
   }
   need(data, 7 + 5 * count)?;

   let mut update = BatteryUpdate::default();
   for i in 0..count {
      let offset = 7 + 5 * i;
      let id = data[offset];
      let level = data[offset + 2];
      let status = data[offset + 3];

      let status = BatteryStatus::from_repr(status).unwrap_or(BatteryStatus::Unknown);
      let reading = BatteryReading {
         // Levels above 100% mean "not reported".
         level: if level <= 100 { level as i8 } else { -1 },
         status,
      };

      match Component::from_repr(id) {
         // Headphones report one battery; it lives in the left slot.
         Some(Component::Single | Component::Left) => update.left = Some(reading),
         Some(Component::Right) => update.right = Some(reading),
         Some(Component::Case) => update.case = Some(reading),
         None => {
            log::debug!("battery frame names unknown component 0x{id:02X}, skipping");
         },
      }
   }

   Ok(update)
}

/// Parses an ear-detection frame: primary and secondary placement bytes at
/// offsets 6 and 7.
fn parse_ear_detection(data: &[u8]) -> Result<EarDetectionUpdate, ParseError> {
   need(data, 8)?;
   if data[5] != 0x00 {
      return Err(ParseError::Malformed {
         kind: "ear detection",
         reason: "nonzero opcode pad",
      });
   }

   Ok(EarDetectionUpdate {
      primary_in_ear: data[6] == EAR_IN_EAR,
      secondary_in_ear: data[7] == EAR_IN_EAR,
   })
}

/// Parses a control frame by its sub-opcode at offset 6.
fn parse_control(data: &[u8]) -> Result<AapPacket, ParseError> {
   need(data, 8)?;

   match data[6] {
      CTRL_NOISE_CONTROL => {
         let mode = NoiseControlMode::from_repr(data[7]).unwrap_or(NoiseControlMode::Off);
         Ok(AapPacket::NoiseControl(mode))
      },
      CTRL_CONV_AWARENESS => Ok(AapPacket::ConversationalAwareness(data[7] == 0x01)),
      CTRL_LISTENING_MODES => Ok(AapPacket::ListeningModes(ListeningModes::from_bits(data[7]))),
      CTRL_ADAPTIVE_LEVEL => Ok(AapPacket::AdaptiveLevel(data[7].min(100))),
      sub => Err(ParseError::UnknownControl(sub)),
   }
}

/// Parses a CA-detection event: `04 00 04 00 4B 00 02 00 01 [level]`.
fn parse_ca_detection(data: &[u8]) -> Result<AapPacket, ParseError> {
   need(data, 10)?;
   Ok(AapPacket::CaDetection(data[9]))
}

/// Parses a metadata frame: six opaque bytes, then three NUL-terminated
/// strings (device name, model number, manufacturer). Each field is
/// truncated to a bounded length.
fn parse_metadata(data: &[u8]) -> Result<Metadata, ParseError> {
   need(data, METADATA_STRINGS_OFFSET)?;

   let mut pos = METADATA_STRINGS_OFFSET;
   let device_name = read_cstr(data, &mut pos, MAX_DEVICE_NAME);
   let model_number = read_cstr(data, &mut pos, MAX_MODEL_NUMBER);
   let manufacturer = read_cstr(data, &mut pos, MAX_MANUFACTURER);

   Ok(Metadata {
      device_name,
      model_number,
      manufacturer,
   })
}

/// Reads a NUL-terminated string capped at `max` bytes, leaving `pos` past
/// the terminator (overlong fields are skipped in full).
fn read_cstr(data: &[u8], pos: &mut usize, max: usize) -> SmolStr {
   let start = *pos;
   while *pos < data.len() && data[*pos] != 0 && *pos - start < max {
      *pos += 1;
   }
   let text = SmolStr::new(String::from_utf8_lossy(&data[start..*pos]));
   while *pos < data.len() && data[*pos] != 0 {
      *pos += 1;
   }
   if *pos < data.len() {
      *pos += 1;
   }
   text
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::aap::protocol::{
      build_adaptive_level_cmd, build_conv_awareness_cmd, build_listening_modes_cmd,
      build_noise_control_cmd,
   };

   fn frame(hex_str: &str) -> Vec<u8> {
      hex::decode(hex_str.replace(' ', "")).unwrap()
   }

   #[test]
   fn battery_frame_earbuds() {
      // Left 90% discharging, right 80% discharging, case 100% charging.
      let data = frame("04 00 04 00 04 00 03 04 00 5A 02 00 02 00 50 02 00 08 00 64 01 00");
      let Ok(AapPacket::Battery(update)) = parse_packet(&data) else {
         panic!("expected battery packet");
      };

      assert_eq!(
         update.left,
         Some(BatteryReading {
            level: 90,
            status: BatteryStatus::Discharging
         })
      );
      assert_eq!(
         update.right,
         Some(BatteryReading {
            level: 80,
            status: BatteryStatus::Discharging
         })
      );
      assert_eq!(
         update.case,
         Some(BatteryReading {
            level: 100,
            status: BatteryStatus::Charging
         })
      );
   }

   #[test]
   fn battery_frame_headphones() {
      // Single component routes to the left slot; right and case stay absent.
      let data = frame("04 00 04 00 04 00 01 01 00 46 02 00");
      let Ok(AapPacket::Battery(update)) = parse_packet(&data) else {
         panic!("expected battery packet");
      };

      assert_eq!(
         update.left,
         Some(BatteryReading {
            level: 70,
            status: BatteryStatus::Discharging
         })
      );
      assert_eq!(update.right, None);
      assert_eq!(update.case, None);
   }

   #[test]
   fn battery_level_above_100_is_unavailable() {
      let data = frame("04 00 04 00 04 00 01 04 00 FF 02 00");
      let Ok(AapPacket::Battery(update)) = parse_packet(&data) else {
         panic!("expected battery packet");
      };
      assert_eq!(update.left.unwrap().level, -1);
   }

   #[test]
   fn battery_unknown_status_maps_to_unknown() {
      let data = frame("04 00 04 00 04 00 01 04 00 32 09 00");
      let Ok(AapPacket::Battery(update)) = parse_packet(&data) else {
         panic!("expected battery packet");
      };
      assert_eq!(update.left.unwrap().status, BatteryStatus::Unknown);
   }

   #[test]
   fn battery_count_out_of_range_is_malformed() {
      let data = frame("04 00 04 00 04 00 00 04 00 32 02 00");
      assert!(matches!(
         parse_packet(&data),
         Err(ParseError::Malformed { kind: "battery", .. })
      ));

      let data = frame("04 00 04 00 04 00 04 04 00 32 02 00 04 00 32 02 00 04 00 32 02 00 04 00 32 02 00");
      assert!(matches!(
         parse_packet(&data),
         Err(ParseError::Malformed { kind: "battery", .. })
      ));
   }

   #[test]
   fn battery_truncated_is_incomplete() {
      // Claims three components but carries only one record.
      let data = frame("04 00 04 00 04 00 03 04 00 5A 02 00");
      assert!(matches!(
         parse_packet(&data),
         Err(ParseError::Incomplete { .. })
      ));
   }

   #[test]
   fn invalid_header() {
      let data = frame("01 00 04 00 04 00 01 04 00 5A 02 00");
      assert_eq!(parse_packet(&data), Err(ParseError::InvalidHeader));
      assert_eq!(parse_packet(&[0x04, 0x00]), Err(ParseError::InvalidHeader));
   }

   #[test]
   fn unknown_opcode_is_distinct() {
      let data = frame("04 00 04 00 77 00 01 02");
      let err = parse_packet(&data).unwrap_err();
      assert_eq!(err, ParseError::UnknownOpcode(0x77));
      assert!(err.is_unhandled());

      let data = frame("04 00 04 00 09 00 55 01");
      let err = parse_packet(&data).unwrap_err();
      assert_eq!(err, ParseError::UnknownControl(0x55));
      assert!(err.is_unhandled());

      assert!(!ParseError::InvalidHeader.is_unhandled());
   }

   #[test]
   fn ear_detection_frame() {
      // Primary out, secondary in.
      let data = frame("04 00 04 00 06 00 01 00");
      let Ok(AapPacket::EarDetection(update)) = parse_packet(&data) else {
         panic!("expected ear detection packet");
      };
      assert!(!update.primary_in_ear);
      assert!(update.secondary_in_ear);

      // In-case does not count as in-ear.
      let data = frame("04 00 04 00 06 00 02 00");
      let Ok(AapPacket::EarDetection(update)) = parse_packet(&data) else {
         panic!("expected ear detection packet");
      };
      assert!(!update.primary_in_ear);
      assert!(update.secondary_in_ear);
   }

   #[test]
   fn noise_control_frame() {
      let data = frame("04 00 04 00 09 00 0D 03 00 00 00");
      assert_eq!(
         parse_packet(&data),
         Ok(AapPacket::NoiseControl(NoiseControlMode::Transparency))
      );

      // Out-of-range mode bytes fall back to Off.
      let data = frame("04 00 04 00 09 00 0D 09 00 00 00");
      assert_eq!(
         parse_packet(&data),
         Ok(AapPacket::NoiseControl(NoiseControlMode::Off))
      );
   }

   #[test]
   fn listening_modes_frame() {
      let data = frame("04 00 04 00 09 00 1A 06 00 00 00");
      let Ok(AapPacket::ListeningModes(modes)) = parse_packet(&data) else {
         panic!("expected listening modes packet");
      };
      assert!(!modes.off && modes.transparency && modes.anc && !modes.adaptive);
   }

   #[test]
   fn conversational_awareness_frame() {
      let data = frame("04 00 04 00 09 00 28 01 00 00 00");
      assert_eq!(
         parse_packet(&data),
         Ok(AapPacket::ConversationalAwareness(true))
      );
      let data = frame("04 00 04 00 09 00 28 02 00 00 00");
      assert_eq!(
         parse_packet(&data),
         Ok(AapPacket::ConversationalAwareness(false))
      );
   }

   #[test]
   fn ca_detection_frame() {
      let data = frame("04 00 04 00 4B 00 02 00 01 2A");
      assert_eq!(parse_packet(&data), Ok(AapPacket::CaDetection(0x2A)));
   }

   #[test]
   fn metadata_frame() {
      let mut data = frame("04 00 04 00 1D 00 01 02 03 04 05 06");
      data.extend_from_slice(b"Alice's AirPods\0A2699\0Apple Inc.\0");
      let Ok(AapPacket::Metadata(meta)) = parse_packet(&data) else {
         panic!("expected metadata packet");
      };
      assert_eq!(meta.device_name, "Alice's AirPods");
      assert_eq!(meta.model_number, "A2699");
      assert_eq!(meta.manufacturer, "Apple Inc.");
   }

   #[test]
   fn metadata_fields_are_truncated() {
      let mut data = frame("04 00 04 00 1D 00 01 02 03 04 05 06");
      data.extend_from_slice(&[b'x'; 200]);
      data.push(0);
      data.extend_from_slice(b"A2096\0Apple\0");
      let Ok(AapPacket::Metadata(meta)) = parse_packet(&data) else {
         panic!("expected metadata packet");
      };
      assert_eq!(meta.device_name.len(), 63);
      assert_eq!(meta.model_number, "A2096");
      assert_eq!(meta.manufacturer, "Apple");
   }

   #[test]
   fn truncation_never_panics() {
      // Every frame class, cut off at every possible length, must come back
      // as a clean outcome.
      let frames = [
         frame("04 00 04 00 04 00 03 04 00 5A 02 00 02 00 50 02 00 08 00 64 01 00"),
         frame("04 00 04 00 06 00 01 00"),
         frame("04 00 04 00 09 00 0D 02 00 00 00"),
         frame("04 00 04 00 09 00 1A 06 00 00 00"),
         frame("04 00 04 00 4B 00 02 00 01 2A"),
         {
            let mut meta = frame("04 00 04 00 1D 00 01 02 03 04 05 06");
            meta.extend_from_slice(b"Buds\0A2031\0Apple\0");
            meta
         },
      ];
      for full in frames {
         for len in 0..full.len() {
            let _ = parse_packet(&full[..len]);
         }
         assert!(parse_packet(&full).is_ok());
      }
   }

   #[test]
   fn ear_frame_with_bad_pad_is_malformed() {
      let data = frame("04 00 04 00 06 01 01 00");
      assert!(matches!(
         parse_packet(&data),
         Err(ParseError::Malformed { kind: "ear detection", .. })
      ));

      let data = frame("04 00 04 00 04 01 01 04 00 46 02 00");
      assert!(matches!(
         parse_packet(&data),
         Err(ParseError::Malformed { kind: "battery", .. })
      ));
   }

   #[test]
   fn metadata_without_terminators() {
      // Strings simply run to the end of the frame.
      let mut data = frame("04 00 04 00 1D 00 01 02 03 04 05 06");
      data.extend_from_slice(b"Buds");
      let Ok(AapPacket::Metadata(meta)) = parse_packet(&data) else {
         panic!("expected metadata packet");
      };
      assert_eq!(meta.device_name, "Buds");
      assert_eq!(meta.model_number, "");
      assert_eq!(meta.manufacturer, "");
   }

   #[test]
   fn command_round_trips() {
      for mode in [
         NoiseControlMode::Off,
         NoiseControlMode::Anc,
         NoiseControlMode::Transparency,
         NoiseControlMode::Adaptive,
      ] {
         assert_eq!(
            parse_packet(&build_noise_control_cmd(mode)),
            Ok(AapPacket::NoiseControl(mode))
         );
      }

      for enable in [true, false] {
         assert_eq!(
            parse_packet(&build_conv_awareness_cmd(enable)),
            Ok(AapPacket::ConversationalAwareness(enable))
         );
      }

      let modes = ListeningModes {
         off: true,
         transparency: false,
         anc: true,
         adaptive: true,
      };
      assert_eq!(
         parse_packet(&build_listening_modes_cmd(modes)),
         Ok(AapPacket::ListeningModes(modes))
      );

      assert_eq!(
         parse_packet(&build_adaptive_level_cmd(85)),
         Ok(AapPacket::AdaptiveLevel(85))
      );
      // The builder clamps, so the decoded value stays in range.
      assert_eq!(
         parse_packet(&build_adaptive_level_cmd(300)),
         Ok(AapPacket::AdaptiveLevel(100))
      );
   }
}
