//! Model detection for AAP-speaking devices.
//!
//! The peer reports its model number (e.g. `A2699`) in the metadata frame;
//! this module resolves it against Apple's published model numbers and
//! derives the capability flags the rest of the daemon cares about.

use serde::{Deserialize, Serialize};

/// Known device models.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum AirPodsModel {
   #[default]
   #[strum(to_string = "Unknown AirPods")]
   Unknown,
   #[strum(to_string = "AirPods 1st Gen")]
   AirPods1,
   #[strum(to_string = "AirPods 2nd Gen")]
   AirPods2,
   #[strum(to_string = "AirPods 3rd Gen")]
   AirPods3,
   #[strum(to_string = "AirPods 4th Gen")]
   AirPods4,
   #[strum(to_string = "AirPods 4th Gen (ANC)")]
   AirPods4Anc,
   #[strum(to_string = "AirPods Pro")]
   Pro,
   #[strum(to_string = "AirPods Pro 2")]
   Pro2,
   #[strum(to_string = "AirPods Pro 2 (USB-C)")]
   Pro2UsbC,
   #[strum(to_string = "AirPods Pro 3")]
   Pro3,
   #[strum(to_string = "AirPods Max")]
   Max,
   #[strum(to_string = "AirPods Max (USB-C)")]
   MaxUsbC,
}

/// Model numbers from <https://support.apple.com/en-us/109525>.
const MODEL_NUMBERS: &[(&str, AirPodsModel)] = &[
   ("A1523", AirPodsModel::AirPods1),
   ("A1722", AirPodsModel::AirPods1),
   ("A2032", AirPodsModel::AirPods2),
   ("A2031", AirPodsModel::AirPods2),
   ("A2565", AirPodsModel::AirPods3),
   ("A2564", AirPodsModel::AirPods3),
   ("A3053", AirPodsModel::AirPods4),
   ("A3050", AirPodsModel::AirPods4),
   ("A3054", AirPodsModel::AirPods4),
   ("A3056", AirPodsModel::AirPods4Anc),
   ("A3055", AirPodsModel::AirPods4Anc),
   ("A3057", AirPodsModel::AirPods4Anc),
   ("A2084", AirPodsModel::Pro),
   ("A2083", AirPodsModel::Pro),
   ("A2931", AirPodsModel::Pro2),
   ("A2699", AirPodsModel::Pro2),
   ("A2698", AirPodsModel::Pro2),
   ("A3047", AirPodsModel::Pro2UsbC),
   ("A3048", AirPodsModel::Pro2UsbC),
   ("A3049", AirPodsModel::Pro2UsbC),
   ("A3064", AirPodsModel::Pro3),
   ("A3065", AirPodsModel::Pro3),
   ("A3063", AirPodsModel::Pro3),
   ("A2096", AirPodsModel::Max),
   ("A3184", AirPodsModel::MaxUsbC),
];

impl AirPodsModel {
   /// Resolves a model-number string. `Unknown` is a normal outcome, not an
   /// error: unreleased devices still work, just without capability hints.
   pub fn from_model_number(model_number: &str) -> Self {
      MODEL_NUMBERS
         .iter()
         .find(|(number, _)| *number == model_number)
         .map_or(Self::Unknown, |(_, model)| *model)
   }

   pub fn as_str(self) -> &'static str {
      self.into()
   }

   pub const fn supports_anc(self) -> bool {
      matches!(
         self,
         Self::Pro
            | Self::Pro2
            | Self::Pro2UsbC
            | Self::Pro3
            | Self::Max
            | Self::MaxUsbC
            | Self::AirPods4Anc
      )
   }

   pub const fn supports_adaptive(self) -> bool {
      matches!(
         self,
         Self::Pro2 | Self::Pro2UsbC | Self::Pro3 | Self::AirPods4Anc
      )
   }

   /// Over-ear form factor: one battery, no charging case.
   pub const fn is_headphones(self) -> bool {
      matches!(self, Self::Max | Self::MaxUsbC)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn resolves_pro_2() {
      let model = AirPodsModel::from_model_number("A2699");
      assert_eq!(model, AirPodsModel::Pro2);
      assert!(!model.is_headphones());
      assert!(model.supports_anc());
      assert!(model.supports_adaptive());
      assert_eq!(model.as_str(), "AirPods Pro 2");
   }

   #[test]
   fn resolves_headphones() {
      let model = AirPodsModel::from_model_number("A2096");
      assert_eq!(model, AirPodsModel::Max);
      assert!(model.is_headphones());
      assert!(model.supports_anc());
      assert!(!model.supports_adaptive());
   }

   #[test]
   fn unknown_model_number() {
      let model = AirPodsModel::from_model_number("B9999");
      assert_eq!(model, AirPodsModel::Unknown);
      assert!(!model.supports_anc());
      assert!(!model.supports_adaptive());
      assert!(!model.is_headphones());
      assert_eq!(AirPodsModel::from_model_number(""), AirPodsModel::Unknown);
   }

   #[test]
   fn basic_models_have_no_anc() {
      for number in ["A1523", "A2032", "A2565", "A3053"] {
         let model = AirPodsModel::from_model_number(number);
         assert_ne!(model, AirPodsModel::Unknown);
         assert!(!model.supports_anc(), "{model} should not report ANC");
      }
      assert!(AirPodsModel::from_model_number("A3056").supports_anc());
   }
}
