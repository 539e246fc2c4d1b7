//! Shared device state.
//!
//! One mutex-guarded record of the currently associated peer. All mutation
//! goes through typed setters; reads hand out copies so no reference to the
//! guarded data survives past the lock. The bus surface reads it, the
//! orchestrator writes it.

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   aap::{
      model::AirPodsModel,
      protocol::{BatteryReading, BatteryUpdate, EarDetectionUpdate, ListeningModes, NoiseControlMode},
   },
   media::EarPauseMode,
};

const DEFAULT_ADAPTIVE_LEVEL: i32 = 50;

/// Battery readings for all three components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatterySet {
   pub left: BatteryReading,
   pub right: BatteryReading,
   pub case: BatteryReading,
}

#[derive(Debug, Clone)]
struct Fields {
   connected: bool,
   device_name: SmolStr,
   device_address: SmolStr,
   display_name: SmolStr,
   model: AirPodsModel,
   battery: BatterySet,
   noise_control_mode: NoiseControlMode,
   conversational_awareness: bool,
   adaptive_noise_level: i32,
   listening_modes: ListeningModes,
   left_in_ear: bool,
   right_in_ear: bool,
   /// Which earbud hosts the active microphone. Stays `true` for now; the
   /// packet path carries no authoritative primary-side signal.
   primary_left: bool,
   ear_pause_mode: EarPauseMode,
}

impl Default for Fields {
   fn default() -> Self {
      Self {
         connected: false,
         device_name: SmolStr::default(),
         device_address: SmolStr::default(),
         display_name: SmolStr::default(),
         model: AirPodsModel::Unknown,
         battery: BatterySet::default(),
         noise_control_mode: NoiseControlMode::Off,
         conversational_awareness: false,
         adaptive_noise_level: DEFAULT_ADAPTIVE_LEVEL,
         listening_modes: ListeningModes::default(),
         left_in_ear: false,
         right_in_ear: false,
         primary_left: true,
         ear_pause_mode: EarPauseMode::OneOut,
      }
   }
}

/// Mutex-guarded state of the associated peer.
#[derive(Debug, Default)]
pub struct DeviceState {
   inner: Mutex<Fields>,
}

impl DeviceState {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn connected(&self) -> bool {
      self.inner.lock().connected
   }

   pub fn device_name(&self) -> SmolStr {
      self.inner.lock().device_name.clone()
   }

   pub fn device_address(&self) -> SmolStr {
      self.inner.lock().device_address.clone()
   }

   pub fn display_name(&self) -> SmolStr {
      self.inner.lock().display_name.clone()
   }

   pub fn model(&self) -> AirPodsModel {
      self.inner.lock().model
   }

   pub fn battery(&self) -> BatterySet {
      self.inner.lock().battery
   }

   pub fn noise_control_mode(&self) -> NoiseControlMode {
      self.inner.lock().noise_control_mode
   }

   pub fn conversational_awareness(&self) -> bool {
      self.inner.lock().conversational_awareness
   }

   pub fn adaptive_noise_level(&self) -> i32 {
      self.inner.lock().adaptive_noise_level
   }

   pub fn listening_modes(&self) -> ListeningModes {
      self.inner.lock().listening_modes
   }

   pub fn left_in_ear(&self) -> bool {
      self.inner.lock().left_in_ear
   }

   pub fn right_in_ear(&self) -> bool {
      self.inner.lock().right_in_ear
   }

   pub fn primary_left(&self) -> bool {
      self.inner.lock().primary_left
   }

   pub fn ear_pause_mode(&self) -> EarPauseMode {
      self.inner.lock().ear_pause_mode
   }

   /// Associates a peer. The model stays whatever the caller passes (usually
   /// `Unknown` until a metadata frame resolves it).
   pub fn set_device(&self, name: &str, address: &str, model: AirPodsModel) {
      let mut fields = self.inner.lock();
      fields.device_name = SmolStr::new(name);
      fields.device_address = SmolStr::new(address);
      fields.model = model;
      fields.connected = true;
   }

   pub fn set_model(&self, model: AirPodsModel) {
      self.inner.lock().model = model;
   }

   /// Merges one battery frame into the stored readings. Components absent
   /// from the frame keep their previous value. Returns the merged set.
   pub fn set_battery(&self, update: BatteryUpdate) -> BatterySet {
      let mut fields = self.inner.lock();
      if let Some(reading) = update.left {
         fields.battery.left = reading;
      }
      if let Some(reading) = update.right {
         fields.battery.right = reading;
      }
      if let Some(reading) = update.case {
         fields.battery.case = reading;
      }
      fields.battery
   }

   pub fn set_noise_control(&self, mode: NoiseControlMode) {
      self.inner.lock().noise_control_mode = mode;
   }

   /// Maps the frame's primary/secondary placement onto left/right using the
   /// tracked primary side, stores it, and returns `(left, right)`.
   pub fn set_ear_detection(&self, update: EarDetectionUpdate) -> (bool, bool) {
      let mut fields = self.inner.lock();
      let (left, right) = if fields.primary_left {
         (update.primary_in_ear, update.secondary_in_ear)
      } else {
         (update.secondary_in_ear, update.primary_in_ear)
      };
      fields.left_in_ear = left;
      fields.right_in_ear = right;
      (left, right)
   }

   pub fn set_conversational_awareness(&self, enabled: bool) {
      self.inner.lock().conversational_awareness = enabled;
   }

   pub fn set_adaptive_noise_level(&self, level: i32) {
      self.inner.lock().adaptive_noise_level = level.clamp(0, 100);
   }

   pub fn set_listening_modes(&self, modes: ListeningModes) {
      self.inner.lock().listening_modes = modes;
   }

   pub fn set_display_name(&self, name: &str) {
      self.inner.lock().display_name = SmolStr::new(name);
   }

   pub fn set_ear_pause_mode(&self, mode: EarPauseMode) {
      self.inner.lock().ear_pause_mode = mode;
   }

   /// Clears every per-peer field back to its sentinel. The global ear-pause
   /// policy is not per-peer and survives. Safe to call repeatedly.
   pub fn reset(&self) {
      let mut fields = self.inner.lock();
      let ear_pause_mode = fields.ear_pause_mode;
      *fields = Fields::default();
      fields.ear_pause_mode = ear_pause_mode;
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::aap::protocol::BatteryStatus;

   fn reading(level: i8, status: BatteryStatus) -> BatteryReading {
      BatteryReading { level, status }
   }

   #[test]
   fn defaults() {
      let state = DeviceState::new();
      assert!(!state.connected());
      assert_eq!(state.battery().left.level, -1);
      assert_eq!(state.battery().right.level, -1);
      assert_eq!(state.battery().case.level, -1);
      assert_eq!(state.noise_control_mode(), NoiseControlMode::Off);
      assert_eq!(state.adaptive_noise_level(), 50);
      assert!(state.primary_left());
      assert_eq!(state.ear_pause_mode(), EarPauseMode::OneOut);
   }

   #[test]
   fn battery_merge_retains_absent_components() {
      let state = DeviceState::new();
      state.set_battery(BatteryUpdate {
         left: Some(reading(90, BatteryStatus::Discharging)),
         right: Some(reading(80, BatteryStatus::Discharging)),
         case: Some(reading(100, BatteryStatus::Charging)),
      });

      // A later frame naming only the left component leaves the others alone.
      let merged = state.set_battery(BatteryUpdate {
         left: Some(reading(70, BatteryStatus::Discharging)),
         right: None,
         case: None,
      });
      assert_eq!(merged.left.level, 70);
      assert_eq!(merged.right.level, 80);
      assert_eq!(merged.case.level, 100);
      assert_eq!(merged.case.status, BatteryStatus::Charging);
   }

   #[test]
   fn reset_clears_peer_fields() {
      let state = DeviceState::new();
      state.set_device("AirPods Pro", "AA:BB:CC:DD:EE:FF", AirPodsModel::Pro2);
      state.set_battery(BatteryUpdate {
         left: Some(reading(50, BatteryStatus::Charging)),
         right: Some(reading(50, BatteryStatus::Charging)),
         case: Some(reading(50, BatteryStatus::Charging)),
      });
      state.set_noise_control(NoiseControlMode::Anc);
      state.set_ear_detection(EarDetectionUpdate {
         primary_in_ear: true,
         secondary_in_ear: true,
      });
      state.set_ear_pause_mode(EarPauseMode::BothOut);

      state.reset();

      assert!(!state.connected());
      assert!(state.device_name().is_empty());
      assert!(state.device_address().is_empty());
      assert_eq!(state.model(), AirPodsModel::Unknown);
      assert_eq!(state.battery().left.level, -1);
      assert_eq!(state.battery().right.level, -1);
      assert_eq!(state.battery().case.level, -1);
      assert_eq!(state.noise_control_mode(), NoiseControlMode::Off);
      assert!(!state.left_in_ear() && !state.right_in_ear());
      // The ear-pause policy is global, not per-peer.
      assert_eq!(state.ear_pause_mode(), EarPauseMode::BothOut);

      // Reset must be idempotent.
      state.reset();
      assert!(!state.connected());
   }

   #[test]
   fn ear_mapping_follows_primary_side() {
      let state = DeviceState::new();
      let (left, right) = state.set_ear_detection(EarDetectionUpdate {
         primary_in_ear: false,
         secondary_in_ear: true,
      });
      // primary_left defaults to true: primary placement lands on the left.
      assert!(!left);
      assert!(right);
      assert!(!state.left_in_ear());
      assert!(state.right_in_ear());
   }

   #[test]
   fn adaptive_level_is_clamped() {
      let state = DeviceState::new();
      state.set_adaptive_noise_level(400);
      assert_eq!(state.adaptive_noise_level(), 100);
      state.set_adaptive_noise_level(-3);
      assert_eq!(state.adaptive_noise_level(), 0);
   }
}
