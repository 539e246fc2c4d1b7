//! Session-bus service surface.
//!
//! One object at `/org/librepods/AirPods` implementing
//! `org.librepods.AirPods1`: read-only properties mirroring the device state,
//! setter methods that forward to the orchestrator, and signals for peer and
//! state transitions. The surface owns the structure; the content lives in
//! [`DeviceState`].

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   aap::protocol::{ListeningModes, NoiseControlMode},
   media::EarPauseMode,
   orchestrator::Command,
   state::DeviceState,
};

pub const BUS_NAME: &str = "org.librepods.Daemon";
pub const OBJECT_PATH: &str = "/org/librepods/AirPods";

pub struct AirPodsService {
   state: Arc<DeviceState>,
   commands: mpsc::Sender<Command>,
}

impl AirPodsService {
   pub const fn new(state: Arc<DeviceState>, commands: mpsc::Sender<Command>) -> Self {
      Self { state, commands }
   }

   async fn dispatch(&self, command: Command) {
      if self.commands.send(command).await.is_err() {
         warn!("Orchestrator is gone; dropping bus command");
      }
   }
}

#[interface(name = "org.librepods.AirPods1")]
impl AirPodsService {
   // Properties

   #[zbus(property)]
   async fn connected(&self) -> bool {
      self.state.connected()
   }

   #[zbus(property)]
   async fn device_name(&self) -> String {
      self.state.device_name().to_string()
   }

   #[zbus(property)]
   async fn device_address(&self) -> String {
      self.state.device_address().to_string()
   }

   #[zbus(property)]
   async fn device_model(&self) -> String {
      self.state.model().as_str().to_owned()
   }

   #[zbus(property)]
   async fn display_name(&self) -> String {
      self.state.display_name().to_string()
   }

   #[zbus(property)]
   async fn is_headphones(&self) -> bool {
      self.state.model().is_headphones()
   }

   #[zbus(property, name = "SupportsANC")]
   async fn supports_anc(&self) -> bool {
      self.state.model().supports_anc()
   }

   #[zbus(property)]
   async fn supports_adaptive(&self) -> bool {
      self.state.model().supports_adaptive()
   }

   #[zbus(property)]
   async fn battery_left(&self) -> i32 {
      i32::from(self.state.battery().left.level)
   }

   #[zbus(property)]
   async fn battery_right(&self) -> i32 {
      i32::from(self.state.battery().right.level)
   }

   #[zbus(property)]
   async fn battery_case(&self) -> i32 {
      i32::from(self.state.battery().case.level)
   }

   #[zbus(property)]
   async fn charging_left(&self) -> bool {
      self.state.battery().left.is_charging()
   }

   #[zbus(property)]
   async fn charging_right(&self) -> bool {
      self.state.battery().right.is_charging()
   }

   #[zbus(property)]
   async fn charging_case(&self) -> bool {
      self.state.battery().case.is_charging()
   }

   #[zbus(property)]
   async fn noise_control_mode(&self) -> String {
      self.state.noise_control_mode().to_str().to_owned()
   }

   #[zbus(property)]
   async fn conversational_awareness(&self) -> bool {
      self.state.conversational_awareness()
   }

   #[zbus(property)]
   async fn left_in_ear(&self) -> bool {
      self.state.left_in_ear()
   }

   #[zbus(property)]
   async fn right_in_ear(&self) -> bool {
      self.state.right_in_ear()
   }

   #[zbus(property)]
   async fn adaptive_noise_level(&self) -> i32 {
      self.state.adaptive_noise_level()
   }

   #[zbus(property)]
   async fn ear_pause_mode(&self) -> i32 {
      self.state.ear_pause_mode() as i32
   }

   #[zbus(property)]
   async fn listening_mode_off(&self) -> bool {
      self.state.listening_modes().off
   }

   #[zbus(property)]
   async fn listening_mode_transparency(&self) -> bool {
      self.state.listening_modes().transparency
   }

   #[zbus(property, name = "ListeningModeANC")]
   async fn listening_mode_anc(&self) -> bool {
      self.state.listening_modes().anc
   }

   #[zbus(property)]
   async fn listening_mode_adaptive(&self) -> bool {
      self.state.listening_modes().adaptive
   }

   // Methods. Each one forwards to the orchestrator and replies with an
   // empty success; invalid or impossible requests are logged, not raised.

   async fn set_noise_control_mode(&self, mode: String) {
      let mode = NoiseControlMode::from_user(&mode);
      info!("D-Bus: SetNoiseControlMode -> {mode}");
      self.dispatch(Command::SetNoiseControlMode(mode)).await;
   }

   async fn set_conversational_awareness(&self, enabled: bool) {
      info!("D-Bus: SetConversationalAwareness({enabled})");
      self.dispatch(Command::SetConversationalAwareness(enabled)).await;
   }

   async fn set_adaptive_noise_level(&self, level: i32) {
      info!("D-Bus: SetAdaptiveNoiseLevel({level})");
      self.dispatch(Command::SetAdaptiveNoiseLevel(level)).await;
   }

   async fn set_ear_pause_mode(&self, mode: i32) {
      match EarPauseMode::from_repr(mode) {
         Some(mode) => {
            info!("D-Bus: SetEarPauseMode({mode})");
            self.dispatch(Command::SetEarPauseMode(mode)).await;
         },
         None => warn!("D-Bus: ignoring out-of-range ear pause mode {mode}"),
      }
   }

   async fn set_listening_modes(&self, off: bool, transparency: bool, anc: bool, adaptive: bool) {
      info!("D-Bus: SetListeningModes(off={off}, transparency={transparency}, anc={anc}, adaptive={adaptive})");
      self
         .dispatch(Command::SetListeningModes(ListeningModes {
            off,
            transparency,
            anc,
            adaptive,
         }))
         .await;
   }

   async fn set_display_name(&self, name: String) {
      info!("D-Bus: SetDisplayName({name:?})");
      self.dispatch(Command::SetDisplayName(name)).await;
   }

   // Signals

   #[zbus(signal)]
   pub async fn device_connected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_changed(
      emitter: &SignalEmitter<'_>,
      left: i32,
      right: i32,
      case_battery: i32,
   ) -> zbus::Result<()>;

   // The Rust name dodges the emitter generated for the NoiseControlMode
   // property; the bus name is the one that counts.
   #[zbus(signal, name = "NoiseControlModeChanged")]
   pub async fn noise_mode_changed(emitter: &SignalEmitter<'_>, mode: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      left_in_ear: bool,
      right_in_ear: bool,
   ) -> zbus::Result<()>;
}
