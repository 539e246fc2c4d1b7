//! The daemon's control-plane event loop.
//!
//! One task consumes BlueZ peer events, bus commands, and link traffic, and
//! fans state changes out to the device state, the bus surface, and the media
//! controller. Every component below it is owned here.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{select, sync::mpsc, task::JoinHandle, time};
use zbus::object_server::InterfaceRef;

use crate::{
   aap::{
      model::AirPodsModel,
      parser::{self, AapPacket},
      protocol::{
         self, ListeningModes, NoiseControlMode, build_adaptive_level_cmd,
         build_conv_awareness_cmd, build_listening_modes_cmd, build_noise_control_cmd,
      },
   },
   bluetooth::{
      l2cap::{self, Link, LinkEvent, TransportState},
      observer::PeerEvent,
   },
   config::{Config, DeviceProfile},
   dbus::{AirPodsService, AirPodsServiceSignals},
   error::Error,
   media::{EarPauseMode, MediaController},
   state::DeviceState,
};

/// Some firmware revisions ignore the first notification request; it is
/// repeated on this schedule until a battery report arrives.
const NOTIFY_RETRY_SCHEDULE: &[Duration] = &[
   Duration::from_secs(2),
   Duration::from_secs(3),
   Duration::from_secs(5),
   Duration::from_secs(10),
];

/// Commands arriving from the bus surface.
#[derive(Debug, Clone)]
pub enum Command {
   SetNoiseControlMode(NoiseControlMode),
   SetConversationalAwareness(bool),
   SetAdaptiveNoiseLevel(i32),
   SetEarPauseMode(EarPauseMode),
   SetListeningModes(ListeningModes),
   SetDisplayName(String),
}

/// Properties whose `PropertiesChanged` emission the orchestrator drives.
#[derive(Debug, Clone, Copy)]
enum Prop {
   Connected,
   DeviceName,
   DeviceAddress,
   DeviceModel,
   DisplayName,
   IsHeadphones,
   SupportsAnc,
   SupportsAdaptive,
   BatteryLeft,
   BatteryRight,
   BatteryCase,
   NoiseControlMode,
   ConversationalAwareness,
   LeftInEar,
   RightInEar,
   AdaptiveNoiseLevel,
   EarPauseMode,
   ListeningModeOff,
   ListeningModeTransparency,
   ListeningModeAnc,
   ListeningModeAdaptive,
}

/// Self-addressed messages from spawned connect attempts.
enum Loopback {
   LinkUp {
      link: Link,
      events: mpsc::Receiver<LinkEvent>,
   },
   LinkFailed {
      address: Address,
      error: Error,
   },
}

pub struct Orchestrator {
   state: Arc<DeviceState>,
   media: MediaController,
   config: Config,
   iface: InterfaceRef<AirPodsService>,
   commands: mpsc::Receiver<Command>,
   peers: mpsc::Receiver<PeerEvent>,
   loopback_tx: mpsc::Sender<Loopback>,
   loopback_rx: mpsc::Receiver<Loopback>,

   transport: TransportState,
   link: Option<Link>,
   link_events: Option<mpsc::Receiver<LinkEvent>>,
   /// Identity of the peer a connect attempt is running for.
   pending: Option<(Address, String)>,
   notify_retry: Option<JoinHandle<()>>,
}

async fn next_link_event(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
   match rx {
      Some(rx) => rx.recv().await,
      None => std::future::pending().await,
   }
}

impl Orchestrator {
   pub fn new(
      state: Arc<DeviceState>,
      media: MediaController,
      config: Config,
      iface: InterfaceRef<AirPodsService>,
      commands: mpsc::Receiver<Command>,
      peers: mpsc::Receiver<PeerEvent>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(16);
      Self {
         state,
         media,
         config,
         iface,
         commands,
         peers,
         loopback_tx,
         loopback_rx,
         transport: TransportState::Disconnected,
         link: None,
         link_events: None,
         pending: None,
         notify_retry: None,
      }
   }

   pub async fn run(mut self) {
      info!("Orchestrator running");
      loop {
         select! {
             event = self.peers.recv() => {
                 let Some(event) = event else {
                     info!("Observer channel closed, stopping");
                     break;
                 };
                 self.handle_peer_event(event).await;
             }
             Some(command) = self.commands.recv() => {
                 self.handle_command(command).await;
             }
             Some(message) = self.loopback_rx.recv() => {
                 match message {
                     Loopback::LinkUp { link, events } => self.handle_link_up(link, events).await,
                     Loopback::LinkFailed { address, error } => {
                         warn!("Connection to {address} failed: {error}");
                         if self.transport == TransportState::Connecting {
                             self.set_transport(TransportState::Disconnected);
                             self.pending = None;
                         }
                     },
                 }
             }
             event = next_link_event(&mut self.link_events) => {
                 match event {
                     Some(LinkEvent::Packet(packet)) => self.handle_packet(&packet).await,
                     Some(LinkEvent::Closed(error)) => {
                         info!("L2CAP link closed");
                         self.teardown(error).await;
                     },
                     None => self.teardown(None).await,
                 }
             }
         }
      }
   }

   fn set_transport(&mut self, next: TransportState) {
      if self.transport != next {
         debug!("Transport: {:?} -> {next:?}", self.transport);
         self.transport = next;
      }
   }

   async fn handle_peer_event(&mut self, event: PeerEvent) {
      match event {
         PeerEvent::Connected { address, name } => {
            if self.transport != TransportState::Disconnected {
               // Single-peer daemon: whatever is connected is the peer.
               debug!("Ignoring connect event for {address}: transport busy");
               return;
            }

            info!("Connecting to AirPods: {name} ({address})");
            self.set_transport(TransportState::Connecting);
            self.pending = Some((address, name));

            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               match l2cap::connect(address).await {
                  Ok((link, events)) => {
                     let _ = loopback.send(Loopback::LinkUp { link, events }).await;
                  },
                  Err(error) => {
                     let _ = loopback.send(Loopback::LinkFailed { address, error }).await;
                  },
               }
            });
         },
         PeerEvent::Disconnected { address, name } => {
            info!("BlueZ reports {name} ({address}) gone");
            if self.transport != TransportState::Disconnected {
               self.teardown(None).await;
            }
         },
      }
   }

   async fn handle_link_up(&mut self, link: Link, events: mpsc::Receiver<LinkEvent>) {
      let Some((address, name)) = self.pending.take() else {
         // The peer went away while we were connecting; drop the link.
         return;
      };
      self.set_transport(TransportState::Connected);

      let sender = link.sender().clone();
      self.link = Some(link);
      self.link_events = Some(events);

      // The peer drops the channel when the init frames arrive back to back;
      // it needs a short pause between them. Commands cannot interleave here
      // because the event loop is parked on this sequence until it is done.
      for (delay_ms, frame) in [
         (100, protocol::PKT_HANDSHAKE),
         (50, protocol::PKT_SET_FEATURES),
         (50, protocol::PKT_REQUEST_NOTIFICATIONS),
      ] {
         time::sleep(Duration::from_millis(delay_ms)).await;
         if let Err(error) = sender.send(frame).await {
            warn!("Handshake send failed: {error}");
            self.teardown(Some(error)).await;
            return;
         }
      }
      info!("Handshake sequence completed for {address}");

      let address_str = address.to_string();
      self.state.set_device(&name, &address_str, AirPodsModel::Unknown);

      // Restore the user-chosen display name, if one was saved for this peer.
      if let Some(profile) = DeviceProfile::load(&address_str)
         && !profile.display_name.is_empty()
      {
         self.state.set_display_name(&profile.display_name);
         self.emit_prop(Prop::DisplayName).await;
      }

      if let Err(e) = self.iface.device_connected(&address_str, &name).await {
         warn!("Failed to emit DeviceConnected: {e}");
      }
      self.emit_prop(Prop::Connected).await;
      self.emit_prop(Prop::DeviceName).await;
      self.emit_prop(Prop::DeviceAddress).await;

      // Nudge the peer until battery reporting is established.
      let state = self.state.clone();
      self.notify_retry = Some(tokio::spawn(async move {
         time::sleep(Duration::from_secs(1)).await;
         for (attempt, delay) in NOTIFY_RETRY_SCHEDULE.iter().enumerate() {
            if state.battery().left.level >= 0 || state.battery().right.level >= 0 {
               debug!("Battery reporting established after {attempt} retries");
               return;
            }
            debug!("[Retry {attempt}] No battery report yet, repeating notification request");
            if sender.send(protocol::PKT_REQUEST_NOTIFICATIONS).await.is_err() {
               return;
            }
            time::sleep(*delay).await;
         }
      }));
   }

   /// Tears the session down: releases the socket, resets the device state,
   /// and announces the disconnect on the bus.
   async fn teardown(&mut self, error: Option<Error>) {
      if let Some(error) = &error {
         self.set_transport(TransportState::Error);
         warn!("Transport error: {error}");
      }
      if let Some(handle) = self.notify_retry.take() {
         handle.abort();
      }
      self.link = None;
      self.link_events = None;
      self.pending = None;

      if self.state.connected() {
         let address = self.state.device_address();
         let name = self.state.device_name();
         if let Err(e) = self
            .iface
            .device_disconnected(address.as_str(), name.as_str())
            .await
         {
            warn!("Failed to emit DeviceDisconnected: {e}");
         }
      }

      self.state.reset();
      self.emit_prop(Prop::Connected).await;
      self.set_transport(TransportState::Disconnected);
   }

   async fn handle_packet(&mut self, data: &[u8]) {
      let packet = match parser::parse_packet(data) {
         Ok(packet) => packet,
         Err(e) if e.is_unhandled() => {
            debug!("Unhandled frame ({e}): {}", hex::encode(data));
            return;
         },
         Err(e) => {
            // Bad frames are dropped; the channel stays open.
            debug!("Failed to parse frame: {e} ({})", hex::encode(data));
            return;
         },
      };

      match packet {
         AapPacket::Battery(update) => {
            let battery = self.state.set_battery(update);
            info!(
               "Battery: L={}% R={}% Case={}%",
               battery.left.level, battery.right.level, battery.case.level
            );
            self.emit_prop(Prop::BatteryLeft).await;
            self.emit_prop(Prop::BatteryRight).await;
            self.emit_prop(Prop::BatteryCase).await;
            if let Err(e) = self
               .iface
               .battery_changed(
                  i32::from(battery.left.level),
                  i32::from(battery.right.level),
                  i32::from(battery.case.level),
               )
               .await
            {
               warn!("Failed to emit BatteryChanged: {e}");
            }
         },
         AapPacket::EarDetection(update) => {
            let (left, right) = self.state.set_ear_detection(update);
            info!(
               "Ear detection: left={} right={}",
               if left { "in" } else { "out" },
               if right { "in" } else { "out" }
            );
            self.emit_prop(Prop::LeftInEar).await;
            self.emit_prop(Prop::RightInEar).await;
            if let Err(e) = self.iface.ear_detection_changed(left, right).await {
               warn!("Failed to emit EarDetectionChanged: {e}");
            }
            self.media.on_ear_detection_changed(left, right).await;
         },
         AapPacket::NoiseControl(mode) => {
            info!("Noise control mode: {mode}");
            self.state.set_noise_control(mode);
            self.emit_prop(Prop::NoiseControlMode).await;
            if let Err(e) = self.iface.noise_mode_changed(mode.to_str()).await {
               warn!("Failed to emit NoiseControlModeChanged: {e}");
            }
         },
         AapPacket::ConversationalAwareness(enabled) => {
            info!(
               "Conversational awareness: {}",
               if enabled { "enabled" } else { "disabled" }
            );
            self.state.set_conversational_awareness(enabled);
            self.emit_prop(Prop::ConversationalAwareness).await;
         },
         AapPacket::AdaptiveLevel(level) => {
            info!("Adaptive noise level: {level}");
            self.state.set_adaptive_noise_level(i32::from(level));
            self.emit_prop(Prop::AdaptiveNoiseLevel).await;
         },
         AapPacket::ListeningModes(modes) => {
            info!(
               "Listening modes: off={} transparency={} anc={} adaptive={} (raw={:#04x})",
               modes.off, modes.transparency, modes.anc, modes.adaptive,
               modes.bits()
            );
            self.state.set_listening_modes(modes);
            self.emit_prop(Prop::ListeningModeOff).await;
            self.emit_prop(Prop::ListeningModeTransparency).await;
            self.emit_prop(Prop::ListeningModeAnc).await;
            self.emit_prop(Prop::ListeningModeAdaptive).await;
            self.update_profile(|profile| {
               profile.off_enabled = modes.off;
               profile.transparency_enabled = modes.transparency;
               profile.anc_enabled = modes.anc;
               profile.adaptive_enabled = modes.adaptive;
            });
         },
         AapPacket::CaDetection(level) => {
            debug!("CA detection event: volume level {level}");
         },
         AapPacket::Metadata(meta) => {
            info!(
               "Metadata: device={:?} model={:?} manufacturer={:?}",
               meta.device_name, meta.model_number, meta.manufacturer
            );
            let model = AirPodsModel::from_model_number(&meta.model_number);
            if model != AirPodsModel::Unknown {
               info!("Detected model: {model}");
               self.state.set_model(model);
               self.emit_prop(Prop::DeviceModel).await;
               self.emit_prop(Prop::IsHeadphones).await;
               self.emit_prop(Prop::SupportsAnc).await;
               self.emit_prop(Prop::SupportsAdaptive).await;
            }
         },
      }
   }

   async fn handle_command(&mut self, command: Command) {
      // The ear-pause policy is global and stays settable without a peer.
      if let Command::SetEarPauseMode(mode) = &command {
         let mode = *mode;
         self.state.set_ear_pause_mode(mode);
         self.media.set_ear_pause_mode(mode);
         self.config.ear_pause_mode = mode;
         if let Err(e) = self.config.save() {
            warn!("Failed to save configuration: {e}");
         }
         self.emit_prop(Prop::EarPauseMode).await;
         return;
      }

      if !self.state.connected() || self.link.is_none() {
         warn!("Ignoring {command:?}: no device connected");
         return;
      }

      match command {
         Command::SetNoiseControlMode(mode) => {
            if self.send_frame(&build_noise_control_cmd(mode)).await {
               self.update_profile(|profile| {
                  profile.noise_control_mode = mode.to_str().to_owned();
               });
            }
         },
         Command::SetConversationalAwareness(enabled) => {
            if self.send_frame(&build_conv_awareness_cmd(enabled)).await {
               self.update_profile(|profile| profile.conversational_awareness = enabled);
            }
         },
         Command::SetAdaptiveNoiseLevel(level) => {
            if self.send_frame(&build_adaptive_level_cmd(level)).await {
               self.update_profile(|profile| profile.adaptive_level = level.clamp(0, 100));
            }
         },
         Command::SetListeningModes(modes) => {
            if modes.enabled_count() < 2 {
               warn!("At least two listening modes must stay enabled");
               return;
            }
            if self.send_frame(&build_listening_modes_cmd(modes)).await {
               // The peer does not echo this one reliably; update right away.
               self.state.set_listening_modes(modes);
               self.emit_prop(Prop::ListeningModeOff).await;
               self.emit_prop(Prop::ListeningModeTransparency).await;
               self.emit_prop(Prop::ListeningModeAnc).await;
               self.emit_prop(Prop::ListeningModeAdaptive).await;
               self.update_profile(|profile| {
                  profile.off_enabled = modes.off;
                  profile.transparency_enabled = modes.transparency;
                  profile.anc_enabled = modes.anc;
                  profile.adaptive_enabled = modes.adaptive;
               });
            }
         },
         Command::SetDisplayName(name) => {
            self.state.set_display_name(&name);
            self.emit_prop(Prop::DisplayName).await;
            self.update_profile(|profile| profile.display_name = name);
         },
         Command::SetEarPauseMode(_) => unreachable!("handled above"),
      }
   }

   /// Sends one frame; a failure takes the whole session down. Returns
   /// whether the frame went out.
   async fn send_frame(&mut self, frame: &[u8]) -> bool {
      let Some(link) = &self.link else {
         return false;
      };
      let sender = link.sender().clone();
      match sender.send(frame).await {
         Ok(()) => true,
         Err(error) => {
            warn!("Send failed: {error}");
            self.teardown(Some(error)).await;
            false
         },
      }
   }

   /// Read-modify-write of the connected peer's profile. Persistence
   /// failures are logged and otherwise ignored.
   fn update_profile<F: FnOnce(&mut DeviceProfile)>(&self, apply: F) {
      let address = self.state.device_address();
      if address.is_empty() {
         return;
      }
      let mut profile = DeviceProfile::load(&address).unwrap_or_default();
      apply(&mut profile);
      profile.has_saved_settings = true;
      if let Err(e) = profile.store(&address) {
         warn!("Failed to persist profile for {address}: {e}");
      }
   }

   async fn emit_prop(&self, prop: Prop) {
      let iface = self.iface.get().await;
      let emitter = self.iface.signal_emitter();
      let result = match prop {
         Prop::Connected => iface.connected_changed(emitter).await,
         Prop::DeviceName => iface.device_name_changed(emitter).await,
         Prop::DeviceAddress => iface.device_address_changed(emitter).await,
         Prop::DeviceModel => iface.device_model_changed(emitter).await,
         Prop::DisplayName => iface.display_name_changed(emitter).await,
         Prop::IsHeadphones => iface.is_headphones_changed(emitter).await,
         Prop::SupportsAnc => iface.supports_a_n_c_changed(emitter).await,
         Prop::SupportsAdaptive => iface.supports_adaptive_changed(emitter).await,
         Prop::BatteryLeft => iface.battery_left_changed(emitter).await,
         Prop::BatteryRight => iface.battery_right_changed(emitter).await,
         Prop::BatteryCase => iface.battery_case_changed(emitter).await,
         Prop::NoiseControlMode => iface.noise_control_mode_changed(emitter).await,
         Prop::ConversationalAwareness => iface.conversational_awareness_changed(emitter).await,
         Prop::LeftInEar => iface.left_in_ear_changed(emitter).await,
         Prop::RightInEar => iface.right_in_ear_changed(emitter).await,
         Prop::AdaptiveNoiseLevel => iface.adaptive_noise_level_changed(emitter).await,
         Prop::EarPauseMode => iface.ear_pause_mode_changed(emitter).await,
         Prop::ListeningModeOff => iface.listening_mode_off_changed(emitter).await,
         Prop::ListeningModeTransparency => {
            iface.listening_mode_transparency_changed(emitter).await
         },
         Prop::ListeningModeAnc => iface.listening_mode_a_n_c_changed(emitter).await,
         Prop::ListeningModeAdaptive => iface.listening_mode_adaptive_changed(emitter).await,
      };
      if let Err(e) = result {
         warn!("Failed to emit PropertiesChanged for {prop:?}: {e}");
      }
   }
}
