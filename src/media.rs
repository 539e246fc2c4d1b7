//! Media player control over MPRIS.
//!
//! Pauses and resumes session-bus media players on ear-detection
//! transitions. The controller only ever resumes players it paused itself.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use zbus::{Connection, fdo, proxy};

/// Well-known-name prefix of MPRIS players on the session bus.
const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";

/// When to pause media as earbuds leave the ears.
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
#[repr(i32)]
pub enum EarPauseMode {
   Disabled = 0,
   /// Pause as soon as one earbud is removed.
   #[default]
   OneOut = 1,
   /// Pause only once both earbuds are removed.
   BothOut = 2,
}

/// Media action requested by an ear-detection transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAction {
   Pause,
   Resume,
}

/// Edge detector over (left-in-ear, right-in-ear) observations.
///
/// The first observation after construction or a policy change only records
/// state; same-to-same observations never fire.
#[derive(Debug)]
pub struct EarEdgeDetector {
   mode: EarPauseMode,
   prev: Option<(bool, bool)>,
}

impl EarEdgeDetector {
   pub const fn new(mode: EarPauseMode) -> Self {
      Self { mode, prev: None }
   }

   pub const fn mode(&self) -> EarPauseMode {
      self.mode
   }

   /// Changing the policy invalidates the remembered state.
   pub fn set_mode(&mut self, mode: EarPauseMode) {
      self.mode = mode;
      self.prev = None;
   }

   fn pods_out(mode: EarPauseMode, left: bool, right: bool) -> bool {
      match mode {
         EarPauseMode::Disabled => false,
         EarPauseMode::OneOut => !left || !right,
         EarPauseMode::BothOut => !left && !right,
      }
   }

   fn pods_in(mode: EarPauseMode, left: bool, right: bool) -> bool {
      match mode {
         EarPauseMode::Disabled => false,
         EarPauseMode::OneOut => left && right,
         EarPauseMode::BothOut => left || right,
      }
   }

   /// Feeds one observation and returns the action its edge (if any) asks for.
   pub fn observe(&mut self, left: bool, right: bool) -> Option<EdgeAction> {
      if self.mode == EarPauseMode::Disabled {
         return None;
      }

      let action = self.prev.and_then(|(prev_left, prev_right)| {
         let prev_out = Self::pods_out(self.mode, prev_left, prev_right);
         if !prev_out && Self::pods_out(self.mode, left, right) {
            Some(EdgeAction::Pause)
         } else if prev_out && Self::pods_in(self.mode, left, right) {
            Some(EdgeAction::Resume)
         } else {
            None
         }
      });

      self.prev = Some((left, right));
      action
   }
}

#[proxy(
   interface = "org.mpris.MediaPlayer2.Player",
   default_path = "/org/mpris/MediaPlayer2",
   gen_blocking = false
)]
trait MprisPlayer {
   fn play(&self) -> zbus::Result<()>;

   fn pause(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn playback_status(&self) -> zbus::Result<String>;
}

/// Pauses/resumes MPRIS players on ear-detection transitions.
pub struct MediaController {
   connection: Connection,
   detector: EarEdgeDetector,
   /// Players paused on the most recent out-of-ear transition.
   paused_players: Vec<String>,
}

impl MediaController {
   pub fn new(connection: Connection, mode: EarPauseMode) -> Self {
      Self {
         connection,
         detector: EarEdgeDetector::new(mode),
         paused_players: Vec::new(),
      }
   }

   pub fn set_ear_pause_mode(&mut self, mode: EarPauseMode) {
      info!("Ear pause mode set to {mode}");
      self.detector.set_mode(mode);
   }

   pub async fn on_ear_detection_changed(&mut self, left_in_ear: bool, right_in_ear: bool) {
      match self.detector.observe(left_in_ear, right_in_ear) {
         Some(EdgeAction::Pause) => {
            info!("Ear detection: pods removed, pausing media");
            self.pause_all().await;
         },
         Some(EdgeAction::Resume) => {
            info!("Ear detection: pods inserted, resuming media");
            self.resume().await;
         },
         None => {},
      }
   }

   async fn mpris_players(&self) -> crate::error::Result<Vec<String>> {
      let dbus = fdo::DBusProxy::new(&self.connection).await?;
      Ok(dbus
         .list_names()
         .await?
         .into_iter()
         .map(|name| name.to_string())
         .filter(|name| name.starts_with(MPRIS_PREFIX))
         .collect())
   }

   async fn player(&self, name: &str) -> zbus::Result<MprisPlayerProxy<'_>> {
      MprisPlayerProxy::builder(&self.connection)
         .destination(name.to_owned())?
         .build()
         .await
   }

   /// Pauses every player currently reporting `Playing` and remembers
   /// exactly those names for the next resume.
   pub async fn pause_all(&mut self) {
      self.paused_players.clear();

      let players = match self.mpris_players().await {
         Ok(players) => players,
         Err(e) => {
            warn!("Failed to list session bus names: {e}");
            return;
         },
      };

      for name in players {
         let Ok(player) = self.player(&name).await else {
            continue;
         };
         match player.playback_status().await {
            Ok(status) if status == "Playing" => {
               if let Err(e) = player.pause().await {
                  debug!("Failed to pause {name}: {e}");
               } else {
                  info!("Paused media player: {name}");
                  self.paused_players.push(name);
               }
            },
            Ok(_) => {},
            Err(e) => debug!("Failed to read playback status of {name}: {e}"),
         }
      }
   }

   /// Resumes exactly the players remembered by the last pause, then forgets
   /// them.
   pub async fn resume(&mut self) {
      for name in std::mem::take(&mut self.paused_players) {
         let Ok(player) = self.player(&name).await else {
            continue;
         };
         if let Err(e) = player.play().await {
            debug!("Failed to resume {name}: {e}");
         } else {
            info!("Resumed media player: {name}");
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn first_observation_only_records() {
      let mut det = EarEdgeDetector::new(EarPauseMode::OneOut);
      // Both out on the very first call: no edge to fire yet.
      assert_eq!(det.observe(false, false), None);
      assert_eq!(det.observe(true, true), Some(EdgeAction::Resume));
   }

   #[test]
   fn one_out_pause_resume_cycle() {
      let mut det = EarEdgeDetector::new(EarPauseMode::OneOut);
      assert_eq!(det.observe(true, true), None);
      // One bud removed: pause fires exactly once.
      assert_eq!(det.observe(false, true), Some(EdgeAction::Pause));
      assert_eq!(det.observe(false, true), None);
      // Second bud removed too: still out, no new edge.
      assert_eq!(det.observe(false, false), None);
      // Back in both ears: resume.
      assert_eq!(det.observe(true, true), Some(EdgeAction::Resume));
   }

   #[test]
   fn both_out_policy() {
      let mut det = EarEdgeDetector::new(EarPauseMode::BothOut);
      assert_eq!(det.observe(true, true), None);
      // One bud out does not pause under BothOut.
      assert_eq!(det.observe(false, true), None);
      assert_eq!(det.observe(false, false), Some(EdgeAction::Pause));
      // A single bud back in resumes under BothOut.
      assert_eq!(det.observe(false, true), Some(EdgeAction::Resume));
   }

   #[test]
   fn disabled_policy_never_fires() {
      let mut det = EarEdgeDetector::new(EarPauseMode::Disabled);
      assert_eq!(det.observe(true, true), None);
      assert_eq!(det.observe(false, false), None);
      assert_eq!(det.observe(true, true), None);
   }

   #[test]
   fn policy_change_invalidates_previous_state() {
      let mut det = EarEdgeDetector::new(EarPauseMode::OneOut);
      assert_eq!(det.observe(true, true), None);
      det.set_mode(EarPauseMode::BothOut);
      // The observation after a policy change only records state, even
      // though it would be an edge under the old memory.
      assert_eq!(det.observe(false, false), None);
      assert_eq!(det.observe(true, false), Some(EdgeAction::Resume));
   }

   #[test]
   fn same_to_same_never_fires() {
      let mut det = EarEdgeDetector::new(EarPauseMode::OneOut);
      for _ in 0..3 {
         assert_eq!(det.observe(true, true), None);
      }
      assert_eq!(det.observe(true, false), Some(EdgeAction::Pause));
      for _ in 0..3 {
         assert_eq!(det.observe(true, false), None);
      }
   }

   #[test]
   fn ear_pause_mode_from_repr() {
      assert_eq!(EarPauseMode::from_repr(0), Some(EarPauseMode::Disabled));
      assert_eq!(EarPauseMode::from_repr(1), Some(EarPauseMode::OneOut));
      assert_eq!(EarPauseMode::from_repr(2), Some(EarPauseMode::BothOut));
      assert_eq!(EarPauseMode::from_repr(7), None);
   }
}
