//! LibrePods daemon for the Linux desktop.
//!
//! Bridges AAP-speaking earbuds and headphones onto the session bus:
//! battery, ear detection, noise control, and automatic media pause/resume
//! when the buds leave the ears.

use std::sync::Arc;

use log::{info, warn};
use tokio::{
   signal::unix::{SignalKind, signal},
   sync::mpsc,
};
use zbus::connection;

mod aap;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod media;
mod orchestrator;
mod state;

use crate::{
   bluetooth::observer,
   config::Config,
   dbus::{AirPodsService, BUS_NAME, OBJECT_PATH},
   error::Result,
   media::MediaController,
   orchestrator::Orchestrator,
   state::DeviceState,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("LibrePods daemon starting...");

   // Config trouble is not fatal; defaults take over.
   let config = Config::load().unwrap_or_else(|e| {
      warn!("Failed to load configuration: {e}");
      Config::default()
   });
   info!("Ear pause mode: {}", config.ear_pause_mode);

   let state = Arc::new(DeviceState::new());
   state.set_ear_pause_mode(config.ear_pause_mode);

   let (command_tx, command_rx) = mpsc::channel(32);
   let service = AirPodsService::new(state.clone(), command_tx);

   // Losing the name race means another daemon instance owns the surface.
   let session_bus = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;
   info!("D-Bus service started at {BUS_NAME}");

   let media = MediaController::new(session_bus.clone(), config.ear_pause_mode);

   let (peer_tx, peer_rx) = mpsc::channel(32);
   let observer_handle = observer::start(peer_tx).await?;

   let iface = session_bus
      .object_server()
      .interface::<_, AirPodsService>(OBJECT_PATH)
      .await?;
   let orchestrator = Orchestrator::new(state, media, config, iface, command_rx, peer_rx);
   let orchestrator_handle = tokio::spawn(orchestrator.run());

   info!("LibrePods daemon running");

   let mut sigterm = signal(SignalKind::terminate())?;
   tokio::select! {
       _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
       _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
   }

   // Cooperative drain: stop the workers, then release the bus surface.
   orchestrator_handle.abort();
   observer_handle.abort();
   if let Err(e) = session_bus
      .object_server()
      .remove::<AirPodsService, _>(OBJECT_PATH)
      .await
   {
      warn!("Failed to unregister bus object: {e}");
   }
   if let Err(e) = session_bus.release_name(BUS_NAME).await {
      warn!("Failed to release bus name: {e}");
   }

   info!("LibrePods daemon stopped");
   Ok(())
}
