//! BlueZ device observer.
//!
//! Watches the BlueZ object graph for devices advertising the AAP service
//! UUID and reports their connect/disconnect transitions. Discovery itself is
//! entirely the host stack's business; this observer only reacts to devices
//! BlueZ already knows about.

use std::collections::HashMap;

use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, Session};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::mpsc,
   task::{JoinHandle, JoinSet},
};
use uuid::Uuid;

use crate::error::Result;

/// Service UUID advertised by AAP-capable peers.
pub const AAP_SERVICE_UUID: Uuid = Uuid::from_u128(0x74ec2172_0bad_4d01_8f77_997b2be0722a);

/// Peer lifecycle events emitted to the orchestrator.
#[derive(Debug, Clone)]
pub enum PeerEvent {
   Connected { address: Address, name: String },
   Disconnected { address: Address, name: String },
}

/// Per-device property changes reported by the watch tasks.
enum Watch {
   ConnectedChanged(Address, bool),
   NameChanged(Address, String),
}

/// Last known identity of a tracked device. Disconnect events are emitted
/// from this cache, since BlueZ omits the identity in its own notifications.
struct PeerRecord {
   name: String,
   connected: bool,
}

/// Starts the observer. Failing to reach BlueZ here is fatal for the caller;
/// anything after startup is handled internally.
pub async fn start(events: mpsc::Sender<PeerEvent>) -> Result<JoinHandle<()>> {
   let session = Session::new().await?;
   let adapter = session.default_adapter().await?;
   info!("BlueZ observer using adapter {}", adapter.name());

   let actor = ObserverActor {
      adapter,
      events,
      peers: HashMap::new(),
      watchers: JoinSet::new(),
   };
   Ok(tokio::spawn(actor.run()))
}

struct ObserverActor {
   adapter: Adapter,
   events: mpsc::Sender<PeerEvent>,
   peers: HashMap<Address, PeerRecord>,
   watchers: JoinSet<()>,
}

impl ObserverActor {
   async fn run(mut self) {
      let mut adapter_events = match self.adapter.events().await {
         Ok(stream) => stream,
         Err(e) => {
            warn!("Failed to subscribe to adapter events: {e}");
            return;
         },
      };

      let (watch_tx, mut watch_rx) = mpsc::channel(64);

      // Catch peers that connected before the daemon came up.
      if let Ok(addresses) = self.adapter.device_addresses().await {
         for address in addresses {
            self.track_device(address, &watch_tx).await;
         }
      }

      loop {
         select! {
             Some(event) = adapter_events.next() => match event {
                 AdapterEvent::DeviceAdded(address) => {
                     debug!("Device added: {address}");
                     self.track_device(address, &watch_tx).await;
                 },
                 AdapterEvent::DeviceRemoved(address) => {
                     debug!("Device removed: {address}");
                     self.forget_device(address).await;
                 },
                 AdapterEvent::PropertyChanged(_) => {},
             },
             Some(watch) = watch_rx.recv() => match watch {
                 Watch::ConnectedChanged(address, connected) => {
                     self.handle_connected_changed(address, connected).await;
                 },
                 Watch::NameChanged(address, name) => {
                     if let Some(record) = self.peers.get_mut(&address) {
                         record.name = name;
                     }
                 },
             },
             else => break,
         }
      }
   }

   /// Starts following a device's property changes. The AAP filter runs at
   /// event time, not here: services may not be resolved yet when the device
   /// object appears.
   async fn track_device(&mut self, address: Address, watch_tx: &mpsc::Sender<Watch>) {
      if self.peers.contains_key(&address) {
         return;
      }
      let Ok(device) = self.adapter.device(address) else {
         return;
      };

      let name = device
         .name()
         .await
         .ok()
         .flatten()
         .unwrap_or_else(|| address.to_string());
      let was_connected = device.is_connected().await.unwrap_or(false);

      let Ok(mut device_events) = device.events().await else {
         return;
      };
      let tx = watch_tx.clone();
      self.watchers.spawn(async move {
         while let Some(DeviceEvent::PropertyChanged(property)) = device_events.next().await {
            let forward = match property {
               DeviceProperty::Connected(connected) => {
                  Watch::ConnectedChanged(address, connected)
               },
               DeviceProperty::Name(name) => Watch::NameChanged(address, name),
               _ => continue,
            };
            if tx.send(forward).await.is_err() {
               return;
            }
         }
      });

      self.peers.insert(
         address,
         PeerRecord {
            name,
            connected: false,
         },
      );

      if was_connected {
         self.handle_connected_changed(address, true).await;
      }
   }

   async fn forget_device(&mut self, address: Address) {
      let Some(record) = self.peers.remove(&address) else {
         return;
      };
      if record.connected {
         info!("AirPods device removed: {} ({address})", record.name);
         let _ = self
            .events
            .send(PeerEvent::Disconnected {
               address,
               name: record.name,
            })
            .await;
      }
   }

   async fn handle_connected_changed(&mut self, address: Address, connected: bool) {
      let already = match self.peers.get(&address) {
         Some(record) => record.connected,
         None => return,
      };
      if already == connected {
         // BlueZ repeats itself; one event per transition is enough.
         return;
      }

      if connected {
         let Ok(device) = self.adapter.device(address) else {
            return;
         };
         if !is_aap_device(&device).await {
            debug!("{address} connected but does not speak AAP, ignoring");
            return;
         }
         let name = device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| address.to_string());

         if let Some(record) = self.peers.get_mut(&address) {
            record.connected = true;
            record.name = name.clone();
         }
         info!("AirPods connected: {name} ({address})");
         let _ = self.events.send(PeerEvent::Connected { address, name }).await;
      } else if let Some(record) = self.peers.get_mut(&address) {
         record.connected = false;
         let name = record.name.clone();
         info!("AirPods disconnected: {name} ({address})");
         let _ = self
            .events
            .send(PeerEvent::Disconnected { address, name })
            .await;
      }
   }
}

async fn is_aap_device(device: &bluer::Device) -> bool {
   if let Ok(Some(uuids)) = device.uuids().await {
      uuids.iter().any(|uuid| *uuid == AAP_SERVICE_UUID)
   } else {
      false
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn service_uuid_constant() {
      assert_eq!(
         AAP_SERVICE_UUID.to_string(),
         "74ec2172-0bad-4d01-8f77-997b2be0722a"
      );
      // Case-insensitive matching holds for free once parsed.
      assert_eq!(
         "74EC2172-0BAD-4D01-8F77-997B2BE0722A"
            .parse::<Uuid>()
            .unwrap(),
         AAP_SERVICE_UUID
      );
   }
}
