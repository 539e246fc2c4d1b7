//! L2CAP transport for the AAP control channel.
//!
//! Owns the SEQPACKET socket and exposes async send/receive through owned
//! tasks. One received datagram is one AAP frame; no reassembly happens at
//! this layer.

use std::sync::Arc;

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{Error, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM (Protocol Service Multiplexer) of the AAP control channel.
const PSM_AAP: u16 = 0x1001;
/// Frames larger than this are neither expected nor supported.
const L2CAP_MTU: usize = 1024;
/// Timeout for write operations.
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(25);

/// Transport lifecycle, as announced to the transport's single observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
   Disconnected,
   Connecting,
   Connected,
   Error,
}

/// Inbound traffic and lifecycle events of one link.
#[derive(Debug)]
pub enum LinkEvent {
   /// One complete AAP frame.
   Packet(Packet),
   /// The link went down; `Some` when a socket error caused it, `None` on a
   /// peer hangup.
   Closed(Option<Error>),
}

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Sender half of a link. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2capSender {
   tx: mpsc::Sender<Command>,
}

impl L2capSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(Error::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| Error::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| Error::RequestTimeout)?
         .map_err(|_| Error::ConnectionClosed)?
   }
}

/// An established L2CAP link. Dropping it tears the socket tasks down.
#[derive(Debug)]
pub struct Link {
   sender: L2capSender,
   tasks: JoinSet<()>,
}

impl Link {
   pub fn sender(&self) -> &L2capSender {
      &self.sender
   }
}

impl Drop for Link {
   fn drop(&mut self) {
      self.tasks.abort_all();
   }
}

/// Connects to the peer's AAP control channel.
///
/// No timeout is applied here: BlueZ gates the connect attempt itself.
pub async fn connect(address: Address) -> Result<(Link, mpsc::Receiver<LinkEvent>)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet()?;
   if let Err(e) = socket.set_recv_mtu(L2CAP_MTU as u16) {
      debug!("Failed to set receive MTU: {e}");
   }

   let addr = SocketAddr::new(address, AddressType::BrEdr, PSM_AAP);
   debug!("Connecting to {address} on PSM {PSM_AAP:#06x}");
   let seq_packet = socket.connect(addr).await?;

   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (event_tx, event_rx) = mpsc::channel(128);

   let seq_packet = Arc::new(seq_packet);
   let mut tasks = JoinSet::new();
   tasks.spawn(recv_task(address, event_tx, seq_packet.clone()));
   tasks.spawn(send_task(address, cmd_rx, seq_packet));

   Ok((
      Link {
         sender: L2capSender { tx: cmd_tx },
         tasks,
      },
      event_rx,
   ))
}

async fn recv_task(adr: Address, tx: mpsc::Sender<LinkEvent>, sp: Arc<SeqPacket>) {
   let mut buf = [0u8; L2CAP_MTU];
   loop {
      match sp.recv(&mut buf).await {
         Ok(0) => {
            warn!("{adr}: peer hung up");
            let _ = tx.send(LinkEvent::Closed(None)).await;
            return;
         },
         Ok(n) => {
            debug!("← {adr}: {}", hex::encode(&buf[..n]));
            if tx.send(LinkEvent::Packet(Packet::from_slice(&buf[..n]))).await.is_err() {
               return;
            }
         },
         Err(e) => {
            warn!("{adr}: receive error: {e}");
            let _ = tx.send(LinkEvent::Closed(Some(Error::Io(e)))).await;
            return;
         },
      }
   }
}

async fn send_task(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("{adr}: send error: {e}");
               let _ = then.send(Err(Error::Io(e)));
            } else {
               let _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("{adr}: sender closed");
}
