//! Bluetooth communication layer.
//!
//! This module provides the L2CAP control-channel transport and the BlueZ
//! observer that watches for AAP-capable peers coming and going.

pub mod l2cap;
pub mod observer;
