//! Apple Accessory Protocol (AAP) implementation.
//!
//! This module contains the protocol definitions, the packet codec, and the
//! model-number lookup for AAP-speaking devices.

pub mod model;
pub mod parser;
pub mod protocol;
