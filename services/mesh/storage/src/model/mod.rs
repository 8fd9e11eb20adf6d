//! Mesh network data model.

pub mod key;
pub mod network;
pub mod provisioner;
pub mod range;
