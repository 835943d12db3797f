//! Bluetooth Mesh provisioner primitives
//!
//! This library contains the protocol and security engines a mesh provisioner is built from:
//!
//! * [`crypto`] holds the mesh cryptographic toolbox: AES-128 `e`, AES-CMAC, AES-CCM, the
//!   `s1`/`k1`/`k2` derivations, and the P-256 key agreement of the provisioning protocol.
//! * [`net`] is the network layer: sealed and obfuscated network PDUs, nid based dispatch
//!   across the configured networks, and the receive loop over the dongle queues.
//! * [`gprov`] is the generic provisioning layer: transaction segmentation and reassembly over
//!   the advertising bearer, the acknowledgement machinery, and PB-ADV link control.
//! * [`prov`] is the provisioning layer: beacon scanning and the four phase protocol that
//!   admits a device into a network.
//! * [`store`] keeps the persistent per-network records (keys, IV index, sequence and unicast
//!   allocation) backing the network and provisioning layers.
//!
//! The physical radio sits behind the [`driver::DongleDriver`] trait; anything that can move
//! labelled frames can carry this stack. Logging goes through the `log` facade, the library
//! installs no logger of its own.

pub mod buffer;
pub mod crypto;
pub mod driver;
pub mod gprov;
pub mod net;
pub mod prov;
pub mod store;

pub use driver::DongleDriver;
pub use net::{HardContext, NetworkLayer, SoftContext};
pub use prov::ProvisioningLayer;
pub use store::{NetworkRecord, NetworkStore};
