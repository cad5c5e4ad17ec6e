//! Overlay networking control plane: a `PeerDB` of L2/L3 reachability
//! records, a kernel-programming layer (KAL) that materialises per-network
//! sandbox namespaces with VXLAN/bridge/FDB/neighbor state, an optional
//! IPsec-in-transport encryption controller, and the `Driver` that ties
//! lifecycle and peer-event handling together.
//!
//! One `Driver` struct owns every moving piece (networks, peerDB, firewall
//! lock, key state) and is constructed through a `Config` builder. A single
//! demo binary (`overlay-harness`, see `harness/`) exercises the library
//! directly rather than standing up a plugin daemon surface.

pub mod driver;
pub mod encryption;
pub mod error;
pub mod external;
pub mod kal;
pub mod kv;
pub mod network;
pub mod peerdb;
mod periodic;
pub mod sweep;
pub mod vni;

pub use driver::{Config, CreateNetworkOptions, Driver, JoinInfo};
pub use error::{DriverError, KernelError, Result};
