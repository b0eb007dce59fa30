//! Typed cloud services over the Stratus core engine
//!
//! Thin adapters that speak JSON on top of the request API: device state
//! (read/write/observe with typed accessors), remote log upload, OTA
//! manifest handling with block-wise download, and RPC dispatch. None of
//! them touch the wire; everything goes through [`stratus_core::Client`].

pub mod log;
pub mod ota;
pub mod rpc;
pub mod state;

pub use log::{LogLevel, RemoteLog};
pub use ota::{Component, Manifest, Ota};
pub use rpc::{Rpc, RpcStatus};
pub use state::DeviceState;
