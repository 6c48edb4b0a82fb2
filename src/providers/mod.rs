//! Providers Module - External Data Sources and State
//!
//! JSON-RPC clients, chain evidence sources, the shared KV store and scan persistence.

pub mod alchemy;
pub mod kv;
pub mod rpc;
pub mod store;

pub use alchemy::*;
pub use kv::*;
pub use rpc::*;
pub use store::*;
