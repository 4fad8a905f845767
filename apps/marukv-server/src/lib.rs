//! MaruKV server: node composition, configuration, RESP codec, and the
//! replicated key-value state machine over the maru-raft core.

pub mod config;
pub mod kv;
pub mod node;
pub mod resp;
