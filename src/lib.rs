//! Embedded RPC engine library.
//!
//! Packet codec, channel registry, call state machine and the
//! client/server endpoints that route packets between them. No heap
//! allocation: every table has a compile-time capacity and every outbound
//! packet is encoded into a fixed stack buffer.

#![cfg_attr(not(test), no_std)]
#![deny(unused_must_use)]

pub mod config;
pub mod map;
pub mod rpc;

mod error;

pub use config::RpcConfig;
pub use error::{Error, Result, Status};
