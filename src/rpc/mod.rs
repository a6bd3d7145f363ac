//! Allocation-free RPC subsystem.
//!
//! Many concurrent calls (unary, client-streaming, server-streaming,
//! bidirectional) multiplexed over a few byte-oriented channels.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         RPC Stack                            │
//! │                                                              │
//! │  transport ──▶ process_incoming_packet ──▶ Packet::decode    │
//! │                         │                                    │
//! │              ┌──────────┴──────────┐                         │
//! │              ▼                     ▼                         │
//! │        ┌──────────┐          ┌──────────┐                    │
//! │        │  Client  │          │  Server  │──▶ ServiceLookup   │
//! │        └────┬─────┘          └────┬─────┘    (MethodHandler) │
//! │             └──────────┬──────────┘                          │
//! │                        ▼                                     │
//! │          Endpoint: lock + CallTable<N> (Call arena)          │
//! │                        │                                     │
//! │                        ▼                                     │
//! │       Packet::encode ──▶ ChannelRegistry ──▶ ChannelOutput   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod call;
pub mod channel;
pub mod client;
pub mod endpoint;
pub mod ids;
pub mod packet;
pub mod server;

pub use call::{CallInfo, CallKey, CallState, CallType};
pub use channel::{Channel, ChannelLookup, ChannelOutput, ChannelRegistry, IoError, NullOutput};
pub use client::{Client, ClientCall, ResponseHandler};
pub use endpoint::{CallHandle, EndpointStats};
pub use packet::{Packet, PacketType};
pub use server::{
    Method, MethodHandler, Responder, Server, ServerCall, ServiceLookup, ServiceTable,
};
