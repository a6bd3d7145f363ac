//! Call state machine — one RPC invocation on either side of the wire.
//!
//! ```text
//!            invoke / kRequest
//!                   │
//!                   ▼
//!            ┌─────────────┐  kClientStream / fragments
//!            │   Active    │◄──────────────┐
//!            └──────┬──────┘───────────────┘
//!                   │ kClientStreamEnd (client-stream, bidi)
//!                   ▼
//!       ┌──────────────────────┐
//!       │  AwaitingCompletion  │
//!       └──────────┬───────────┘
//!                  │ terminal response / error / cancel / abort
//!                  ▼
//!            ┌─────────────┐
//!            │   Closed    │  (removed from the endpoint's table)
//!            └─────────────┘
//! ```
//!
//! The transition functions here are pure: they look at the packet or
//! operation, update `state`, and tell the endpoint what happened. The
//! endpoint decides what to send and whom to notify, outside its lock.

use core::fmt;

use crate::error::{Error, Result, Status};

use super::packet::PacketType;

/// Identity of an active call. Unique among one endpoint's active calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub channel_id: u32,
    pub service_id: u32,
    pub method_id: u32,
    pub call_id: u32,
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ch{}/{:08x}/{:08x}#{}",
            self.channel_id, self.service_id, self.method_id, self.call_id
        )
    }
}

/// Streaming shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl CallType {
    /// The client may send `kClientStream` fragments.
    pub const fn has_client_stream(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::Bidirectional)
    }

    /// The server answers with a stream of fragments plus `kServerStreamEnd`.
    pub const fn has_server_stream(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::Bidirectional)
    }

    /// Packet type a server uses to complete a call of this type.
    pub const fn terminal_packet(self) -> PacketType {
        if self.has_server_stream() {
            PacketType::ServerStreamEnd
        } else {
            PacketType::Response
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Active,
    /// Client stream ended; the server's final response is still pending.
    AwaitingCompletion,
    Closed,
}

/// Everything a callback needs to know about the call it is handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInfo {
    pub key: CallKey,
    pub call_type: CallType,
}

/// What an inbound server packet means for a client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A stream fragment; the call stays open.
    Fragment,
    /// Terminal response with its status.
    Completed(Status),
    /// Terminal `kServerError`.
    Failed(Status),
}

impl ClientEvent {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Fragment)
    }
}

/// What an inbound client packet means for a server call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    StreamFragment,
    StreamEnd,
    /// The client closed the call (`kCancel` or `kClientError`).
    Closed(Status),
}

/// One active call plus the handler context supplied by its owner.
#[derive(Debug, Clone, Copy)]
pub struct Call<H> {
    info: CallInfo,
    state: CallState,
    handler: H,
}

impl<H: Copy> Call<H> {
    pub fn new(info: CallInfo, handler: H) -> Self {
        Self {
            info,
            state: CallState::Active,
            handler,
        }
    }

    pub fn info(&self) -> CallInfo {
        self.info
    }

    pub fn key(&self) -> CallKey {
        self.info.key
    }

    pub fn call_type(&self) -> CallType {
        self.info.call_type
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn handler(&self) -> H {
        self.handler
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == CallState::Closed {
            return Err(Error::FailedPrecondition);
        }
        Ok(())
    }

    /// Mark the call closed. Closing twice is rejected.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = CallState::Closed;
        Ok(())
    }

    // ── Client side ──────────────────────────────────────────

    /// Classify a server-to-client packet for this client call.
    ///
    /// `kResponse` completes unary and client-streaming calls and is a
    /// fragment for server-streaming and bidirectional ones.
    /// `kServerStreamEnd` and `kServerError` always complete the call.
    pub fn on_server_packet(
        &mut self,
        packet_type: PacketType,
        status: Option<Status>,
    ) -> Result<ClientEvent> {
        self.ensure_open()?;
        let event = match packet_type {
            PacketType::Response if self.info.call_type.has_server_stream() => {
                ClientEvent::Fragment
            }
            PacketType::Response | PacketType::ServerStreamEnd => {
                ClientEvent::Completed(status.unwrap_or(Status::Ok))
            }
            PacketType::ServerError => ClientEvent::Failed(status.unwrap_or(Status::Unknown)),
            _ => return Err(Error::InvalidArgument),
        };
        if event.is_terminal() {
            self.state = CallState::Closed;
        }
        Ok(event)
    }

    /// Check that a `kClientStream` fragment may be sent now.
    pub fn check_client_write(&self) -> Result<()> {
        if !self.info.call_type.has_client_stream() || self.state != CallState::Active {
            return Err(Error::FailedPrecondition);
        }
        Ok(())
    }

    /// `Active → AwaitingCompletion` when the client ends its stream.
    pub fn end_client_stream(&mut self) -> Result<()> {
        self.check_client_write()?;
        self.state = CallState::AwaitingCompletion;
        Ok(())
    }

    // ── Server side ──────────────────────────────────────────

    /// Apply a client-to-server packet (other than `kRequest`) to this
    /// server call.
    pub fn on_client_packet(
        &mut self,
        packet_type: PacketType,
        status: Option<Status>,
    ) -> Result<ServerEvent> {
        self.ensure_open()?;
        match packet_type {
            PacketType::ClientStream => {
                self.check_client_write()?;
                Ok(ServerEvent::StreamFragment)
            }
            PacketType::ClientStreamEnd => {
                self.end_client_stream()?;
                Ok(ServerEvent::StreamEnd)
            }
            PacketType::Cancel => {
                self.state = CallState::Closed;
                Ok(ServerEvent::Closed(Status::Cancelled))
            }
            PacketType::ClientError => {
                self.state = CallState::Closed;
                Ok(ServerEvent::Closed(status.unwrap_or(Status::Unknown)))
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Check that the server may send a stream fragment.
    pub fn check_server_write(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.info.call_type.has_server_stream() {
            return Err(Error::FailedPrecondition);
        }
        Ok(())
    }

    /// Close with a unary-style `kResponse`. Streaming calls finish with
    /// `kServerStreamEnd` instead.
    pub fn respond(&mut self) -> Result<()> {
        if self.info.call_type.has_server_stream() {
            return Err(Error::FailedPrecondition);
        }
        self.close()
    }
}

// ── Tests ────────────────────────────────────────────────────
