//! Client endpoint — issues calls and routes server packets back to them.
//!
//! Every call reports exactly one terminal outcome through its
//! [`ResponseHandler`]: `on_completed` or `on_error`. The only exception
//! is [`ClientCall::abandon`], which the caller asks for explicitly.

use log::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::{Error, Result, Status};

use super::call::{Call, CallInfo, CallKey, CallState, CallType, ClientEvent};
use super::channel::ChannelLookup;
use super::endpoint::{CallHandle, Endpoint, EndpointStats};
use super::packet::{Packet, PacketType};

/// Completion callbacks for one client call.
///
/// Callbacks run on whichever thread delivered the packet, never under the
/// client's lock, so they may invoke further RPCs or cancel other calls.
pub trait ResponseHandler: Sync {
    /// A server-stream fragment.
    fn on_next(&self, info: &CallInfo, payload: &[u8]) {
        let _ = (info, payload);
    }

    /// The server completed the call.
    fn on_completed(&self, info: &CallInfo, payload: &[u8], status: Status);

    /// The call ended abnormally: server error, cancellation, send failure
    /// or client teardown.
    fn on_error(&self, info: &CallInfo, status: Status);
}

type Handler<'a> = &'a dyn ResponseHandler;

/// Client side of the RPC engine with room for `N` concurrent calls.
pub struct Client<'a, const N: usize> {
    endpoint: Endpoint<'a, Handler<'a>, N>,
}

impl<'a, const N: usize> Client<'a, N> {
    pub fn new(channels: &'a dyn ChannelLookup) -> Self {
        Self {
            endpoint: Endpoint::new("client", channels, RpcConfig::default()),
        }
    }

    pub fn with_config(channels: &'a dyn ChannelLookup, config: RpcConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            endpoint: Endpoint::new("client", channels, config),
        })
    }

    /// Start a call and send its `kRequest`.
    ///
    /// Fails synchronously, with nothing registered, on an unknown channel
    /// ([`Error::ChannelNotFound`]), a full call table
    /// ([`Error::ResourceExhausted`]), an oversized payload or a transport
    /// write failure.
    pub fn invoke(
        &self,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_type: CallType,
        payload: &[u8],
        handler: &'a dyn ResponseHandler,
    ) -> Result<ClientCall<'_, 'a, N>> {
        self.endpoint.check_payload(payload)?;
        let channel = self.endpoint.channel(channel_id)?;

        let (handle, info) = self.endpoint.with_calls(|calls| {
            let key = CallKey {
                channel_id,
                service_id,
                method_id,
                call_id: calls.allocate_call_id(),
            };
            let info = CallInfo { key, call_type };
            calls
                .insert(Call::new(info, handler))
                .map(|handle| (handle, info))
        })
        .inspect_err(|e| warn!("RPC[client]: invoke on ch{channel_id} rejected: {e}"))?;

        let request = Packet::new(PacketType::Request, info.key, payload, None);
        let sent = request
            .encode_to_buffer()
            .and_then(|buf| channel.send(&buf));
        if let Err(e) = sent {
            self.endpoint.with_calls(|calls| calls.remove(handle));
            return Err(e);
        }
        debug!("RPC[client]: started {}", info.key);

        Ok(ClientCall {
            client: self,
            handle,
            info,
        })
    }

    /// Entry point for bytes received from a transport, one packet per call.
    ///
    /// Malformed input and packets for calls no longer active are dropped
    /// and counted; they never affect other calls.
    pub fn process_incoming_packet(&self, bytes: &[u8]) -> Result<()> {
        let packet = self.endpoint.decode(bytes)?;
        if packet.packet_type.is_client_to_server() {
            self.endpoint.note_dropped();
            warn!("RPC[client]: unexpected {:?} for {}", packet.packet_type, packet.key());
            return Err(Error::InvalidArgument);
        }

        let key = packet.key();
        let routed = self.endpoint.with_calls(|calls| {
            let handle = calls.find(&key)?;
            let call = calls.get_mut(handle)?;
            let event = call.on_server_packet(packet.packet_type, packet.status);
            let (info, handler) = (call.info(), call.handler());
            if matches!(event, Ok(ev) if ev.is_terminal()) {
                calls.remove(handle);
            }
            Some((info, handler, event))
        });

        let Some((info, handler, event)) = routed else {
            self.endpoint.note_dropped();
            debug!("RPC[client]: no call for {:?} {}", packet.packet_type, key);
            self.report_unknown_call(&packet);
            return Ok(());
        };

        match event? {
            ClientEvent::Fragment => handler.on_next(&info, packet.payload),
            ClientEvent::Completed(status) => handler.on_completed(&info, packet.payload, status),
            ClientEvent::Failed(status) => handler.on_error(&info, status),
        }
        Ok(())
    }

    /// A stream fragment for a call we no longer track: tell the server so
    /// it stops streaming. Terminal packets need no answer.
    fn report_unknown_call(&self, packet: &Packet<'_>) {
        let is_fragment = packet.packet_type == PacketType::Response && packet.status.is_none();
        if !self.endpoint.config().report_unknown_calls || !is_fragment {
            return;
        }
        let reply = Packet::new(
            PacketType::ClientError,
            packet.key(),
            &[],
            Some(Status::FailedPrecondition),
        );
        if let Err(e) = self.endpoint.send(&reply) {
            debug!("RPC[client]: could not report unknown call {}: {e}", packet.key());
        }
    }

    /// Close the call after a failed send and deliver `Aborted`.
    fn abort_call(&self, handle: CallHandle, error: Error) -> Error {
        if let Some(call) = self.endpoint.with_calls(|calls| calls.remove(handle)) {
            warn!("RPC[client]: aborting {}: {error}", call.key());
            call.handler().on_error(&call.info(), Status::Aborted);
        }
        error
    }

    /// Force-close every active call with `Aborted`. Returns how many
    /// calls were closed.
    pub fn abort_all(&self) -> usize {
        let calls = self.endpoint.take_all();
        if !calls.is_empty() {
            info!("RPC[client]: aborting {} active call(s)", calls.len());
        }
        for call in &calls {
            call.handler().on_error(&call.info(), Status::Aborted);
        }
        calls.len()
    }

    pub fn active_calls(&self) -> usize {
        self.endpoint.active_calls()
    }

    pub fn stats(&self) -> EndpointStats {
        self.endpoint.stats()
    }
}

impl<const N: usize> Drop for Client<'_, N> {
    fn drop(&mut self) {
        self.abort_all();
    }
}

// ── Call handle ──────────────────────────────────────────────

/// Caller-side view of one client call.
///
/// Dropping a `ClientCall` leaves the call running; use
/// [`cancel`](Self::cancel) or [`abandon`](Self::abandon) to end it early.
/// Operations on a call that has already closed fail with
/// [`Error::FailedPrecondition`].
#[derive(Clone, Copy)]
pub struct ClientCall<'c, 'a, const N: usize> {
    client: &'c Client<'a, N>,
    handle: CallHandle,
    info: CallInfo,
}

impl<const N: usize> ClientCall<'_, '_, N> {
    pub fn info(&self) -> CallInfo {
        self.info
    }

    pub fn handle(&self) -> CallHandle {
        self.handle
    }

    /// Current state; `Closed` once the call has left the table.
    pub fn state(&self) -> CallState {
        self.client
            .endpoint
            .with_calls(|calls| calls.get(self.handle).map(|c| c.state()))
            .unwrap_or(CallState::Closed)
    }

    pub fn is_active(&self) -> bool {
        self.state() != CallState::Closed
    }

    /// Send a `kClientStream` fragment (client-streaming and bidirectional
    /// calls only).
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let endpoint = &self.client.endpoint;
        endpoint.check_payload(payload)?;
        endpoint.with_calls(|calls| {
            calls
                .get(self.handle)
                .ok_or(Error::FailedPrecondition)?
                .check_client_write()
        })?;
        self.send(PacketType::ClientStream, payload)
    }

    /// Send `kClientStreamEnd`; the call then awaits the server's response.
    pub fn close_client_stream(&self) -> Result<()> {
        self.client.endpoint.with_calls(|calls| {
            calls
                .get_mut(self.handle)
                .ok_or(Error::FailedPrecondition)?
                .end_client_stream()
        })?;
        self.send(PacketType::ClientStreamEnd, &[])
    }

    /// Send `kCancel` and close the call locally without waiting for the
    /// server. The handler receives `on_error(Cancelled)`.
    pub fn cancel(&self) -> Result<()> {
        let endpoint = &self.client.endpoint;
        let call = endpoint
            .with_calls(|calls| calls.remove(self.handle))
            .ok_or(Error::FailedPrecondition)?;

        let cancel = Packet::new(PacketType::Cancel, self.info.key, &[], None);
        if let Err(e) = endpoint.send(&cancel) {
            debug!("RPC[client]: cancel for {} not delivered: {e}", self.info.key);
        }
        call.handler().on_error(&self.info, Status::Cancelled);
        Ok(())
    }

    /// Forget the call locally. Neither the server nor the handler is told.
    pub fn abandon(&self) -> Result<()> {
        self.client
            .endpoint
            .with_calls(|calls| calls.remove(self.handle))
            .map(|_| ())
            .ok_or(Error::FailedPrecondition)
    }

    fn send(&self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let packet = Packet::new(packet_type, self.info.key, payload, None);
        self.client
            .endpoint
            .send(&packet)
            .map_err(|e| self.client.abort_call(self.handle, e))
    }
}

// ── Tests ────────────────────────────────────────────────────
