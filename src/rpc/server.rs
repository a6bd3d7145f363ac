//! Server endpoint — routes client packets to method handlers.
//!
//! Inbound routing:
//!
//! | Packet              | Known call                  | Unknown call                 |
//! |---------------------|-----------------------------|------------------------------|
//! | `kRequest`          | restart: old call cancelled | new call, `on_request`       |
//! | `kClientStream`     | `on_client_stream`          | `kServerError(FAILED_PRECONDITION)` |
//! | `kClientStreamEnd`  | `on_client_stream_end`      | `kServerError(FAILED_PRECONDITION)` |
//! | `kCancel`           | `on_closed(CANCELLED)`      | dropped                      |
//! | `kClientError`      | `on_closed(status)`         | dropped                      |
//!
//! Handlers respond through a [`ServerCall`], either inside the callback
//! or later from another thread via the call's [`CallHandle`] and the
//! server's [`Responder`] implementation.

use log::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::{Error, Result, Status};
use crate::map::{BoundedMap, FixedMap};

use super::call::{Call, CallInfo, CallKey, CallType, ServerEvent};
use super::channel::ChannelLookup;
use super::endpoint::{CallHandle, Endpoint, EndpointStats};
use super::packet::{Packet, PacketType};

// ── Service dispatch boundary ────────────────────────────────

/// User code behind one method.
///
/// Callbacks never run under the server's lock: a handler may respond,
/// fail its own call or issue client RPCs from inside any of them.
pub trait MethodHandler: Sync {
    /// A new call started with the request payload.
    fn on_request(&self, call: ServerCall<'_>, payload: &[u8]);

    /// A `kClientStream` fragment, in channel-delivery order.
    fn on_client_stream(&self, call: ServerCall<'_>, payload: &[u8]) {
        let _ = (call, payload);
    }

    /// The client finished its stream.
    fn on_client_stream_end(&self, call: ServerCall<'_>) {
        let _ = call;
    }

    /// The call was closed by the client (cancel, client error), by a
    /// duplicate request or by server teardown. Not called after the
    /// handler's own terminal send.
    fn on_closed(&self, info: &CallInfo, status: Status) {
        let _ = (info, status);
    }
}

/// A dispatch-table entry.
#[derive(Clone, Copy)]
pub struct Method<'h> {
    pub service_id: u32,
    pub method_id: u32,
    pub call_type: CallType,
    pub handler: &'h dyn MethodHandler,
}

/// Lookup capability mapping `(service_id, method_id)` to a method.
pub trait ServiceLookup: Sync {
    fn find_method(&self, service_id: u32, method_id: u32) -> Option<Method<'_>>;
}

/// Fixed-capacity dispatch table, filled at startup.
pub struct ServiceTable<'h, const N: usize> {
    methods: FixedMap<(u32, u32), Method<'h>, N>,
}

impl<'h, const N: usize> ServiceTable<'h, N> {
    pub const fn new() -> Self {
        Self {
            methods: FixedMap::new(),
        }
    }

    pub fn add_method(
        &mut self,
        service_id: u32,
        method_id: u32,
        call_type: CallType,
        handler: &'h dyn MethodHandler,
    ) -> Result<()> {
        self.methods.try_insert(
            (service_id, method_id),
            Method {
                service_id,
                method_id,
                call_type,
                handler,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<const N: usize> Default for ServiceTable<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ServiceLookup for ServiceTable<'_, N> {
    fn find_method(&self, service_id: u32, method_id: u32) -> Option<Method<'_>> {
        self.methods.get(&(service_id, method_id)).copied()
    }
}

// ── Responder ────────────────────────────────────────────────

/// Response-writer capability, implemented by [`Server`].
///
/// Every operation re-validates the handle; once the call has closed they
/// fail with [`Error::FailedPrecondition`]. A transport failure closes the
/// call and is returned as the error.
pub trait Responder: Sync {
    /// Complete a unary or client-streaming call with `kResponse`.
    fn respond(&self, handle: CallHandle, payload: &[u8], status: Status) -> Result<()>;

    /// Send one server-stream fragment.
    fn write(&self, handle: CallHandle, payload: &[u8]) -> Result<()>;

    /// Complete the call with no payload: `kServerStreamEnd` for streaming
    /// calls, an empty `kResponse` otherwise.
    fn finish(&self, handle: CallHandle, status: Status) -> Result<()>;

    /// Complete the call with `kServerError`.
    fn fail(&self, handle: CallHandle, status: Status) -> Result<()>;

    fn is_active(&self, handle: CallHandle) -> bool;
}

/// A handler's view of its call.
#[derive(Clone, Copy)]
pub struct ServerCall<'s> {
    responder: &'s dyn Responder,
    handle: CallHandle,
    info: CallInfo,
}

impl<'s> ServerCall<'s> {
    pub fn new(responder: &'s dyn Responder, handle: CallHandle, info: CallInfo) -> Self {
        Self {
            responder,
            handle,
            info,
        }
    }

    pub fn info(&self) -> CallInfo {
        self.info
    }

    /// Handle for answering later, e.g. from a worker thread.
    pub fn handle(&self) -> CallHandle {
        self.handle
    }

    pub fn respond(&self, payload: &[u8], status: Status) -> Result<()> {
        self.responder.respond(self.handle, payload, status)
    }

    pub fn write(&self, payload: &[u8]) -> Result<()> {
        self.responder.write(self.handle, payload)
    }

    pub fn finish(&self, status: Status) -> Result<()> {
        self.responder.finish(self.handle, status)
    }

    pub fn fail(&self, status: Status) -> Result<()> {
        self.responder.fail(self.handle, status)
    }

    pub fn is_active(&self) -> bool {
        self.responder.is_active(self.handle)
    }
}

// ── Server ───────────────────────────────────────────────────

type Handler<'a> = &'a dyn MethodHandler;

/// Server side of the RPC engine with room for `N` concurrent calls.
pub struct Server<'a, const N: usize> {
    endpoint: Endpoint<'a, Handler<'a>, N>,
    services: &'a dyn ServiceLookup,
}

impl<'a, const N: usize> Server<'a, N> {
    pub fn new(channels: &'a dyn ChannelLookup, services: &'a dyn ServiceLookup) -> Self {
        Self {
            endpoint: Endpoint::new("server", channels, RpcConfig::default()),
            services,
        }
    }

    pub fn with_config(
        channels: &'a dyn ChannelLookup,
        services: &'a dyn ServiceLookup,
        config: RpcConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            endpoint: Endpoint::new("server", channels, config),
            services,
        })
    }

    /// Entry point for bytes received from a transport, one packet per call.
    ///
    /// Errors describe the packet only: malformed bytes
    /// ([`Error::MalformedPacket`]), a server-to-client packet type
    /// ([`Error::InvalidArgument`]) or an unregistered channel
    /// ([`Error::ChannelNotFound`]). Problems with individual calls are
    /// reported to the peer and never returned.
    pub fn process_incoming_packet(&self, bytes: &[u8]) -> Result<()> {
        let packet = self.endpoint.decode(bytes)?;
        if !packet.packet_type.is_client_to_server() {
            self.endpoint.note_dropped();
            warn!("RPC[server]: unexpected {:?} for {}", packet.packet_type, packet.key());
            return Err(Error::InvalidArgument);
        }
        if self.endpoint.channel(packet.channel_id).is_err() {
            self.endpoint.note_dropped();
            warn!("RPC[server]: packet on unknown channel {}", packet.channel_id);
            return Err(Error::ChannelNotFound);
        }

        match packet.packet_type {
            PacketType::Request => self.handle_request(&packet),
            _ => self.handle_call_packet(&packet),
        }
        Ok(())
    }

    fn handle_request(&self, packet: &Packet<'_>) {
        let key = packet.key();
        let Some(method) = self.services.find_method(key.service_id, key.method_id) else {
            debug!("RPC[server]: no method for {key}");
            self.send_error(key, Status::NotFound);
            return;
        };

        let info = CallInfo {
            key,
            call_type: method.call_type,
        };
        // Preempting the old call and registering the new one is a single
        // critical section.
        let (preempted, inserted) = self.endpoint.with_calls(|calls| {
            let preempted = calls.find(&key).and_then(|h| calls.remove(h));
            (preempted, calls.insert(Call::new(info, method.handler)))
        });

        if let Some(old) = preempted {
            info!("RPC[server]: duplicate request restarts {key}");
            old.handler().on_closed(&old.info(), Status::Cancelled);
        }

        match inserted {
            Ok(handle) => method
                .handler
                .on_request(ServerCall::new(self, handle, info), packet.payload),
            Err(e) => {
                warn!("RPC[server]: rejecting {key}: {e}");
                self.send_error(key, Status::from(e));
            }
        }
    }

    fn handle_call_packet(&self, packet: &Packet<'_>) {
        let key = packet.key();
        let routed = self.endpoint.with_calls(|calls| {
            let handle = calls.find(&key)?;
            let call = calls.get_mut(handle)?;
            let event = call.on_client_packet(packet.packet_type, packet.status);
            let info = call.info();
            let handler = call.handler();
            if let Ok(ServerEvent::Closed(_)) = event {
                calls.remove(handle);
            }
            Some((handle, info, handler, event))
        });

        let Some((handle, info, handler, event)) = routed else {
            self.endpoint.note_dropped();
            debug!("RPC[server]: no call for {:?} {key}", packet.packet_type);
            if matches!(
                packet.packet_type,
                PacketType::ClientStream | PacketType::ClientStreamEnd
            ) && self.endpoint.config().report_unknown_calls
            {
                self.send_error(key, Status::FailedPrecondition);
            }
            return;
        };

        let call = ServerCall::new(self, handle, info);
        match event {
            Ok(ServerEvent::StreamFragment) => handler.on_client_stream(call, packet.payload),
            Ok(ServerEvent::StreamEnd) => handler.on_client_stream_end(call),
            Ok(ServerEvent::Closed(status)) => {
                debug!("RPC[server]: {key} closed by client: {status}");
                handler.on_closed(&info, status);
                if packet.packet_type == PacketType::Cancel
                    && self.endpoint.config().acknowledge_cancel
                {
                    self.send_error(key, Status::Cancelled);
                }
            }
            Err(e) => {
                self.endpoint.note_dropped();
                debug!("RPC[server]: ignoring {:?} for {key}: {e}", packet.packet_type);
            }
        }
    }

    /// Best-effort `kServerError` for a call that is not (or no longer)
    /// registered.
    fn send_error(&self, key: CallKey, status: Status) {
        let packet = Packet::new(PacketType::ServerError, key, &[], Some(status));
        if let Err(e) = self.endpoint.send(&packet) {
            warn!("RPC[server]: could not send {status} for {key}: {e}");
        }
    }

    /// Remove a call after a terminal transition and send its final packet.
    fn close_and_send(
        &self,
        handle: CallHandle,
        packet_type: Option<PacketType>,
        payload: &[u8],
        status: Status,
        transition: impl FnOnce(&mut Call<Handler<'a>>) -> Result<()>,
    ) -> Result<()> {
        self.endpoint.check_payload(payload)?;
        let call = self.endpoint.with_calls(|calls| {
            let call = calls.get_mut(handle).ok_or(Error::FailedPrecondition)?;
            transition(call)?;
            let call = *call;
            calls.remove(handle);
            Ok::<_, Error>(call)
        })?;
        let packet_type = packet_type.unwrap_or(call.call_type().terminal_packet());
        let packet = Packet::new(packet_type, call.key(), payload, Some(status));
        self.endpoint.send(&packet).inspect_err(|e| {
            warn!("RPC[server]: final packet for {} lost: {e}", call.key());
        })
    }

    /// Force-close every active call; each handler sees `on_closed(Aborted)`.
    pub fn abort_all(&self) -> usize {
        let calls = self.endpoint.take_all();
        if !calls.is_empty() {
            info!("RPC[server]: aborting {} active call(s)", calls.len());
        }
        for call in &calls {
            call.handler().on_closed(&call.info(), Status::Aborted);
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

impl<const N: usize> Responder for Server<'_, N> {
    fn respond(&self, handle: CallHandle, payload: &[u8], status: Status) -> Result<()> {
        self.close_and_send(handle, Some(PacketType::Response), payload, status, |c| {
            c.respond()
        })
    }

    fn write(&self, handle: CallHandle, payload: &[u8]) -> Result<()> {
        self.endpoint.check_payload(payload)?;
        let key = self.endpoint.with_calls(|calls| {
            let call = calls.get(handle).ok_or(Error::FailedPrecondition)?;
            call.check_server_write()?;
            Ok::<_, Error>(call.key())
        })?;
        let packet = Packet::new(PacketType::Response, key, payload, None);
        self.endpoint.send(&packet).inspect_err(|e| {
            if self.endpoint.with_calls(|calls| calls.remove(handle)).is_some() {
                warn!("RPC[server]: aborting {key}: {e}");
            }
        })
    }

    fn finish(&self, handle: CallHandle, status: Status) -> Result<()> {
        self.close_and_send(handle, None, &[], status, Call::close)
    }

    fn fail(&self, handle: CallHandle, status: Status) -> Result<()> {
        self.close_and_send(handle, Some(PacketType::ServerError), &[], status, Call::close)
    }

    fn is_active(&self, handle: CallHandle) -> bool {
        self.endpoint.with_calls(|calls| calls.get(handle).is_some())
    }
}

impl<const N: usize> Drop for Server<'_, N> {
    fn drop(&mut self) {
        self.abort_all();
    }
}

// ── Tests ────────────────────────────────────────────────────
