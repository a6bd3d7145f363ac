//! Endpoint core — the lock-owning call table shared by client and server.
//!
//! Each endpoint owns exactly one lock. Every registry mutation (insert,
//! transition, remove) happens inside it; user callbacks and transport
//! writes happen after it is released.
//!
//! ```text
//!  caller thread                 lock held        lock released
//!  ─────────────                 ─────────        ─────────────
//!  process_incoming_packet ──▶  find + transition ──▶ callback
//!  invoke / respond / write ──▶  insert / remove   ──▶ encode + write
//! ```
//!
//! Calls live in a slot arena. A [`CallHandle`] names a slot, the
//! generation it was issued for and the key of the call it was issued to.
//! A handle kept past the call's close can never reach a newer call that
//! reuses the slot, even once the generation counter wraps.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Vec;
use log::warn;

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::map::BoundedMap;

use super::call::{Call, CallKey};
use super::channel::{Channel, ChannelLookup};
use super::packet::Packet;

/// Stable reference to one call in a [`CallTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle {
    index: usize,
    generation: u32,
    key: CallKey,
}

impl CallHandle {
    /// Key of the call this handle was issued for.
    pub fn key(&self) -> CallKey {
        self.key
    }
}

struct Slot<H> {
    generation: u32,
    call: Option<Call<H>>,
}

impl<H: Copy> Slot<H> {
    fn handle(&self, index: usize) -> Option<CallHandle> {
        self.call.as_ref().map(|c| CallHandle {
            index,
            generation: self.generation,
            key: c.key(),
        })
    }

    /// Whether `handle` still names the call held here.
    fn matches(&self, handle: CallHandle) -> bool {
        self.generation == handle.generation
            && self.call.as_ref().is_some_and(|c| c.key() == handle.key)
    }
}

// ── Call table ───────────────────────────────────────────────

/// Fixed-capacity arena of active calls.
///
/// A slot is live exactly while its call is active; removing a call bumps
/// the slot's generation.
pub struct CallTable<H, const N: usize> {
    slots: [Slot<H>; N],
    len: usize,
    next_call_id: u32,
}

impl<H: Copy, const N: usize> CallTable<H, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                call: None,
            }),
            len: 0,
            next_call_id: 1,
        }
    }

    /// Locate the active call with `key`.
    pub fn find(&self, key: &CallKey) -> Option<CallHandle> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| slot.handle(i).filter(|h| h.key == *key))
    }

    fn slot_mut(&mut self, handle: CallHandle) -> Option<&mut Slot<H>> {
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.matches(handle))
    }

    pub fn get(&self, handle: CallHandle) -> Option<&Call<H>> {
        self.slots
            .get(handle.index)
            .filter(|s| s.matches(handle))
            .and_then(|s| s.call.as_ref())
    }

    pub fn get_mut(&mut self, handle: CallHandle) -> Option<&mut Call<H>> {
        self.slot_mut(handle).and_then(|s| s.call.as_mut())
    }

    /// Insert a new active call.
    ///
    /// Fails with [`Error::AlreadyExists`] if a call with the same key is
    /// active and with [`Error::ResourceExhausted`] when every slot is in
    /// use. Existing calls are untouched on failure.
    pub fn insert(&mut self, call: Call<H>) -> Result<CallHandle> {
        if self.find(&call.key()).is_some() {
            return Err(Error::AlreadyExists);
        }
        let key = call.key();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.call.is_none())
            .ok_or(Error::ResourceExhausted)?;
        slot.call = Some(call);
        self.len += 1;
        Ok(CallHandle {
            index,
            generation: slot.generation,
            key,
        })
    }

    /// Remove the call `handle` refers to. Stale handles yield `None`.
    pub fn remove(&mut self, handle: CallHandle) -> Option<Call<H>> {
        let slot = self.slot_mut(handle)?;
        let call = slot.call.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(call)
    }

    /// Remove every active call, returning them for notification.
    pub fn drain(&mut self) -> Vec<Call<H>, N> {
        let mut drained = Vec::new();
        for slot in &mut self.slots {
            if let Some(call) = slot.call.take() {
                slot.generation = slot.generation.wrapping_add(1);
                // Cannot overflow: at most N calls are live.
                let _ = drained.push(call);
            }
        }
        self.len = 0;
        drained
    }

    /// Next client call id: monotonic, wrapping, never 0 and never an id
    /// already in use by an active call.
    pub fn allocate_call_id(&mut self) -> u32 {
        loop {
            let id = self.next_call_id;
            self.next_call_id = match self.next_call_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            let in_use = self
                .iter()
                .any(|(_, c)| c.key().call_id == id);
            if !in_use {
                return id;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CallHandle, &Call<H>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| Some((slot.handle(i)?, slot.call.as_ref()?)))
    }
}

impl<H: Copy, const N: usize> Default for CallTable<H, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Copy, const N: usize> BoundedMap<CallKey, Call<H>> for CallTable<H, N> {
    fn capacity(&self) -> usize {
        N
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, key: &CallKey) -> Option<&Call<H>> {
        self.find(key).and_then(|h| CallTable::get(self, h))
    }

    fn try_insert(&mut self, key: CallKey, value: Call<H>) -> Result<()> {
        if key != value.key() {
            return Err(Error::InvalidArgument);
        }
        self.insert(value).map(|_| ())
    }

    fn remove(&mut self, key: &CallKey) -> Option<Call<H>> {
        let handle = self.find(key)?;
        CallTable::remove(self, handle)
    }
}

// ── Diagnostics ──────────────────────────────────────────────

/// Point-in-time view of an endpoint's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointStats {
    /// Inbound packets that failed to decode.
    pub malformed_packets: u32,
    /// Well-formed packets with nowhere to go (unknown call or channel,
    /// wrong direction).
    pub dropped_packets: u32,
    pub active_calls: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct Counters {
    malformed: AtomicU32,
    dropped: AtomicU32,
}

// ── Endpoint ─────────────────────────────────────────────────

/// Shared core of [`Client`](super::client::Client) and
/// [`Server`](super::server::Server).
pub(crate) struct Endpoint<'a, H, const N: usize> {
    calls: Mutex<CriticalSectionRawMutex, RefCell<CallTable<H, N>>>,
    channels: &'a dyn ChannelLookup,
    config: RpcConfig,
    counters: Counters,
    name: &'static str,
}

impl<'a, H: Copy, const N: usize> Endpoint<'a, H, N> {
    pub(crate) fn new(
        name: &'static str,
        channels: &'a dyn ChannelLookup,
        config: RpcConfig,
    ) -> Self {
        Self {
            calls: Mutex::new(RefCell::new(CallTable::new())),
            channels,
            config,
            counters: Counters::default(),
            name,
        }
    }

    pub(crate) fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Run `f` with exclusive access to the call table.
    ///
    /// `f` must not call back into this endpoint.
    pub(crate) fn with_calls<R>(&self, f: impl FnOnce(&mut CallTable<H, N>) -> R) -> R {
        self.calls.lock(|table| f(&mut table.borrow_mut()))
    }

    pub(crate) fn channel(&self, id: u32) -> Result<Channel<'a>> {
        self.channels.find_channel(id).ok_or(Error::ChannelNotFound)
    }

    pub(crate) fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_len() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Decode inbound bytes, counting and logging failures.
    pub(crate) fn decode<'p>(&self, bytes: &'p [u8]) -> Result<Packet<'p>> {
        Packet::decode_with_limit(bytes, self.config.max_payload_len()).inspect_err(|e| {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!("RPC[{}]: dropping {}-byte packet: {}", self.name, bytes.len(), e);
        })
    }

    /// Encode `packet` into a stack buffer and write it to its channel.
    /// Never called with the lock held.
    pub(crate) fn send(&self, packet: &Packet<'_>) -> Result<()> {
        let channel = self.channel(packet.channel_id)?;
        let buf = packet.encode_to_buffer()?;
        channel.send(&buf)
    }

    pub(crate) fn note_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn active_calls(&self) -> usize {
        self.with_calls(|t| t.len())
    }

    /// Remove every active call, returning them so the caller can notify
    /// each handler after the lock is released.
    pub(crate) fn take_all(&self) -> Vec<Call<H>, N> {
        self.with_calls(CallTable::drain)
    }

    pub(crate) fn stats(&self) -> EndpointStats {
        EndpointStats {
            malformed_packets: self.counters.malformed.load(Ordering::Relaxed),
            dropped_packets: self.counters.dropped.load(Ordering::Relaxed),
            active_calls: self.active_calls(),
            capacity: N,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
