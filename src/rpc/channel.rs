//! Channels — identified output sinks for encoded packets.
//!
//! Concrete outputs live outside this crate:
//! - UART serial (HDLC or length-prefix framed)
//! - BLE GATT characteristic (notify)
//! - TCP socket (over WiFi)
//! - in-process loopback (tests)
//!
//! Endpoints see only [`ChannelOutput`]; a new link type plugs in
//! without touching call routing.

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::warn;

use crate::error::{Error, Result};
use crate::map::{BoundedMap, FixedMap};

/// Channel id reserved as "no channel".
pub const INVALID_CHANNEL_ID: u32 = 0;

/// Failure reported by a transport write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The link is down or the peer disconnected.
    Closed,
    /// The transport cannot accept the packet right now.
    WouldBlock,
    /// Driver or hardware error.
    Device,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "link closed"),
            Self::WouldBlock => write!(f, "would block"),
            Self::Device => write!(f, "device error"),
        }
    }
}

/// Byte-oriented send capability for one channel.
///
/// `write` receives exactly one complete encoded packet; framing, if the
/// transport needs any, is the implementation's job. Endpoints never call
/// `write` while holding their registry lock, so an implementation may
/// block or feed a peer endpoint synchronously.
pub trait ChannelOutput: Sync {
    fn write(&self, packet: &[u8]) -> core::result::Result<(), IoError>;
}

/// An output that discards all writes.
/// Useful as a placeholder when no peer is attached.
pub struct NullOutput;

impl ChannelOutput for NullOutput {
    fn write(&self, _packet: &[u8]) -> core::result::Result<(), IoError> {
        Ok(())
    }
}

/// A registered channel: id plus a borrowed output.
#[derive(Clone, Copy)]
pub struct Channel<'c> {
    id: u32,
    output: &'c dyn ChannelOutput,
}

impl<'c> Channel<'c> {
    pub fn new(id: u32, output: &'c dyn ChannelOutput) -> Self {
        Self { id, output }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Write an encoded packet. Transport failures surface as
    /// [`Error::Aborted`].
    pub fn send(&self, packet: &[u8]) -> Result<()> {
        self.output.write(packet).map_err(|e| {
            warn!("RPC[ch{}]: write failed: {}", self.id, e);
            Error::Aborted
        })
    }
}

impl fmt::Debug for Channel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Lookup capability endpoints use to resolve a channel id.
pub trait ChannelLookup: Sync {
    fn find_channel(&self, id: u32) -> Option<Channel<'_>>;
}

// ── Channel registry ─────────────────────────────────────────

type ChannelMap<'c, const N: usize> = FixedMap<u32, &'c dyn ChannelOutput, N>;

/// Fixed-capacity table of channels, shared by clients and servers.
///
/// The registry owns the id → output mapping; endpoints hold a
/// non-owning reference to it.
pub struct ChannelRegistry<'c, const N: usize> {
    channels: Mutex<CriticalSectionRawMutex, RefCell<ChannelMap<'c, N>>>,
}

impl<'c, const N: usize> ChannelRegistry<'c, N> {
    pub const fn new() -> Self {
        Self {
            channels: Mutex::new(RefCell::new(FixedMap::new())),
        }
    }

    /// Register `output` under `id`.
    ///
    /// Fails with [`Error::InvalidArgument`] for id 0,
    /// [`Error::AlreadyExists`] for a duplicate id and
    /// [`Error::ResourceExhausted`] when the table is full.
    pub fn register(&self, id: u32, output: &'c dyn ChannelOutput) -> Result<()> {
        if id == INVALID_CHANNEL_ID {
            return Err(Error::InvalidArgument);
        }
        self.channels
            .lock(|c| c.borrow_mut().try_insert(id, output))
    }

    pub fn unregister(&self, id: u32) -> Result<()> {
        self.channels
            .lock(|c| c.borrow_mut().remove(&id))
            .map(|_| ())
            .ok_or(Error::ChannelNotFound)
    }

    /// Swap the output bound to an existing channel id.
    pub fn replace(&self, id: u32, output: &'c dyn ChannelOutput) -> Result<()> {
        self.channels.lock(|c| {
            let mut map = c.borrow_mut();
            map.remove(&id).ok_or(Error::ChannelNotFound)?;
            map.try_insert(id, output)
        })
    }

    pub fn find(&self, id: u32) -> Option<Channel<'c>> {
        self.channels
            .lock(|c| c.borrow().get(&id).map(|output| Channel::new(id, *output)))
    }

    /// Send on channel `id`, failing with [`Error::ChannelNotFound`] rather
    /// than dropping data when the id is unknown.
    pub fn send(&self, id: u32, packet: &[u8]) -> Result<()> {
        self.find(id).ok_or(Error::ChannelNotFound)?.send(packet)
    }

    pub fn len(&self) -> usize {
        self.channels.lock(|c| c.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for ChannelRegistry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ChannelLookup for ChannelRegistry<'_, N> {
    fn find_channel(&self, id: u32) -> Option<Channel<'_>> {
        self.find(id)
    }
}

// ── Tests ────────────────────────────────────────────────────
