//! Unified error and status types for the RPC engine.
//!
//! Two vocabularies live here:
//!
//! - [`Error`] — a local failure returned synchronously from an API call
//!   (`invoke`, `write`, channel registration, ...).
//! - [`Status`] — the outcome code carried on terminal wire packets and
//!   delivered to completion callbacks.
//!
//! Both are `Copy` so they can cross the lock boundary and be handed to
//! callbacks without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Local errors
// ---------------------------------------------------------------------------

/// Every fallible engine operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Inbound bytes did not decode as a packet.
    MalformedPacket,
    /// No channel is registered under the requested id.
    ChannelNotFound,
    /// An entry with the same identity is already registered.
    AlreadyExists,
    /// A fixed-capacity table or buffer is full.
    ResourceExhausted,
    /// Unknown service or method.
    NotFound,
    /// The call was force-closed (teardown, channel I/O failure).
    Aborted,
    /// The call was cancelled.
    Cancelled,
    /// The operation is not valid in the call's current state
    /// (already closed, wrong call type, stream already ended).
    FailedPrecondition,
    /// An argument is out of range (zero channel id, bad config value, ...).
    InvalidArgument,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedPacket => write!(f, "malformed packet"),
            Self::ChannelNotFound => write!(f, "channel not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::NotFound => write!(f, "not found"),
            Self::Aborted => write!(f, "aborted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl core::error::Error for Error {}

// ---------------------------------------------------------------------------
// Wire status codes
// ---------------------------------------------------------------------------

/// Canonical RPC status codes, encoded as varints on terminal packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Status {
    /// Decode a numeric status. Codes this build does not know map to
    /// [`Status::Unknown`] so newer peers never break decoding.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        match e {
            Error::MalformedPacket => Self::DataLoss,
            Error::ChannelNotFound => Self::Unavailable,
            Error::AlreadyExists => Self::AlreadyExists,
            Error::ResourceExhausted => Self::ResourceExhausted,
            Error::NotFound => Self::NotFound,
            Error::Aborted => Self::Aborted,
            Error::Cancelled => Self::Cancelled,
            Error::FailedPrecondition => Self::FailedPrecondition,
            Error::InvalidArgument => Self::InvalidArgument,
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
