//! Error types for the routing table, wire codec, and discovery protocol.

use thiserror::Error;

use crate::core::Contact;

/// Errors returned by [`crate::routing::RoutingTable::update`].
///
/// Both variants are local and recoverable; neither should stop a caller's
/// loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The target bucket is at capacity and could not be split.
    ///
    /// Carries the least-recently-seen occupant so the caller can decide
    /// whether to evict it.
    #[error("routing table bucket {bucket} is full")]
    BucketFull { bucket: usize, least_recent: Contact },

    /// The local identifier never enters its own table.
    #[error("cannot insert the local identifier into its own routing table")]
    SelfEntry,
}

/// Wire encoding and decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),

    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),

    #[error("string is not valid utf-8")]
    InvalidUtf8,

    #[error("{what} length {len} exceeds maximum {max}")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Errors surfaced by the discovery protocol's caller-facing operations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// A recursive search did not resolve before the caller's deadline.
    #[error("recursive search for {0} timed out")]
    SearchTimeout(String),

    /// The search entry was swept or replaced before a result arrived.
    #[error("recursive search for {0} was abandoned")]
    SearchAbandoned(String),

    /// The mask list contains an entry that is not an IP address.
    #[error("invalid mask address {0:?}")]
    InvalidMask(String),
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
