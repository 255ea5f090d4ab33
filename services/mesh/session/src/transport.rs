//! Raw link transport consumed by mesh access connections.

use mesh_wire::BleAddress;
use std::fmt;
use thiserror::Error;

/// Link identifier issued by the transport
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkHandle(pub u32);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Outcome of handing one raw chunk to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Chunk accepted
    Success,
    /// Link buffers full, retry later
    Busy,
    /// Link unusable
    Failed,
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing answers at the address
    #[error("no device at {0}")]
    Unreachable(BleAddress),
    /// Link slots exhausted
    #[error("no free link")]
    NoFreeLink,
}

/// Radio side of a node: opens links, moves raw chunks, closes links.
///
/// Opening is asynchronous; the transport reports the established link back
/// through the owner's link event handlers.
pub trait LinkTransport {
    /// Start connecting to `address`
    fn open_link(&mut self, address: BleAddress) -> Result<LinkHandle, TransportError>;

    /// Hand one raw chunk to the link
    fn send(&mut self, link: LinkHandle, data: &[u8]) -> SendResult;

    /// Close a link; the peer sees it disconnect
    fn close_link(&mut self, link: LinkHandle);
}
