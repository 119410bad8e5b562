use thiserror::Error;

use crate::address::AgentAddress;

/// Failure to parse an [`crate::AgentAddress`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address '{0}' has no '@' separator")]
    MissingDomain(String),
    #[error("address '{0}' has an empty localpart")]
    EmptyLocal(String),
    #[error("address '{0}' has an empty domain")]
    EmptyDomain(String),
}

/// Fragmentation/reassembly failures. A malformed fragment is dropped by the
/// receiver; the affected reassembly stays incomplete until pruned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("fragment metadata key '{key}' is missing or unparsable")]
    MalformedHeader { key: &'static str },
    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("max_message_size {0} is below the minimum of {min}", min = crate::fragment::MIN_MESSAGE_SIZE)]
    MessageSizeTooSmall(usize),
}

/// Similarity computation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimilarityError {
    /// The right-hand layer set lacks a layer named by the left-hand set.
    /// Fails the single comparison, never the round.
    #[error("layer '{layer}' not present in the compared layer set")]
    MissingLayer { layer: String },
}

/// Transport-level send/receive failures. These skip the affected
/// peer/message and are never fatal to the round.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not known to this transport")]
    UnknownPeer(String),
    #[error("peer {peer} rejected the message: {reason}")]
    Rejected { peer: String, reason: String },
    #[error("transport is shut down")]
    Closed,
    #[error("http error talking to {peer}: {source}")]
    Http {
        peer: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Invalid configuration detected at construction time. Unlike every other
/// error in this crate these are fatal: the agent refuses to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_message_size {0} is too small to fragment UTF-8 payloads")]
    MessageSizeTooSmall(usize),
    #[error("max_order must be at least 1")]
    ZeroMaxOrder,
    #[error("consensus deadline must be non-zero")]
    ZeroDeadline,
    #[error("agent has no neighbours and no coordinator; nothing to converge with")]
    NoPeers,
    #[error("transport is bound to {transport}, not to the configured address {config}")]
    AddressMismatch {
        config: AgentAddress,
        transport: AgentAddress,
    },
}

/// Why a consensus round stopped collecting contributions. Deadline expiry
/// is an expected termination path, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Contributions from `max_order` distinct senders arrived.
    MaxOrder,
    /// The round deadline elapsed first.
    Deadline,
    /// The agent was asked to shut down mid-round.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::MaxOrder => "max_order",
            CloseReason::Deadline => "deadline",
            CloseReason::Shutdown => "shutdown",
        }
    }
}
