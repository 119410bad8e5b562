//! Murmur Consensus Protocol
//!
//! Every agent in a murmur swarm trains a private model and periodically
//! averages selected layers with its neighbours. There is no parameter
//! server; convergence emerges from repeated pairwise exchanges.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────┐  layers    ┌───────┐  layers    ┌───────┐
//!  │Agent A│◄──────────►│Agent B│◄──────────►│Agent C│
//!  │(model)│            │(model)│            │(model)│
//!  └───────┘            └───────┘            └───────┘
//!      ▲                                         ▲
//!      └───────────── similarity ────────────────┘
//! ```
//!
//! ## Round Protocol
//! - Each round: train locally, exchange similarity vectors, pick neighbours
//! - Selected layers are sent with a reply request; peers echo theirs back
//! - A round closes on `max_order` distinct contributors or on its deadline
//! - Collected layers are averaged element-wise and imported into the model
//!
//! ## Presence
//! - Agents subscribe to each other before the first round
//! - An agent only starts once every required contact is mutual
//! - Unavailable neighbours are skipped; the round shape does not change
//!
//! ## Messaging
//! - Payloads above the substrate's size limit travel as ordered fragments
//! - Fragments reassemble in any order; a malformed fragment is dropped

pub mod address;
pub mod agent;
pub mod bootstrap;
pub mod consensus;
pub mod envelope;
pub mod error;
pub mod fragment;
pub mod model;
pub mod net;
pub mod observer;
pub mod presence;
pub mod similarity;
pub mod strategy;
pub mod transport;

pub use address::AgentAddress;
pub use agent::{Agent, AgentConfig, AgentSummary};
pub use bootstrap::{negotiate_presence, run_coordinator, BootstrapMachine, BootstrapState};
pub use consensus::{apply_consensus, Consensus, ConsensusManager};
pub use envelope::{Conversation, Envelope};
pub use error::{
    AddressError, CloseReason, ConfigError, FragmentError, SimilarityError, TransportError,
};
pub use fragment::FragmentCodec;
pub use model::{Evaluation, LayerMap, LinearModel, ModelManager};
pub use net::{HttpTransport, NodeInbox, PresenceAction, PresenceMessage, WireEnvelope};
pub use observer::{NullObserver, Observer, TracingObserver};
pub use presence::{PresenceEvent, Subscription};
pub use similarity::{EuclideanDistance, Ones, SimilarityFunction, SimilarityManager, SimilarityVector};
pub use strategy::{by_name, LayerAssignment, RandomFullShare, SelectionStrategy, SimilarityPartialShare};
pub use transport::{ChannelNetwork, ChannelTransport, Transport};
