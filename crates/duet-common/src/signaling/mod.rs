//! Signaling: envelopes, candidate descriptors and the relay capability.

pub mod candidate;
pub mod envelope;
pub mod relay;

pub use candidate::{CandidateInfo, CandidatePayload, CandidateType};
pub use envelope::{DescriptionPayload, PeerIdentity, SignalEnvelope, SignalKind};
pub use relay::{InboundSignal, RelayAdapter, RelayConnectionState, SignalRelay, Subscription};
