//! Client-local half of a two-party call: who offers, how negotiation and
//! candidate ordering are enforced, how the outbound bitrate adapts, and how
//! everything is released when the call ends.
//!
//! Media capture and the peer connection are reached through the traits in
//! [`media`]. [`loopback`] is an in-process backend for tests and demos; the
//! `webrtc-adapter` feature provides one backed by webrtc-rs.

pub mod bitrate;
pub mod candidates;
pub mod config;
pub mod error;
pub mod loopback;
pub mod media;
pub mod negotiation;
pub mod role;
pub mod session;
pub mod signaling;
#[cfg(feature = "webrtc-adapter")]
pub mod webrtc_peer;

pub use bitrate::{BitrateController, BitratePolicy, NetworkQuality};
pub use config::CallConfig;
pub use error::{CallError, NegotiationError};
pub use negotiation::{NegotiationState, Negotiator};
pub use role::{Role, RoleDecision, RoleResolver};
pub use session::{spawn_call, CallDeps, CallHandle, CallSnapshot, MediaFlags};
pub use signaling::{SignalingChannel, SignalingClient};
