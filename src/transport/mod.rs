//! Transport gateway: the wire protocol spoken with the running engine.
//!
//! - [`codec`]: bit-exact topic frames, parameter escaping, reply decoding.
//! - [`gateway`]: protocol session, outbound topic calls, inbound bridge
//!   dispatch with API-version gating.
//! - [`server`]: loopback listener delivering bridge commands to the gateway.

pub mod codec;
pub mod gateway;
pub mod server;

pub use codec::TopicCommand;
pub use gateway::{BridgeEvent, BridgeOutcome, ProtocolSession, TransportGateway};
pub use server::BridgeServer;
