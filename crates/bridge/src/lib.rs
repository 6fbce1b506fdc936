//! Host side of the embedded-application bridge.
//!
//! A package is a WebAssembly module that runs in its own isolation scope:
//! a dedicated engine, a compiled module and a per-instance store, so two
//! scopes built from the same file never share guest state. The host talks
//! to the running guest through an [`Exchanger`]:
//!
//! 1. Resolve the package with [`Package::resolve`].
//! 2. Build the bridge with [`create_isolated`], which starts the guest on
//!    its own runtime thread and blocks until its entry point returns.
//! 3. Call [`Exchanger::send`] / [`Exchanger::receive`] on every tick.
//! 4. Call [`Exchanger::close`] when the host stops scheduling.

mod internal;

pub mod config;
pub mod error;
pub mod exchanger;
pub mod factory;
pub mod message;
pub mod package;
pub mod processor;
pub mod runner;
pub mod scope;

pub const TRACE_TARGET_GUEST: &str = "embed_bridge::guest";

/// Name of the direct channel a guest publishes to receive host messages.
pub const INBOUND: &str = "inbound";
/// Name of the queue channel a guest publishes to hand results to the host.
pub const OUTBOUND: &str = "outbound";

pub use config::{BridgeConfig, parse_duration};
pub use error::{Error, Result};
pub use exchanger::{Bridge, EXCHANGER_VERSION, Exchanger};
pub use factory::create_isolated;
pub use message::{HeaderValue, Headers, Message, Payload};
pub use package::{Package, probe_entry_point};
pub use processor::{
    BridgeProcessor, FlowRecord, MemorySession, ProvenanceEvent, Relationship, Session, Trigger,
};
pub use runner::{ApplicationHandle, Runner, RunnerState};
pub use scope::{IsolationOptions, IsolationScope, Resolution, ScopeId};
