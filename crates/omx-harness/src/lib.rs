//! Test harness for the OMX connection service.
//!
//! In-memory stand-ins for the collaborators `omx-core` expects from its
//! environment, plus a scripted end-to-end scenario.
//!
//! # Components
//!
//! - [`LoopbackChannel`]: transport whose remote side is a scripted broker
//!   that answers connect requests per [`BrokerPolicy`] and echoes RAW
//!   traffic back to the sender
//! - [`TableMapper`]: memory map built from explicit windows
//! - [`FakePinner`]: pinner over pre-declared scatter lists
//! - [`scenario`]: open, connect, exchange, crash and recover, driven by a
//!   seeded RNG (also what the `omx-sim` binary runs)
//!
//! Deliveries run on a Tokio task, so tests use
//! `#[tokio::test(start_paused = true)]` and let the handshake timeout
//! elapse in virtual time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loopback;
pub mod memory;
pub mod scenario;

pub use loopback::{BrokerPolicy, FIRST_LOCAL_ADDR, LoopbackChannel, SentMessage};
pub use memory::{FakePinner, TableMapper, Window};
pub use scenario::{ScenarioConfig, ScenarioError, ScenarioReport};
