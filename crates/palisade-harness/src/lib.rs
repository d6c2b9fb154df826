//! Test harness for the session layer.
//!
//! Provides deterministic, dependency-free stand-ins for every external
//! collaborator the core consumes: simulated pairwise and group ratchet
//! engines, an in-memory key directory with one-time-key consumption, a
//! static token provider, and a manually driven clock. None of the
//! simulations are cryptographically meaningful; they exist so integration
//! tests can exercise ordering, epochs, rotation, and persistence without a
//! real engine or service.

pub mod clock;
pub mod directory;
pub mod sim_group;
pub mod sim_ratchet;

pub use clock::ManualClock;
pub use directory::{MemoryKeyDirectory, StaticTokenProvider};
pub use sim_group::{SimGroupRatchet, SimGroupRatchetProvider};
pub use sim_ratchet::{SimRatchetCrypto, SimRatchetEngine, public_from_private};
