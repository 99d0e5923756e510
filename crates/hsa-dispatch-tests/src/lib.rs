//! Test support for the dispatch pipeline: a resource-ledger mock runtime and fixtures.

pub mod fixtures;
pub mod mock;

pub use mock::{MockKernel, MockRuntime, ObservedPacket, ResourceCounts};
