//! Provider adapters.
//!
//! Production adapters (HTTP, streaming, retry policy) live outside the
//! runtime core; this module carries the scripted [`mock::MockProvider`]
//! used throughout the test suite.

pub mod mock;

pub use mock::{MockProvider, MockTurn};
