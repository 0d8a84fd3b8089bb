//! Application state shared across request handlers.

use std::time::Duration;

use intake_engine::Engine;
use intake_storage::MemoryStorage;

/// Storage backend the server runs on.
pub(crate) type Backend = MemoryStorage;

pub(crate) struct AppState {
    pub(crate) engine: Engine<Backend>,
    /// Upper bound on one mutation, ledger write included.
    pub(crate) request_timeout: Duration,
}
