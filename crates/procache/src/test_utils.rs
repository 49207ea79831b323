//! Shared helpers for unit tests.

use parking_lot::Mutex;

use crate::events::{CacheEvent, CacheEventSink};

#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer() // Write to test output
        .try_init();
}

/// Sink that keeps every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CacheEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }
}

impl CacheEventSink for RecordingSink {
    fn on_event(&self, event: CacheEvent) {
        self.events.lock().push(event);
    }
}
