//! Application state for the API server.

use std::sync::Arc;
use std::time::Instant;

use homecare_memory::MemoryCoordinator;

/// Shared application state for the API server.
pub struct AppState {
    pub coordinator: Arc<MemoryCoordinator>,

    /// Server start time (for health checks)
    pub start_time: Instant,
}

impl AppState {
    pub fn new(coordinator: Arc<MemoryCoordinator>) -> Self {
        Self {
            coordinator,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
