use std::sync::atomic::{AtomicU32, Ordering};

use super::errors::SupervisorError;

/// Hands out local ports from a monotonically increasing counter.
///
/// Ports are never reused within a process lifetime; a restarted service
/// keeps the port of its record instead of asking for a new one.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            next: AtomicU32::new(u32::from(base)),
        }
    }

    pub fn allocate(&self) -> Result<u16, SupervisorError> {
        let candidate = self.next.fetch_add(1, Ordering::SeqCst);
        u16::try_from(candidate).map_err(|_| SupervisorError::PortsExhausted { next: candidate })
    }
}
