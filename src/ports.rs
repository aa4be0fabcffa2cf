//! Host-port allocation for deployments

use crate::cache::LookupCache;
use crate::error::Error;
use crate::store::Database;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Picks free host-side ports in a configured range.
///
/// Collisions are screened three ways before a port is handed out: the
/// negative cache (ports recently seen taken, or just allocated and not yet
/// persisted), the persisted records, and an actual OS bind probe.
pub struct PortAllocator {
    store: Arc<Database>,
    cache: Arc<LookupCache>,
    start: u16,
    end: u16,
    max_attempts: u32,
    /// Next port to try assigning
    cursor: AtomicU16,
}

impl PortAllocator {
    pub fn new(
        store: Arc<Database>,
        cache: Arc<LookupCache>,
        start: u16,
        end: u16,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            cache,
            start,
            end,
            max_attempts,
            cursor: AtomicU16::new(start),
        }
    }

    /// Allocate a free host port.
    ///
    /// The returned port carries a short-TTL reservation marker so a
    /// concurrent allocation cannot hand it out again before the deployment
    /// record lands in the store.
    pub fn allocate(&self) -> Result<u16, Error> {
        for _ in 0..self.max_attempts {
            let port = self.cursor.fetch_add(1, Ordering::SeqCst);

            // Wrap around if we ran off the range
            if port >= self.end || port < self.start {
                self.cursor.store(self.start, Ordering::SeqCst);
                continue;
            }

            if self.cache.port_reserved(port) {
                continue;
            }

            match self.store.port_in_use(port) {
                Ok(true) => {
                    // remember the collision so the next pass skips the
                    // store round-trip
                    self.cache.reserve_port(port);
                    continue;
                }
                Ok(false) => {}
                Err(e) => return Err(Error::Internal(e)),
            }

            if !is_port_bindable(port) {
                continue;
            }

            self.cache.reserve_port(port);
            debug!(port, "Allocated host port");
            return Ok(port);
        }

        Err(Error::ResourceExhausted {
            attempts: self.max_attempts,
            start: self.start,
            end: self.end,
        })
    }
}

/// Check that the OS will actually let us bind the port
fn is_port_bindable(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}
