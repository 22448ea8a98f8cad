use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use super::NbdError;

struct PortState {
    free: BTreeSet<u16>,
    owners: HashMap<String, u16>,
}

/// Bounded pool of TCP ports for qemu-nbd servers, keyed by owner so every
/// job-termination path can release without knowing the port number.
pub struct PortAllocator {
    inner: Mutex<PortState>,
}

impl PortAllocator {
    /// Pool over the inclusive range `[start, end]`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            inner: Mutex::new(PortState {
                free: (start..=end).collect(),
                owners: HashMap::new(),
            }),
        }
    }

    /// Pop the lowest free port for `owner_key`. Re-allocating for an owner
    /// that already holds a port returns the held port.
    pub fn allocate(&self, owner_key: &str) -> Result<u16, NbdError> {
        let mut state = self.inner.lock();

        if let Some(&held) = state.owners.get(owner_key) {
            return Ok(held);
        }

        let port = *state.free.iter().next().ok_or(NbdError::PortsExhausted)?;
        state.free.remove(&port);
        state.owners.insert(owner_key.to_string(), port);
        Ok(port)
    }

    /// Return the owner's port to the free set. Idempotent.
    pub fn release(&self, owner_key: &str) {
        let mut state = self.inner.lock();
        if let Some(port) = state.owners.remove(owner_key) {
            state.free.insert(port);
        }
    }

    /// Ports currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.lock().owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_port_first() {
        let pool = PortAllocator::new(10100, 10102);
        assert_eq!(pool.allocate("job1/0").unwrap(), 10100);
        assert_eq!(pool.allocate("job1/1").unwrap(), 10101);
        assert_eq!(pool.allocate("job2/0").unwrap(), 10102);
    }

    #[test]
    fn exhaustion_then_release_recovers() {
        let pool = PortAllocator::new(10100, 10101);
        pool.allocate("a").unwrap();
        pool.allocate("b").unwrap();
        assert!(matches!(pool.allocate("c"), Err(NbdError::PortsExhausted)));

        pool.release("a");
        assert_eq!(pool.allocate("c").unwrap(), 10100);
    }

    #[test]
    fn release_is_idempotent() {
        let pool = PortAllocator::new(10100, 10100);
        let port = pool.allocate("a").unwrap();
        pool.release("a");
        pool.release("a");
        assert_eq!(pool.allocate("b").unwrap(), port);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn repeated_allocate_returns_held_port() {
        let pool = PortAllocator::new(10100, 10105);
        let first = pool.allocate("a").unwrap();
        assert_eq!(pool.allocate("a").unwrap(), first);
        assert_eq!(pool.in_use(), 1);
    }
}
