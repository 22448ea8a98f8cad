use parking_lot::Mutex;
use std::collections::BTreeSet;

use super::NbdError;

/// Pool of NBD client devices (`/dev/nbdX`) reserved for restore mounts,
/// disjoint from anything the backup data plane touches.
pub struct DevicePool {
    inner: Mutex<BTreeSet<String>>,
}

impl DevicePool {
    pub fn new(devices: &[String]) -> Self {
        Self {
            inner: Mutex::new(devices.iter().cloned().collect()),
        }
    }

    /// Take the first free device.
    pub fn allocate(&self) -> Result<String, NbdError> {
        let mut free = self.inner.lock();
        let device = free.iter().next().cloned().ok_or(NbdError::DevicesExhausted)?;
        free.remove(&device);
        Ok(device)
    }

    /// Return a device to the pool. Idempotent.
    pub fn release(&self, device: &str) {
        self.inner.lock().insert(device.to_string());
    }

    /// Remove a specific device from the free set, for adopting mounts that
    /// survived a restart.
    pub fn claim(&self, device: &str) -> bool {
        self.inner.lock().remove(device)
    }

    pub fn available(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/dev/nbd{}", i)).collect()
    }

    #[test]
    fn allocates_in_order_and_exhausts() {
        let pool = DevicePool::new(&devices(2));
        assert_eq!(pool.allocate().unwrap(), "/dev/nbd0");
        assert_eq!(pool.allocate().unwrap(), "/dev/nbd1");
        assert!(matches!(pool.allocate(), Err(NbdError::DevicesExhausted)));
    }

    #[test]
    fn release_recovers_device() {
        let pool = DevicePool::new(&devices(1));
        let dev = pool.allocate().unwrap();
        pool.release(&dev);
        assert_eq!(pool.allocate().unwrap(), dev);
    }

    #[test]
    fn claim_removes_specific_device() {
        let pool = DevicePool::new(&devices(3));
        assert!(pool.claim("/dev/nbd1"));
        assert!(!pool.claim("/dev/nbd1"));
        assert_eq!(pool.allocate().unwrap(), "/dev/nbd0");
        assert_eq!(pool.allocate().unwrap(), "/dev/nbd2");
    }
}
