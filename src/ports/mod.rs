use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use crate::error::{HelmError, HelmResult};

/// Hands out TCP ports from a configured pool for terminal-viewer
/// processes and tracks which viewer pid owns each reservation.
///
/// A single lock guards the reservation table; the background sweep
/// reclaims ports whose bound process has exited.
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    reserved: Mutex<HashMap<u16, Option<u32>>>,
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port: max_port.max(min_port),
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves the first free, bindable port in the pool.
    pub fn acquire(&self) -> HelmResult<u16> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| HelmError::internal("port table lock poisoned"))?;

        for port in self.min_port..=self.max_port {
            if reserved.contains_key(&port) {
                continue;
            }
            if !probe_free(port) {
                continue;
            }
            reserved.insert(port, None);
            return Ok(port);
        }

        Err(HelmError::Exhausted(format!(
            "viewer port pool {}..={} drained",
            self.min_port, self.max_port
        )))
    }

    /// Records the viewer process that now owns a reserved port.
    pub fn bind_pid(&self, port: u16, pid: u32) {
        if let Ok(mut reserved) = self.reserved.lock() {
            if let Some(owner) = reserved.get_mut(&port) {
                *owner = Some(pid);
            }
        }
    }

    /// Returns a port to the pool.
    pub fn release(&self, port: u16) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.remove(&port);
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .map(|r| r.contains_key(&port))
            .unwrap_or(false)
    }

    /// Releases every port whose owning process has exited. Ports with no
    /// recorded pid are left alone (the viewer may still be starting).
    /// Returns the reclaimed ports.
    pub fn sweep(&self) -> Vec<u16> {
        let mut reclaimed = Vec::new();
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.retain(|port, owner| match owner {
                Some(pid) if !process_alive(*pid) => {
                    reclaimed.push(*port);
                    false
                }
                _ => true,
            });
        }
        if !reclaimed.is_empty() {
            tracing::info!(ports = ?reclaimed, "reclaimed viewer ports from dead processes");
        }
        reclaimed
    }
}

/// Bind probe: a port is free when the loopback bind succeeds.
fn probe_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Signal-0 liveness check.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_within_bounds() {
        let allocator = PortAllocator::new(47500, 47520);
        let port = allocator.acquire().unwrap();
        assert!((47500..=47520).contains(&port));
        assert!(allocator.is_reserved(port));
    }

    #[test]
    fn test_no_double_assignment() {
        let allocator = PortAllocator::new(47530, 47534);
        let mut seen = std::collections::HashSet::new();
        while let Ok(port) = allocator.acquire() {
            assert!(seen.insert(port), "port {} handed out twice", port);
        }
        assert!(!seen.is_empty());
    }

    #[test]
    fn test_exhaustion() {
        let allocator = PortAllocator::new(47540, 47541);
        let _a = allocator.acquire();
        let _b = allocator.acquire();
        match allocator.acquire() {
            Err(HelmError::Exhausted(_)) => {}
            other => panic!("expected Exhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_release_returns_port() {
        let allocator = PortAllocator::new(47550, 47550);
        let port = allocator.acquire().unwrap();
        assert!(allocator.acquire().is_err());
        allocator.release(port);
        assert_eq!(allocator.acquire().unwrap(), port);
    }

    #[test]
    fn test_sweep_reclaims_dead_owner() {
        let allocator = PortAllocator::new(47560, 47561);
        let port = allocator.acquire().unwrap();
        // far beyond any real pid table
        allocator.bind_pid(port, 999_999_999);
        let reclaimed = allocator.sweep();
        assert_eq!(reclaimed, vec![port]);
        assert!(!allocator.is_reserved(port));
    }

    #[test]
    fn test_sweep_keeps_unbound_reservations() {
        let allocator = PortAllocator::new(47570, 47571);
        let port = allocator.acquire().unwrap();
        assert!(allocator.sweep().is_empty());
        assert!(allocator.is_reserved(port));
    }
}
