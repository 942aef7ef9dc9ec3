//! Global and per-IP active-connection accounting.
//!
//! `try_increment` is the only admission path: it is a single locked section
//! that checks both limits and increments both counters, so concurrent
//! admissions cannot race past the caps (TOCTOU-free, per spec.md §4.2.1 and
//! §8 property 1).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRefusal {
    GlobalCapacity,
    PerIpCapacity,
}

pub struct ConnectionRegistry {
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    active: AtomicU64,
    total: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            per_ip: Mutex::new(HashMap::new()),
            active: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Atomic check-and-increment. On success, both `active` and the per-IP
    /// count are bumped and `total` advances; on refusal nothing changes.
    pub fn try_increment(
        &self,
        ip: IpAddr,
        max_global: usize,
        max_per_ip: usize,
    ) -> Result<(), AdmissionRefusal> {
        let mut per_ip = self.per_ip.lock().unwrap();
        let active = self.active.load(Ordering::SeqCst) as usize;
        if active >= max_global {
            return Err(AdmissionRefusal::GlobalCapacity);
        }
        let count = per_ip.get(&ip).copied().unwrap_or(0);
        if count >= max_per_ip {
            return Err(AdmissionRefusal::PerIpCapacity);
        }
        per_ip.insert(ip, count + 1);
        drop(per_ip);
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Release a connection previously admitted via `try_increment`. Removes
    /// the IP entry entirely once its count reaches zero.
    pub fn decrement(&self, ip: IpAddr) {
        let mut per_ip = self.per_ip.lock().unwrap();
        if let Some(count) = per_ip.get_mut(&ip) {
            if *count <= 1 {
                per_ip.remove(&ip);
            } else {
                *count -= 1;
            }
        }
        drop(per_ip);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn per_ip_count(&self, ip: IpAddr) -> usize {
        self.per_ip.lock().unwrap().get(&ip).copied().unwrap_or(0)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
