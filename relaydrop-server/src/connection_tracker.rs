//! Connection limiting for the relay listener
//!
//! Each accepted socket holds a slot until its connection task ends. Slots are
//! counted per remote IP and in total, so neither a single host nor a flood
//! of hosts can exhaust the relay's sockets.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Counts {
    per_ip: HashMap<IpAddr, usize>,
    total: usize,
}

/// Tracks live relay connections
///
/// A limit of 0 means unlimited.
#[derive(Debug)]
pub struct ConnectionTracker {
    counts: Arc<Mutex<Counts>>,
    max_per_ip: usize,
    max_total: usize,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new(max_per_ip: usize, max_total: usize) -> Self {
        Self {
            counts: Arc::new(Mutex::new(Counts::default())),
            max_per_ip,
            max_total,
        }
    }

    /// Try to take a slot for a connection from `ip`
    ///
    /// Returns `None` if either limit is reached. The slot is released when
    /// the returned guard is dropped.
    pub fn try_acquire(&self, ip: IpAddr) -> Option<ConnectionGuard> {
        let mut counts = self.counts.lock().expect("connection tracker lock");
        if self.max_total > 0 && counts.total >= self.max_total {
            return None;
        }
        let count = counts.per_ip.entry(ip).or_insert(0);
        if self.max_per_ip > 0 && *count >= self.max_per_ip {
            return None;
        }
        *count += 1;
        counts.total += 1;

        Some(ConnectionGuard {
            ip,
            counts: self.counts.clone(),
        })
    }

    /// Number of live connections
    pub fn active(&self) -> usize {
        self.counts.lock().expect("connection tracker lock").total
    }
}

/// Releases a connection slot when dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    ip: IpAddr,
    counts: Arc<Mutex<Counts>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().expect("connection tracker lock");
        counts.total = counts.total.saturating_sub(1);
        if let Some(count) = counts.per_ip.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.per_ip.remove(&self.ip);
            }
        }
    }
}
