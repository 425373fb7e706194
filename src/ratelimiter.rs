use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute window of connection attempts per client IP.
///
/// A limit of 0 turns the limiter off.
pub struct RateLimiter {
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    max_per_minute: usize,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_per_minute,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_per_minute > 0
    }

    /// Records a connection from `ip`, or returns false when it is over the limit
    pub fn check_and_add(&mut self, ip: IpAddr) -> bool {
        self.check_and_add_at(ip, Instant::now())
    }

    fn check_and_add_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }

        // Forget clients whose window has fully expired
        self.connections.retain(|_, entries| {
            entries
                .back()
                .map(|&time| now.duration_since(time) <= WINDOW)
                .unwrap_or(false)
        });

        let entries = self.connections.entry(ip).or_insert_with(VecDeque::new);
        while let Some(&time) = entries.front() {
            if now.duration_since(time) > WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.max_per_minute {
            false
        } else {
            entries.push_back(now);
            true
        }
    }
}
