use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Probes sent but not yet resolved, keyed by the probed port.
///
/// Entries expire once their age reaches the ttl. Expiry is applied before
/// every lookup, so no accessor ever observes an entry past its ttl and
/// `is_empty` means every probe was either answered or timed out.
///
/// Send times never decrease, so `order` is sorted by age and eviction
/// only touches the entries that actually expired. Removed or replaced
/// entries stay in `order` until they reach the front.
#[derive(Debug)]
pub struct Ledger {
    ttl: Duration,
    entries: HashMap<u16, Instant>,
    order: VecDeque<(u16, Instant)>,
}

impl Ledger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[inline]
    fn is_live(&self, port: u16, sent: Instant) -> bool {
        self.entries.get(&port) == Some(&sent)
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(port, sent)) = self.order.front() {
            let expired = now.saturating_duration_since(sent) >= self.ttl;
            if !expired && self.is_live(port, sent) {
                break;
            }
            if self.is_live(port, sent) {
                self.entries.remove(&port);
            }
            self.order.pop_front();
        }
    }

    pub fn put(&mut self, port: u16, sent: Instant) {
        debug_assert!(self.order.back().map_or(true, |&(_, last)| last <= sent));
        self.entries.insert(port, sent);
        self.order.push_back((port, sent));
    }

    pub fn get_at(&mut self, port: u16, now: Instant) -> Option<Instant> {
        self.evict(now);
        self.entries.get(&port).copied()
    }

    #[cfg(test)]
    pub fn get(&mut self, port: u16) -> Option<Instant> {
        self.get_at(port, Instant::now())
    }

    #[cfg(test)]
    pub fn contains_at(&mut self, port: u16, now: Instant) -> bool {
        self.get_at(port, now).is_some()
    }

    #[cfg(test)]
    pub fn contains(&mut self, port: u16) -> bool {
        self.contains_at(port, Instant::now())
    }

    pub fn remove_at(&mut self, port: u16, now: Instant) -> Option<Instant> {
        self.evict(now);
        self.entries.remove(&port)
    }

    #[cfg(test)]
    pub fn remove(&mut self, port: u16) -> Option<Instant> {
        self.remove_at(port, Instant::now())
    }

    pub fn len_at(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.entries.len()
    }

    pub fn len(&mut self) -> usize {
        self.len_at(Instant::now())
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Time left until the oldest live entry expires.
    pub fn next_expiry_at(&mut self, now: Instant) -> Option<Duration> {
        // Eviction leaves a live entry at the front, or nothing.
        self.evict(now);
        self.order
            .front()
            .map(|&(_, sent)| self.ttl.saturating_sub(now.saturating_duration_since(sent)))
    }

    pub fn next_expiry(&mut self) -> Option<Duration> {
        self.next_expiry_at(Instant::now())
    }

    pub fn destroy(mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
