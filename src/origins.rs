use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

/// Remembers which agent issued a forwarded request, so the client's response
/// can find its way back. Bounded by both age and entry count.
#[derive(Debug)]
pub struct RequestOriginCache {
    ttl: Duration,
    max_entries: usize,
    origins: HashMap<String, (String, Instant)>,
    order: VecDeque<(String, Instant)>,
}

impl RequestOriginCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            origins: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn record(&mut self, request_id: &str, agent_id: &str, now: Instant) {
        self.evict(now);
        self.origins
            .insert(request_id.to_string(), (agent_id.to_string(), now));
        self.order.push_back((request_id.to_string(), now));

        while self.origins.len() > self.max_entries {
            let Some((old_id, ts)) = self.order.pop_front() else {
                break;
            };
            self.remove_if_stamped(&old_id, ts);
        }
    }

    /// Remove and return the origin; responses are routed once.
    pub fn take(&mut self, request_id: &str, now: Instant) -> Option<String> {
        self.evict(now);
        self.origins.remove(request_id).map(|(agent, _)| agent)
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, ts)) = self.order.front().cloned() {
            if now.duration_since(ts) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.remove_if_stamped(&id, ts);
        }
    }

    // A re-recorded id leaves an older queue entry behind; only drop the map
    // entry when it still carries the queue entry's timestamp.
    fn remove_if_stamped(&mut self, id: &str, ts: Instant) {
        if self.origins.get(id).is_some_and(|(_, stamped)| *stamped == ts) {
            self.origins.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}
