use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

/// Session used when a caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// Sessions remembered before the least recently seen one is dropped.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

#[derive(Debug, Default)]
struct Slots {
    /// session -> (topic, last seen tick)
    topics: HashMap<String, (String, u64)>,
    /// last seen tick -> session, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
}

/// Last classified topic per conversation.
///
/// Only used to report whether the topic moved between two messages of the
/// same session. Not persisted. Session ids come from clients, so at most
/// `capacity` sessions are kept; an evicted session starts over as new.
#[derive(Debug)]
pub struct TopicSessions {
    slots: Mutex<Slots>,
    capacity: usize,
}

impl Default for TopicSessions {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }
}

impl TopicSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `topic` for `session` and report whether it differs from the
    /// previous one. The first message of a session always counts as a
    /// change.
    pub fn observe(&self, session: &str, topic: &str) -> bool {
        let mut slots = self.lock();
        slots.tick += 1;
        let tick = slots.tick;

        let previous = slots
            .topics
            .insert(session.to_string(), (topic.to_string(), tick));
        match previous {
            Some((previous, seen)) => {
                slots.recency.remove(&seen);
                slots.recency.insert(tick, session.to_string());
                previous != topic
            }
            None => {
                slots.recency.insert(tick, session.to_string());
                while slots.topics.len() > self.capacity {
                    let Some((_, oldest)) = slots.recency.pop_first() else {
                        break;
                    };
                    slots.topics.remove(&oldest);
                    tracing::trace!(session = %oldest, "evicted topic session");
                }
                true
            }
        }
    }

    pub fn current(&self, session: &str) -> Option<String> {
        self.lock().topics.get(session).map(|(topic, _)| topic.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().topics.is_empty()
    }

    pub fn clear(&self) {
        let mut slots = self.lock();
        slots.topics.clear();
        slots.recency.clear();
    }

    // A panic while holding the lock cannot leave the maps half-updated.
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
