use super::*;

/// Identity of a user timer. Setting a timer with the same identity replaces
/// the previous one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub transform_id: String,
    pub family: String,
    pub tag: String,
    /// Encoded user key.
    pub key: Vec<u8>,
    pub window: Window,
}

/// A registered timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub key: TimerKey,
    pub fire: EventTime,
    /// Output watermark hold; only meaningful for event-time timers.
    pub hold: EventTime,
}

/// Timers of one stage in one time domain, ordered by fire time.
///
/// Timers are sorted by `(fire, key)` in a `BTreeMap`, so due timers come out
/// in fire-time order with a deterministic tie break.
///
/// # Invariant
/// A [`TimerKey`] is registered at most once.
#[derive(Debug, Clone, Default)]
pub struct TimerService {
    by_time: BTreeMap<(EventTime, TimerKey), EventTime>,
    by_key: HashMap<TimerKey, EventTime>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer, returning the one it replaced.
    pub fn register(
        &mut self,
        key: TimerKey,
        fire: EventTime,
        hold: EventTime,
    ) -> Option<PendingTimer> {
        let replaced = self.delete(&key);
        self.by_time.insert((fire, key.clone()), hold);
        self.by_key.insert(key, fire);
        replaced
    }

    /// Cancel a timer. Returns it if it was registered.
    pub fn delete(&mut self, key: &TimerKey) -> Option<PendingTimer> {
        let fire = self.by_key.remove(key)?;
        let hold = self.by_time.remove(&(fire, key.clone()))?;
        Some(PendingTimer {
            key: key.clone(),
            fire,
            hold,
        })
    }

    /// Drain timers with `fire <= now` whose user key passes `eligible`,
    /// in ascending fire order.
    pub fn drain_due(
        &mut self,
        now: EventTime,
        eligible: impl Fn(&[u8]) -> bool,
    ) -> Vec<PendingTimer> {
        let due: Vec<TimerKey> = self
            .by_time
            .range(..(now.saturating_add(1), min_key()))
            .filter(|((fire, key), _)| *fire <= now && eligible(&key.key))
            .map(|((_, key), _)| key.clone())
            .collect();
        due.iter().filter_map(|key| self.delete(key)).collect()
    }

    pub fn contains(&self, key: &TimerKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Whether any timer is registered for the user key.
    #[cfg(test)]
    pub fn has_user_key(&self, user_key: &[u8]) -> bool {
        self.by_key.keys().any(|k| k.key == user_key)
    }

    /// Whether any timer is registered for the user key in the window.
    pub fn has_window(&self, user_key: &[u8], window: &Window) -> bool {
        self.by_key
            .keys()
            .any(|k| k.key == user_key && k.window == *window)
    }

    /// Return the fire time of the earliest pending timer, or `None`.
    pub fn next_timer(&self) -> Option<EventTime> {
        self.by_time.keys().next().map(|(fire, _)| *fire)
    }

    /// Iterate pending timers in fire order.
    pub fn iter(&self) -> impl Iterator<Item = PendingTimer> + '_ {
        self.by_time.iter().map(|((fire, key), hold)| PendingTimer {
            key: key.clone(),
            fire: *fire,
            hold: *hold,
        })
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Smallest possible key, used as an exclusive bound for range scans.
fn min_key() -> TimerKey {
    TimerKey {
        transform_id: String::new(),
        family: String::new(),
        tag: String::new(),
        key: Vec::new(),
        window: Window::Global,
    }
}
