//! Polling-based change detection
//!
//! A [`SubjectToken`] is owned by whatever can change; an [`ObserverToken`] is
//! owned by whatever consumes it. The observer asks "has this changed since I
//! last looked" by comparing counters, with no callbacks and no allocation.

/// Owned by the thing being observed.
///
/// The counter is 64 bits wide, so even at one invalidation per CPU cycle it
/// would take on the order of a century to wrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectToken {
    counter: u64,
}

/// Records the subject counter an observer last saw.
///
/// Starts at zero. A subject created with [`SubjectToken::new`] starts at one,
/// so a fresh observer is always initially out of date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverToken {
    counter: u64,
}

impl SubjectToken {
    /// A subject that every fresh observer considers changed.
    pub fn new() -> Self {
        SubjectToken { counter: 1 }
    }

    /// A subject that fresh observers consider up to date.
    pub fn new_without_invalidate() -> Self {
        SubjectToken { counter: 0 }
    }

    /// Signal that the subject has changed.
    pub fn invalidate(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }

    pub fn is_observer_up_to_date(&self, observer: &ObserverToken) -> bool {
        observer.counter == self.counter
    }

    pub fn update_observer(&self, observer: &mut ObserverToken) {
        observer.counter = self.counter;
    }

    /// Number of times this subject has been invalidated (plus one if created
    /// with [`SubjectToken::new`]).
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Default for SubjectToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverToken {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_observer_is_stale() {
        let subject = SubjectToken::new();
        let observer = ObserverToken::new();
        assert!(!subject.is_observer_up_to_date(&observer));
    }

    #[test]
    fn test_update_then_invalidate() {
        let mut subject = SubjectToken::new();
        let mut observer = ObserverToken::new();

        subject.update_observer(&mut observer);
        assert!(subject.is_observer_up_to_date(&observer));

        subject.invalidate();
        assert!(!subject.is_observer_up_to_date(&observer));

        subject.update_observer(&mut observer);
        assert!(subject.is_observer_up_to_date(&observer));
    }

    #[test]
    fn test_without_invalidate_starts_up_to_date() {
        let subject = SubjectToken::new_without_invalidate();
        assert!(subject.is_observer_up_to_date(&ObserverToken::new()));
    }
}
