//! A single-assignment result cell.

/// Holds the first outcome of a race between several sources.
///
/// Only the first call to [`resolve`](Gate::resolve) is recorded; later calls
/// are ignored, even after the value has been taken out.
#[derive(Debug)]
pub struct Gate<T> {
    slot: Option<T>,
    fired: bool,
}

impl<T> Default for Gate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Gate<T> {
    /// An unresolved gate.
    pub fn new() -> Self {
        Self {
            slot: None,
            fired: false,
        }
    }

    /// Record `value` if nothing has been recorded yet. Returns whether this
    /// call won.
    pub fn resolve(&mut self, value: T) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        self.slot = Some(value);
        true
    }

    /// Whether an outcome has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.fired
    }

    /// Take the recorded outcome, if any.
    pub fn take(&mut self) -> Option<T> {
        self.slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_outcome_wins() {
        let mut gate = Gate::new();
        assert!(!gate.is_resolved());

        assert!(gate.resolve("finish"));
        assert!(!gate.resolve("error"));
        assert!(gate.is_resolved());

        assert_eq!(gate.take(), Some("finish"));
        assert_eq!(gate.take(), None);
        assert!(!gate.resolve("late"));
    }
}
