//! The outcome of one tracker computation.

/// What a single round of a tracker computation produced.
///
/// Trackers compute a `Tracked` value and only emit on [`Tracked::Value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tracked<T> {
    /// A value to emit downstream.
    Value(T),

    /// Nothing to emit this round (resource too short, entry not yet
    /// available, transient fetch failure).
    Skip,

    /// No resource is bound; emission is suspended until rebound.
    Unbound,
}

impl<T> Tracked<T> {
    /// Map the carried value.
    pub fn map<U, F>(self, f: F) -> Tracked<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Tracked::Value(value) => Tracked::Value(f(value)),
            Tracked::Skip => Tracked::Skip,
            Tracked::Unbound => Tracked::Unbound,
        }
    }

    /// Convert into the value to emit, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Tracked::Value(value) => Some(value),
            Tracked::Skip | Tracked::Unbound => None,
        }
    }
}

impl<T> From<Option<T>> for Tracked<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Tracked::Value(value),
            None => Tracked::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_values_are_emitted() {
        assert_eq!(Tracked::Value(3).into_value(), Some(3));
        assert_eq!(Tracked::<i32>::Skip.into_value(), None);
        assert_eq!(Tracked::<i32>::Unbound.into_value(), None);
    }

    #[test]
    fn missing_entry_is_a_skip() {
        assert_eq!(Tracked::from(None::<u8>), Tracked::Skip);
        assert_eq!(Tracked::from(Some(1)).map(|v| v + 1), Tracked::Value(2));
    }
}
