use thiserror::Error;

/// A snapshot that does not extend the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error(
        "model text is not a continuation of what was already streamed \
         (previous length {previous_len}, snapshot length {snapshot_len})"
    )]
    NonMonotonic {
        previous_len: usize,
        snapshot_len: usize,
    },
}

/// Turns cumulative text snapshots into the suffix that is new since the last
/// one.
///
/// Snapshots must grow monotonically between resets; a snapshot that rewrites
/// earlier text is an error rather than something to patch over, since part
/// of the old text has already reached the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaTracker {
    last_full_text: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `snapshot` and return the text it adds, or `None` when it adds
    /// nothing.
    pub fn update(&mut self, snapshot: &str) -> Result<Option<String>, DeltaError> {
        if snapshot == self.last_full_text {
            return Ok(None);
        }
        let Some(delta) = snapshot.strip_prefix(self.last_full_text.as_str()) else {
            return Err(DeltaError::NonMonotonic {
                previous_len: self.last_full_text.len(),
                snapshot_len: snapshot.len(),
            });
        };
        let delta = delta.to_string();
        self.last_full_text = snapshot.to_string();
        Ok(Some(delta))
    }

    /// Start over from empty; the next text block is a fresh one.
    pub fn reset(&mut self) {
        self.last_full_text.clear();
    }

    /// Full text of the current block.
    pub fn text(&self) -> &str {
        &self.last_full_text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_concatenate_to_last_snapshot() {
        let snapshots = ["I", "I built", "I built find", "I built findkairos.com ✨"];
        let mut tracker = DeltaTracker::new();
        let mut streamed = String::new();
        for s in snapshots {
            if let Some(d) = tracker.update(s).unwrap() {
                streamed.push_str(&d);
            }
        }
        assert_eq!(streamed, "I built findkairos.com ✨");
        assert_eq!(tracker.text(), streamed);
    }

    #[test]
    fn test_repeated_snapshot_is_noop() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.update("abc").unwrap(), Some("abc".to_string()));
        assert_eq!(tracker.update("abc").unwrap(), None);
    }

    #[test]
    fn test_reset_restarts_from_empty() {
        let mut tracker = DeltaTracker::new();
        tracker.update("something long").unwrap();
        tracker.reset();
        assert_eq!(tracker.update("abc").unwrap(), Some("abc".to_string()));
    }

    #[test]
    fn test_rewrite_is_rejected() {
        let mut tracker = DeltaTracker::new();
        tracker.update("Hello wrld").unwrap();
        let err = tracker.update("Hello world").unwrap_err();
        assert_eq!(
            err,
            DeltaError::NonMonotonic {
                previous_len: 10,
                snapshot_len: 11
            }
        );
        assert_eq!(tracker.text(), "Hello wrld");
    }
}
