//! Correlation tokens carried from a scrape tick to the indexing sink.

use std::fmt;

use uuid::Uuid;

/// Unique identifier assigned to one scrape job.
///
/// The engine allocates a fresh id on every tick; the id travels on the
/// read result and the record job so a document in the sink can be traced
/// back to the request that produced it. The `Display` form is suitable as
/// a log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocates a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<JobId> = (0..1000).map(|_| JobId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn display_is_stable() {
        let id = JobId::new();
        assert_eq!(id.to_string(), id.to_string());
    }
}
