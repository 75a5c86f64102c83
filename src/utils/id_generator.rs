//! Identifier minting for sessions, boards, and tasks.
//!
//! Ids are opaque strings with a short discriminating prefix so that log
//! lines and persisted keys are self-describing.

use uuid::Uuid;

/// Mints prefixed, collision-resistant identifiers.
///
/// # Examples
///
/// ```
/// use taskweft::utils::id_generator::IdGenerator;
///
/// let ids = IdGenerator::new();
/// let session = ids.session_id();
/// assert!(session.starts_with("sess_"));
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Id for a newly created session.
    #[must_use]
    pub fn session_id(&self) -> String {
        format!("sess_{}", Self::short_uuid())
    }

    /// Id for a task board.
    #[must_use]
    pub fn board_id(&self) -> String {
        format!("board_{}", Self::short_uuid())
    }

    /// Id for a task that the planner left unnamed; stable within one plan.
    #[must_use]
    pub fn task_id(&self, index: usize) -> String {
        format!("task_{index}")
    }

    fn short_uuid() -> String {
        let id = Uuid::new_v4().simple().to_string();
        id[..12].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_stable() {
        let ids = IdGenerator::new();
        assert!(ids.session_id().starts_with("sess_"));
        assert!(ids.board_id().starts_with("board_"));
        assert_eq!(ids.task_id(3), "task_3");
    }

    #[test]
    fn session_ids_are_unique() {
        let ids = IdGenerator::new();
        assert_ne!(ids.session_id(), ids.session_id());
    }
}
