use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned to a command by the dispatcher. Wraps to 0 past `u64::MAX`.
pub type CommandId = u64;

/// Opaque, backend-specific operation descriptor.
pub type Payload = serde_json::Value;

/// Opaque backend result.
pub type Output = serde_json::Value;

/// Which executor handles a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Produces rows (queries). Takes the read path by default.
    RowReturning,
    /// Produces no rows (inserts, updates, DDL). Fanned out to every replica by default.
    NonRowReturning,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::RowReturning => f.write_str("row-returning"),
            CommandKind::NonRowReturning => f.write_str("non-row-returning"),
        }
    }
}

/// How a command reacts when its replica is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Block until the replica recovers, then retry.
    Wait,
    /// Report the failure to the caller immediately.
    DontWait,
}

impl fmt::Display for SubmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitMode::Wait => f.write_str("wait"),
            SubmitMode::DontWait => f.write_str("dont-wait"),
        }
    }
}

/// A unit of work submitted through the dispatcher.
///
/// Everything but the id is fixed at construction. The id is assigned exactly
/// once, by the dispatcher, before the command is routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: Option<CommandId>,
    kind: CommandKind,
    mode: SubmitMode,
    payload: Payload,
}

impl Command {
    pub fn new(kind: CommandKind, mode: SubmitMode, payload: Payload) -> Self {
        Self {
            id: None,
            kind,
            mode,
            payload,
        }
    }

    /// A row-returning command in `Wait` mode.
    pub fn read(payload: Payload) -> Self {
        Self::new(CommandKind::RowReturning, SubmitMode::Wait, payload)
    }

    /// A non-row-returning command in `Wait` mode.
    pub fn write(payload: Payload) -> Self {
        Self::new(CommandKind::NonRowReturning, SubmitMode::Wait, payload)
    }

    pub fn with_mode(mut self, mode: SubmitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn id(&self) -> Option<CommandId> {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn mode(&self) -> SubmitMode {
        self.mode
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Assigns the command id. Returns `false` and leaves the command untouched
    /// if an id was already assigned.
    pub fn assign_id(&mut self, id: CommandId) -> bool {
        if self.id.is_some() {
            return false;
        }
        self.id = Some(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_and_write_constructors() {
        let read = Command::read(json!({"get": "a"}));
        assert_eq!(read.kind(), CommandKind::RowReturning);
        assert_eq!(read.mode(), SubmitMode::Wait);

        let write = Command::write(json!({"set": "a", "value": 1}));
        assert_eq!(write.kind(), CommandKind::NonRowReturning);
        assert_eq!(write.payload(), &json!({"set": "a", "value": 1}));
    }

    #[test]
    fn test_with_mode() {
        let command = Command::read(json!(null)).with_mode(SubmitMode::DontWait);
        assert_eq!(command.mode(), SubmitMode::DontWait);
    }

    #[test]
    fn test_id_assigned_once() {
        let mut command = Command::read(json!(null));
        assert!(command.id().is_none());
        assert!(command.assign_id(7));
        assert!(!command.assign_id(8));
        assert_eq!(command.id(), Some(7));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(CommandKind::NonRowReturning).unwrap(),
            json!("non_row_returning")
        );
        assert_eq!(
            serde_json::from_value::<SubmitMode>(json!("dont_wait")).unwrap(),
            SubmitMode::DontWait
        );
    }
}
