//! # Identifiers and Command Vocabulary
//!
//! Small value types shared by every pipeline: entity and transaction
//! identifiers, request ids, and the closed set of commands the protocol
//! engine understands.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric identifier of a CFDP participant (local or remote entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One file-transfer exchange, identified by the source entity and its
/// transaction sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionId {
    pub entity: EntityId,
    pub sequence: u64,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.sequence)
    }
}

/// Inclusive range of transaction sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: u64,
    pub end: u64,
}

impl SequenceRange {
    pub fn single(sequence: u64) -> Self {
        Self { start: sequence, end: sequence }
    }
}

/// Correlates a published action with the log lines and the result it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// # Action Type
///
/// The closed set of commands accepted by the action pipeline. Every variant
/// except `Ingest`, `MtuMap` and `ResetStat` ends up as a request to the
/// protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Start a file transfer.
    Put,
    Cancel,
    Abandon,
    Suspend,
    Resume,
    Report,
    ResetStat,
    SaveState,
    ForceGen,
    PauseTimer,
    ResumeTimer,
    /// Ingest a file of PDUs through the ingest-action pipeline.
    Ingest,
    /// Query the messages-to-user mnemonic map.
    MtuMap,
    /// Abandon everything, reset statistics and clear the history.
    Clear,
}

impl ActionType {
    /// Whether this action addresses transactions through a selection mode.
    pub fn is_transaction_identifying(self) -> bool {
        matches!(
            self,
            ActionType::Cancel
                | ActionType::Abandon
                | ActionType::Suspend
                | ActionType::Resume
                | ActionType::Report
                | ActionType::ForceGen
                | ActionType::PauseTimer
                | ActionType::ResumeTimer
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Put => "PUT",
            ActionType::Cancel => "CANCEL",
            ActionType::Abandon => "ABANDON",
            ActionType::Suspend => "SUSPEND",
            ActionType::Resume => "RESUME",
            ActionType::Report => "REPORT",
            ActionType::ResetStat => "RESET_STAT",
            ActionType::SaveState => "SAVE_STATE",
            ActionType::ForceGen => "FORCE_GEN",
            ActionType::PauseTimer => "PAUSE_TIMER",
            ActionType::ResumeTimer => "RESUME_TIMER",
            ActionType::Ingest => "INGEST",
            ActionType::MtuMap => "MTU_MAP",
            ActionType::Clear => "CLEAR",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name an [`ActionType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action type: {0}")]
pub struct UnknownActionType(pub String);

impl FromStr for ActionType {
    type Err = UnknownActionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s.to_ascii_uppercase().as_str() {
            "PUT" => ActionType::Put,
            "CANCEL" => ActionType::Cancel,
            "ABANDON" => ActionType::Abandon,
            "SUSPEND" => ActionType::Suspend,
            "RESUME" => ActionType::Resume,
            "REPORT" => ActionType::Report,
            "RESET_STAT" => ActionType::ResetStat,
            "SAVE_STATE" => ActionType::SaveState,
            "FORCE_GEN" => ActionType::ForceGen,
            "PAUSE_TIMER" => ActionType::PauseTimer,
            "RESUME_TIMER" => ActionType::ResumeTimer,
            "INGEST" => ActionType::Ingest,
            "MTU_MAP" => ActionType::MtuMap,
            "CLEAR" => ActionType::Clear,
            _ => return Err(UnknownActionType(s.to_string())),
        };
        Ok(action)
    }
}

/// How a transaction-identifying action selects its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionMode {
    All,
    ByServiceClass,
    ByRemoteEntity,
    ByTransactionIds,
}

/// Where an INGEST action reads its PDUs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestSource {
    File,
}

impl fmt::Display for IngestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestSource::File => f.write_str("FILE"),
        }
    }
}
