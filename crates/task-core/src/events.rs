//! Event types.
//!
//! `TaskEvent` is the push-update contract broadcast to viewers.
//! `PhaseEvent` flows from a running phase pipeline to the task store.

use crate::stream::StreamLine;
use crate::types::{Id, OutputEntry, Phase, Task};
use serde::{Deserialize, Serialize};

/// Push event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskUpdated,
    TaskOutputAppended,
    TaskRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskUpdated => "task_updated",
            Self::TaskOutputAppended => "task_output_appended",
            Self::TaskRemoved => "task_removed",
        }
    }
}

/// Push update carrying the task id and the updated payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskUpdated { task_id: Id, task: Box<Task> },
    TaskOutputAppended { task_id: Id, entry: OutputEntry },
    TaskRemoved { task_id: Id },
}

impl TaskEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskUpdated { .. } => EventType::TaskUpdated,
            Self::TaskOutputAppended { .. } => EventType::TaskOutputAppended,
            Self::TaskRemoved { .. } => EventType::TaskRemoved,
        }
    }

    pub fn task_id(&self) -> &Id {
        match self {
            Self::TaskUpdated { task_id, .. }
            | Self::TaskOutputAppended { task_id, .. }
            | Self::TaskRemoved { task_id } => task_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Typed event emitted by a phase pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    /// A phase subprocess was spawned (or adopted).
    PhaseStarted { phase: Phase },
    /// One parsed stdout item.
    Output {
        phase: Phase,
        line: StreamLine,
        historical: bool,
    },
    /// One stderr line.
    Stderr {
        phase: Phase,
        text: String,
        historical: bool,
    },
    /// Replay of a re-attached phase is complete; live output follows.
    Reconnected { phase: Phase },
    /// A phase exited successfully.
    PhaseCompleted { phase: Phase },
    /// Every phase completed.
    Completed,
    Failed { phase: Phase, reason: String },
}
