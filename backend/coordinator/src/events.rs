//! Journal rows for the events emitted by the EcoTask protocol core.
//!
//! Each [`RecordedEvent`] is flattened into an indexable [`JournalEntry`]
//! (type, task, actor, amount) with the full event kept as a JSON payload,
//! so consumers can filter in SQL and still decode the exact variant.

use ecotask_protocol::{ProtocolEvent, RecordedEvent, Transfer};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// A protocol event ready to be stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: i64,
    pub event_type: String,
    pub task_id: Option<i64>,
    pub actor: Option<String>,
    /// Amounts are `i128` in the core and stored as decimal text.
    pub amount: Option<String>,
    pub timestamp: i64,
    pub payload: String,
}

impl JournalEntry {
    pub fn from_recorded(recorded: &RecordedEvent) -> Result<Self> {
        let event = &recorded.event;
        Ok(JournalEntry {
            seq: recorded.seq as i64,
            event_type: event.kind().to_string(),
            task_id: event.task_id().map(|id| id as i64),
            actor: event.actor().map(|a| a.to_string()),
            amount: event.amount().map(|a| a.to_string()),
            timestamp: recorded.timestamp as i64,
            payload: serde_json::to_string(event)?,
        })
    }
}

/// A raw event record as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub seq: i64,
    pub event_type: String,
    pub task_id: Option<i64>,
    pub actor: Option<String>,
    pub amount: Option<String>,
    pub timestamp: i64,
    pub payload: String,
    pub created_at: i64,
}

impl EventRecord {
    /// Decode the stored payload back into the event it was journaled from.
    pub fn to_recorded(&self) -> Result<RecordedEvent> {
        let event: ProtocolEvent = serde_json::from_str(&self.payload)?;
        Ok(RecordedEvent {
            seq: self.seq as u64,
            timestamp: self.timestamp as u64,
            event,
        })
    }

    /// Value movements this event caused.
    pub fn transfers(&self) -> Result<Vec<Transfer>> {
        Ok(self.to_recorded()?.transfers())
    }
}
