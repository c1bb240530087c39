//! Per-call execution environment handed to every component.

use crate::config::ProtocolConfig;
use crate::events::{EventLog, ProtocolEvent};
use crate::treasury::Treasury;
use crate::types::Timestamp;

/// What one mutating call sees besides the component tables: the time it
/// executes at, the protocol parameters, the event log and the treasury.
pub struct Env<'a> {
    pub now: Timestamp,
    pub config: &'a ProtocolConfig,
    pub events: &'a mut EventLog,
    pub treasury: &'a mut Treasury,
}

impl Env<'_> {
    pub(crate) fn emit(&mut self, event: ProtocolEvent) {
        self.events.emit(self.now, event);
    }
}
