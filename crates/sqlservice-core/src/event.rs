//! Model lifecycle events.
//!
//! Every [`ModelSchema`](crate::ModelSchema) owns an [`EventRegistry`]. Handlers
//! are attached while the schema is built and the session dispatches into the
//! registry around flush statements, row loads and attribute assignment.

use crate::Result;
use crate::record::Record;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle points a handler can listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelEvent {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    /// A row was loaded from the database into a new tracked instance.
    Load,
    /// The named attribute was assigned through [`Record::set`].
    Set(&'static str),
}

/// Event handler. Returning an error aborts the operation that fired it.
pub type EventHandler = Arc<dyn Fn(&mut Record) -> Result<()> + Send + Sync>;

/// Ordered handler lists keyed by event.
#[derive(Clone, Default)]
pub struct EventRegistry {
    handlers: HashMap<ModelEvent, Vec<EventHandler>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; handlers run in registration order.
    pub fn listen(&mut self, event: ModelEvent, handler: EventHandler) {
        self.handlers.entry(event).or_default().push(handler);
    }

    pub fn has_listeners(&self, event: ModelEvent) -> bool {
        self.handlers.get(&event).is_some_and(|h| !h.is_empty())
    }

    pub fn listener_count(&self, event: ModelEvent) -> usize {
        self.handlers.get(&event).map_or(0, Vec::len)
    }

    /// Run every handler for `event`, stopping at the first error.
    pub fn dispatch(&self, event: ModelEvent, record: &mut Record) -> Result<()> {
        let Some(handlers) = self.handlers.get(&event) else {
            return Ok(());
        };
        tracing::trace!(
            ?event,
            model = record.schema().name(),
            count = handlers.len(),
            "dispatching model event"
        );
        for handler in handlers {
            handler(record)?;
        }
        Ok(())
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<_> = self
            .handlers
            .iter()
            .map(|(event, handlers)| (*event, handlers.len()))
            .collect();
        counts.sort_by_key(|(event, _)| format!("{event:?}"));
        f.debug_struct("EventRegistry")
            .field("handlers", &counts)
            .finish()
    }
}
