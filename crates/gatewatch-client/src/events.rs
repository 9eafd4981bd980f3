//! Routing of unsolicited server events to a single registered handler.

use std::sync::{Arc, RwLock};

use gatewatch_core::prelude::*;

use crate::protocol::EventFrame;

/// Callback receiving every forwarded event, on the read-loop task.
pub type EventHandler = Arc<dyn Fn(EventFrame) + Send + Sync>;

/// Holds the current handler. Setting a new one replaces the previous.
#[derive(Default)]
pub struct EventDispatcher {
    handler: RwLock<Option<EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handler(&self, handler: EventHandler) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    #[cfg(test)]
    pub fn has_handler(&self) -> bool {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Deliver `event` unless it is connection-internal. The handler runs
    /// after the lock is released. Returns whether the handler was invoked.
    pub fn dispatch(&self, event: EventFrame) -> bool {
        if event.is_internal() {
            trace!("Not forwarding internal event {}", event.event);
            return false;
        }
        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => {
                trace!("No event handler registered, dropping {}", event.event);
                false
            }
        }
    }
}
