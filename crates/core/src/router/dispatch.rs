/// Event dispatch table
///
/// Maps each event class to the router method that handles it. The set of
/// registered classes is also what gets subscribed with SETEVENTS.

use super::Router;
use crate::control::{ControlEvent, EventKind};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Handlers get the monotonic time and the wall clock in unix seconds
pub type EventHandler = fn(&mut Router, ControlEvent, Instant, u64);

pub struct EventDispatcher {
    handlers: HashMap<EventKind, EventHandler>,
}

impl EventDispatcher {
    /// An empty table
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: EventKind, handler: EventHandler) {
        if self.handlers.insert(kind, handler).is_some() {
            debug!("Replaced handler for {} events", kind.as_str());
        }
    }

    pub fn handler(&self, kind: EventKind) -> Option<EventHandler> {
        self.handlers.get(&kind).copied()
    }

    /// Registered event classes, in subscription order
    pub fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(EventKind::Circ, |router, event, now, _| {
            if let ControlEvent::Circuit(event) = event {
                router.on_circuit_event(event, now);
            }
        });
        dispatcher.register(EventKind::Stream, |router, event, now, _| {
            if let ControlEvent::Stream(event) = event {
                router.on_stream_event(event, now);
            }
        });
        dispatcher.register(EventKind::OrConn, |router, event, _, _| {
            if let ControlEvent::OrConn(event) = event {
                router.on_or_conn(event);
            }
        });
        dispatcher.register(EventKind::Bw, |router, event, _, _| {
            if let ControlEvent::Bandwidth(event) = event {
                router.on_bandwidth(event);
            }
        });
        dispatcher.register(EventKind::NewDesc, |router, event, _, _| {
            if let ControlEvent::NewDescriptors(fingerprints) = event {
                router.on_new_descriptors(fingerprints);
            }
        });
        dispatcher.register(EventKind::Ns, |router, event, _, _| {
            if let ControlEvent::NetworkStatus(entries) = event {
                router.on_network_status(entries);
            }
        });
        dispatcher.register(EventKind::NewConsensus, |router, event, _, _| {
            if let ControlEvent::NewConsensus(entries) = event {
                router.on_new_consensus(entries);
            }
        });
        dispatcher.register(EventKind::TokenLevels, |router, event, now, unix_now| {
            if let ControlEvent::TokenLevels(event) = event {
                router.on_token_levels(event, now, unix_now);
            }
        });
        dispatcher.register(EventKind::OrCircuit, |router, event, now, unix_now| {
            if let ControlEvent::OrCircuit(event) = event {
                router.on_or_circuit(event, now, unix_now);
            }
        });
        dispatcher.register(EventKind::StatusClient, |router, event, _, _| {
            if let ControlEvent::Bootstrap { progress } = event {
                router.on_bootstrap(progress);
            }
        });
        dispatcher
    }
}
