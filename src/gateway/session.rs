//! Per-service initialization state.
//!
//! Each service name moves through `uninitialized → initializing →
//! initialized`. A service accepts protocol methods only while an
//! [`InitializationState`] is recorded for it. A re-`initialize` keeps the
//! previous record in place until the new handshake completes, and a failed
//! handshake restores whatever was there before.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Observable phase of a service session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Initialized,
}

/// Recorded after a successful `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationState {
    pub protocol_version: String,
    pub client_info: Option<Value>,
    pub initialized_at: DateTime<Utc>,
}

/// Identifies one `initialize` handshake. Later handshakes get larger tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandshakeTicket(u64);

#[derive(Debug, Clone)]
enum Slot {
    /// The newest handshake in flight, with the state to fall back to.
    Initializing {
        ticket: HandshakeTicket,
        previous: Option<(HandshakeTicket, InitializationState)>,
    },
    Initialized {
        ticket: HandshakeTicket,
        state: InitializationState,
    },
}

#[derive(Debug, Default)]
pub struct SessionTable {
    slots: RwLock<HashMap<String, Slot>>,
    next_ticket: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, service: &str) -> SessionPhase {
        match self.read().get(service) {
            None => SessionPhase::Uninitialized,
            Some(Slot::Initializing { .. }) => SessionPhase::Initializing,
            Some(Slot::Initialized { .. }) => SessionPhase::Initialized,
        }
    }

    /// The recorded state, including one kept during a re-handshake.
    pub fn get(&self, service: &str) -> Option<InitializationState> {
        match self.read().get(service)? {
            Slot::Initialized { state, .. } => Some(state.clone()),
            Slot::Initializing { previous, .. } => previous.as_ref().map(|(_, s)| s.clone()),
        }
    }

    /// Whether protocol methods are accepted for `service`.
    pub fn is_initialized(&self, service: &str) -> bool {
        self.get(service).is_some()
    }

    /// Enter `initializing`, remembering the current state for rollback.
    ///
    /// The returned ticket must be passed to [`complete`](Self::complete) or
    /// [`abort`](Self::abort).
    pub fn begin(&self, service: &str) -> HandshakeTicket {
        let ticket = HandshakeTicket(self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1);
        let mut slots = self.write();
        let previous = match slots.remove(service) {
            None => None,
            Some(Slot::Initialized { ticket, state }) => Some((ticket, state)),
            Some(Slot::Initializing { previous, .. }) => previous,
        };
        slots.insert(service.to_string(), Slot::Initializing { ticket, previous });
        ticket
    }

    /// Record a completed handshake.
    ///
    /// A handshake that finishes after a newer one has completed is ignored.
    /// One that finishes while a newer one is still running becomes the
    /// fallback state of the newer one.
    pub fn complete(&self, service: &str, ticket: HandshakeTicket, state: InitializationState) {
        let mut slots = self.write();
        let slot = match slots.remove(service) {
            Some(Slot::Initializing {
                ticket: current,
                previous,
            }) if current != ticket => {
                let previous = match previous {
                    Some((kept, _)) if kept > ticket => previous,
                    _ => Some((ticket, state)),
                };
                Slot::Initializing {
                    ticket: current,
                    previous,
                }
            }
            Some(Slot::Initialized {
                ticket: current,
                state: newer,
            }) if current > ticket => {
                tracing::debug!(service, "stale handshake completed, keeping newer state");
                Slot::Initialized {
                    ticket: current,
                    state: newer,
                }
            }
            _ => Slot::Initialized { ticket, state },
        };
        slots.insert(service.to_string(), slot);
    }

    /// Roll back a failed handshake to the state before [`begin`](Self::begin).
    ///
    /// Only the newest handshake in flight rolls back; anything else already
    /// superseded it.
    pub fn abort(&self, service: &str, ticket: HandshakeTicket) {
        let mut slots = self.write();
        let newest = matches!(
            slots.get(service),
            Some(Slot::Initializing { ticket: current, .. }) if *current == ticket
        );
        if !newest {
            tracing::debug!(service, "superseded handshake failed, state unchanged");
            return;
        }
        if let Some(Slot::Initializing {
            previous: Some((ticket, state)),
            ..
        }) = slots.remove(service)
        {
            slots.insert(service.to_string(), Slot::Initialized { ticket, state });
        }
    }

    /// Names of services with a recorded initialization, sorted.
    pub fn initialized_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, slot)| {
                matches!(
                    slot,
                    Slot::Initialized { .. } | Slot::Initializing { previous: Some(_), .. }
                )
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }
}
