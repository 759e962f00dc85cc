//! # Topic Dispatcher
//!
//! Turns raw messages into handler invocations. The dispatcher parses the
//! topic, looks up every matching registration and calls each handler in turn,
//! isolating failures so that one broken consumer cannot starve the others.
//!
//! ## Core Design Principles:
//!
//! 1.  **Fan-out to every match**: the exact, catch-all, device wildcard and
//!     subtype wildcard buckets are all evaluated for every message. A message
//!     is never limited to its most specific match.
//!
//! 2.  **Failure isolation**: a handler that returns an error or panics is
//!     logged and counted. Sibling handlers still run and the registry is left
//!     untouched.
//!
//! 3.  **Lock-free invocation**: matching handlers are cloned out of the
//!     registry before any of them runs, so a handler may register or remove
//!     handlers without deadlocking.
//!
//! 4.  **Typed path for typed payloads**: only messages whose payload parsed as
//!     JSON reach handlers. Everything else goes to the raw log.

use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::core::ingest_buffer::RawMessage;
use crate::core::registry::{Category, Handler, HandlerId, HandlerPattern, HandlerRegistry};

/// Reasons a topic string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// Fewer than four `/`-separated segments.
    #[error("expected devices/{{device_id}}/{{category}}/{{subtype}}, got {0} segment(s)")]
    TooShort(usize),
    /// First segment is not `devices`.
    #[error("topic root must be 'devices', got '{0}'")]
    UnknownRoot(String),
    /// Device id or subtype is empty.
    #[error("empty device id or subtype")]
    EmptySegment,
    /// Third segment is neither `sensors` nor `status`.
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
}

/// # Parsed Topic
///
/// `devices/{device_id}/{category}/{subtype}`. Segments after the fourth are
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Second segment.
    pub device_id: String,
    /// Third segment.
    pub category: Category,
    /// Fourth segment.
    pub subtype: String,
}

impl Topic {
    /// Splits a topic string into its typed parts.
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 4 {
            return Err(TopicError::TooShort(parts.len()));
        }
        if parts[0] != "devices" {
            return Err(TopicError::UnknownRoot(parts[0].to_string()));
        }
        if parts[1].is_empty() || parts[3].is_empty() {
            return Err(TopicError::EmptySegment);
        }
        let category = parts[2]
            .parse::<Category>()
            .map_err(|_| TopicError::UnknownCategory(parts[2].to_string()))?;
        Ok(Self {
            device_id: parts[1].to_string(),
            category,
            subtype: parts[3].to_string(),
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "devices/{}/{}/{}", self.device_id, self.category, self.subtype)
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Messages that went through handler lookup.
    pub dispatched: u64,
    /// Messages dropped for a malformed topic.
    pub malformed_topics: u64,
    /// Messages without a JSON payload, logged raw only.
    pub raw_only: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
}

/// # Core Dispatcher
///
/// Owns the handler registry and routes messages through it.
#[derive(Default)]
pub struct Dispatcher {
    registry: HandlerRegistry,
    dispatched: AtomicU64,
    malformed_topics: AtomicU64,
    raw_only: AtomicU64,
    handler_failures: AtomicU64,
}

impl Dispatcher {
    /// Dispatcher with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `(category, pattern)`.
    pub fn register(&self, category: Category, pattern: HandlerPattern, handler: Handler) -> HandlerId {
        self.registry.register(category, pattern, handler)
    }

    /// Removes one registration by handle.
    pub fn unregister(&self, id: HandlerId) -> bool {
        self.registry.unregister(id)
    }

    /// Removes one or all registrations under `(category, pattern)`.
    pub fn unregister_pattern(
        &self,
        category: Category,
        pattern: &HandlerPattern,
        id: Option<HandlerId>,
    ) -> usize {
        self.registry.unregister_pattern(category, pattern, id)
    }

    /// The underlying registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// # Route
    ///
    /// Parses the topic of `raw` and dispatches its JSON payload. Malformed
    /// topics are warned about and dropped. Non-JSON payloads only reach the
    /// raw log.
    pub fn route(&self, raw: &RawMessage) {
        let topic = match Topic::parse(&raw.topic) {
            Ok(topic) => topic,
            Err(e) => {
                self.malformed_topics.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping message on malformed topic '{}': {}", raw.topic, e);
                return;
            }
        };

        match &raw.parsed_payload {
            Some(payload) => {
                log::debug!("[all] {} {}", raw.topic, raw.payload);
                self.dispatch(topic.category, &topic.device_id, &topic.subtype, payload, raw);
            }
            None => {
                self.raw_only.fetch_add(1, Ordering::Relaxed);
                log::info!("[raw] {} {}", raw.topic, raw.payload);
            }
        }
    }

    /// # Dispatch
    ///
    /// Invokes every handler matching `(category, device_id, subtype)` in
    /// tier order: exact, catch-all, device wildcard, subtype wildcard.
    pub fn dispatch(
        &self,
        category: Category,
        device_id: &str,
        subtype: &str,
        payload: &Value,
        raw: &RawMessage,
    ) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let handlers = self.registry.matching(category, device_id, subtype);
        if handlers.is_empty() {
            log::debug!("No handler for {}/{}/{}", device_id, category, subtype);
            return;
        }

        for (id, handler) in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                handler(device_id, subtype, payload, raw)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("Handler {} failed on {}: {:#}", id, raw.topic, e);
                }
                Err(panic) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!(
                        "Handler {} panicked on {}: {}",
                        id,
                        raw.topic,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            malformed_topics: self.malformed_topics.load(Ordering::Relaxed),
            raw_only: self.raw_only.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
