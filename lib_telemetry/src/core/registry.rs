//! # Handler Registry
//!
//! Typed registration table behind the dispatcher. Each registration binds a
//! handler to a message category and a pattern over `(device_id, subtype)`.
//! Matching walks an explicit ordered tier list rather than building lookup
//! keys out of strings.
//!
//! ## Match tiers, evaluated in order:
//! 1. `Exact { device, subtype }` (`"helmet_01/gas"`)
//! 2. `CatchAll` (`"*"`)
//! 3. `DeviceWildcard { device }` (`"helmet_01/*"`)
//! 4. `SubtypeWildcard { subtype }` (`"*/gas"`)
//!
//! Every matching tier contributes. Inside a tier, handlers keep their
//! registration order.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::core::ingest_buffer::RawMessage;

/// Callback invoked with `(device_id, subtype, parsed_payload, raw_message)`.
pub type Handler =
    Arc<dyn Fn(&str, &str, &Value, &RawMessage) -> anyhow::Result<()> + Send + Sync>;

/// Message category, the third topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// `devices/{id}/sensors/{subtype}`
    Sensors,
    /// `devices/{id}/status/{subtype}`
    Status,
}

impl Category {
    /// Topic segment for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sensors => "sensors",
            Category::Status => "status",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensors" => Ok(Category::Sensors),
            "status" => Ok(Category::Status),
            other => Err(PatternError::UnknownCategory(other.to_string())),
        }
    }
}

/// Errors raised while parsing categories or handler patterns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// Category other than `sensors` or `status`.
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
    /// Pattern string that is not one of the four accepted shapes.
    #[error("invalid handler pattern '{0}'")]
    Invalid(String),
}

/// Pattern a handler is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerPattern {
    /// One device, one subtype.
    Exact {
        /// Device identifier.
        device: String,
        /// Topic subtype.
        subtype: String,
    },
    /// Every subtype of one device.
    DeviceWildcard {
        /// Device identifier.
        device: String,
    },
    /// One subtype on every device.
    SubtypeWildcard {
        /// Topic subtype.
        subtype: String,
    },
    /// Everything in the category.
    CatchAll,
}

impl HandlerPattern {
    /// Position of this pattern in the match order, when it matches at all.
    fn tier(&self, device_id: &str, subtype: &str) -> Option<u8> {
        match self {
            HandlerPattern::Exact { device, subtype: s } if device == device_id && s == subtype => {
                Some(0)
            }
            HandlerPattern::CatchAll => Some(1),
            HandlerPattern::DeviceWildcard { device } if device == device_id => Some(2),
            HandlerPattern::SubtypeWildcard { subtype: s } if s == subtype => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for HandlerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerPattern::Exact { device, subtype } => write!(f, "{device}/{subtype}"),
            HandlerPattern::DeviceWildcard { device } => write!(f, "{device}/*"),
            HandlerPattern::SubtypeWildcard { subtype } => write!(f, "*/{subtype}"),
            HandlerPattern::CatchAll => f.write_str("*"),
        }
    }
}

impl FromStr for HandlerPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PatternError::Invalid(s.to_string());
        if s == "*" {
            return Ok(HandlerPattern::CatchAll);
        }
        let (device, subtype) = s.split_once('/').ok_or_else(invalid)?;
        if device.is_empty() || subtype.is_empty() || subtype.contains('/') {
            return Err(invalid());
        }
        Ok(match (device, subtype) {
            ("*", "*") => HandlerPattern::CatchAll,
            ("*", subtype) => HandlerPattern::SubtypeWildcard {
                subtype: subtype.to_string(),
            },
            (device, "*") => HandlerPattern::DeviceWildcard {
                device: device.to_string(),
            },
            (device, subtype) => HandlerPattern::Exact {
                device: device.to_string(),
                subtype: subtype.to_string(),
            },
        })
    }
}

/// Handle returned by a registration, used to remove it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Registration {
    id: HandlerId,
    category: Category,
    pattern: HandlerPattern,
    handler: Handler,
}

/// Ordered table of handler registrations.
pub struct HandlerRegistry {
    next_id: AtomicU64,
    rules: Mutex<Vec<Registration>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            rules: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a handler at the end of its pattern's bucket.
    pub fn register(&self, category: Category, pattern: HandlerPattern, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::debug!("Registered handler {} for {}/{}", id, category, pattern);
        self.lock().push(Registration {
            id,
            category,
            pattern,
            handler,
        });
        id
    }

    /// Removes one registration. Returns false when the id is unknown.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut rules = self.lock();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        before != rules.len()
    }

    /// Removes registrations under `(category, pattern)`: only `id` when
    /// given, otherwise all of them. Returns how many were removed.
    pub fn unregister_pattern(
        &self,
        category: Category,
        pattern: &HandlerPattern,
        id: Option<HandlerId>,
    ) -> usize {
        let mut rules = self.lock();
        let before = rules.len();
        rules.retain(|r| {
            let same_bucket = r.category == category && &r.pattern == pattern;
            !(same_bucket && id.map_or(true, |id| r.id == id))
        });
        before - rules.len()
    }

    /// Snapshot of the handlers matching a message, in invocation order.
    pub fn matching(&self, category: Category, device_id: &str, subtype: &str) -> Vec<(HandlerId, Handler)> {
        let rules = self.lock();
        let mut matched: Vec<(u8, HandlerId, Handler)> = rules
            .iter()
            .filter(|r| r.category == category)
            .filter_map(|r| {
                r.pattern
                    .tier(device_id, subtype)
                    .map(|tier| (tier, r.id, Arc::clone(&r.handler)))
            })
            .collect();
        drop(rules);
        // Stable sort keeps registration order inside a tier.
        matched.sort_by_key(|(tier, _, _)| *tier);
        matched.into_iter().map(|(_, id, h)| (id, h)).collect()
    }

    /// Number of registrations across all categories.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_, _, _, _| Ok(()))
    }

    #[test]
    fn test_pattern_parsing() {
        assert_eq!("*".parse::<HandlerPattern>().unwrap(), HandlerPattern::CatchAll);
        assert_eq!(
            "d1/*".parse::<HandlerPattern>().unwrap(),
            HandlerPattern::DeviceWildcard { device: "d1".into() }
        );
        assert_eq!(
            "*/temp".parse::<HandlerPattern>().unwrap(),
            HandlerPattern::SubtypeWildcard { subtype: "temp".into() }
        );
        assert_eq!(
            "d1/temp".parse::<HandlerPattern>().unwrap(),
            HandlerPattern::Exact { device: "d1".into(), subtype: "temp".into() }
        );
        assert!("d1".parse::<HandlerPattern>().is_err());
        assert!("d1/a/b".parse::<HandlerPattern>().is_err());
        assert!("/temp".parse::<HandlerPattern>().is_err());
        assert_eq!("d1/temp".parse::<HandlerPattern>().unwrap().to_string(), "d1/temp");
    }

    #[test]
    fn test_matching_follows_tier_order() {
        let registry = HandlerRegistry::new();
        let sub = registry.register(Category::Sensors, "*/temp".parse().unwrap(), noop());
        let dev = registry.register(Category::Sensors, "d1/*".parse().unwrap(), noop());
        let all = registry.register(Category::Sensors, HandlerPattern::CatchAll, noop());
        let exact = registry.register(Category::Sensors, "d1/temp".parse().unwrap(), noop());
        registry.register(Category::Status, HandlerPattern::CatchAll, noop());
        registry.register(Category::Sensors, "d2/temp".parse().unwrap(), noop());

        let ids: Vec<HandlerId> = registry
            .matching(Category::Sensors, "d1", "temp")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![exact, all, dev, sub]);
    }

    #[test]
    fn test_unregister_pattern_with_and_without_id() {
        let registry = HandlerRegistry::new();
        let pattern: HandlerPattern = "d1/gas".parse().unwrap();
        let first = registry.register(Category::Sensors, pattern.clone(), noop());
        let second = registry.register(Category::Sensors, pattern.clone(), noop());
        registry.register(Category::Sensors, pattern.clone(), noop());

        assert_eq!(registry.unregister_pattern(Category::Sensors, &pattern, Some(first)), 1);
        assert_eq!(registry.unregister_pattern(Category::Status, &pattern, None), 0);
        assert!(registry.unregister(second));
        assert!(!registry.unregister(second));
        assert_eq!(registry.unregister_pattern(Category::Sensors, &pattern, None), 1);
        assert!(registry.is_empty());
    }
}
