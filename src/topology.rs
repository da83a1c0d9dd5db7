//! Broker topology derived from `(service, level)`.
//!
//! Every name here is a pure function of its inputs so producers and
//! consumers agree on routing without sharing any state.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::record::Level;

pub const DEFAULT_EXCHANGE: &str = "logs_exchange";
pub const CATCH_ALL_QUEUE: &str = "all_logs";
pub const WILDCARD_ROUTING_KEY: &str = "#";
pub const MESSAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MAX_QUEUE_LENGTH: u32 = 1_000_000;
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Levels that get a dedicated queue when consuming for a single service.
pub const FILTERED_LEVELS: [Level; 3] = [Level::Info, Level::Warning, Level::Error];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            _ => Err(ConfigError::ExchangeKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        ExchangeSpec {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// Broker-side retention caps. Eviction of old or excess messages is done
/// by the broker, never by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueArgs {
    pub message_ttl: Duration,
    pub max_length: u32,
}

impl Default for QueueArgs {
    fn default() -> Self {
        QueueArgs {
            message_ttl: MESSAGE_TTL,
            max_length: MAX_QUEUE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub args: QueueArgs,
}

/// A queue together with the routing keys it must be bound with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: QueueSpec,
    pub routing_key: String,
}

impl Binding {
    /// `#` is only a wildcard on topic exchanges. A direct exchange compares
    /// it literally, so such a binding never matches `{service}.{level}`.
    pub fn is_literal_wildcard(&self, kind: ExchangeKind) -> bool {
        kind == ExchangeKind::Direct && self.routing_key == WILDCARD_ROUTING_KEY
    }
}

/// `{service}.{level}` with the level lowercased.
pub fn routing_key(service: &str, level: Level) -> String {
    format!("{}.{}", service, level.as_lower())
}

/// `{service}_{level}_logs` with the level lowercased.
pub fn queue_name(service: &str, level: Level) -> String {
    format!("{}_{}_logs", service, level.as_lower())
}

/// Queues and bindings a consumer needs.
///
/// With a service filter: one queue per level in [`FILTERED_LEVELS`], each
/// bound with its exact routing key. Without one: the single catch-all queue
/// bound with the wildcard key.
pub fn consumer_bindings(service_filter: Option<&str>, args: QueueArgs) -> Vec<Binding> {
    match service_filter {
        Some(service) => FILTERED_LEVELS
            .iter()
            .map(|level| Binding {
                queue: QueueSpec {
                    name: queue_name(service, *level),
                    durable: true,
                    args,
                },
                routing_key: routing_key(service, *level),
            })
            .collect(),
        None => vec![Binding {
            queue: QueueSpec {
                name: CATCH_ALL_QUEUE.to_string(),
                durable: true,
                args,
            },
            routing_key: WILDCARD_ROUTING_KEY.to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_lowercases_level() {
        assert_eq!(routing_key("billing", Level::Critical), "billing.critical");
        assert_eq!(routing_key("billing", Level::Warning), "billing.warning");
    }

    #[test]
    fn filtered_bindings_cover_info_warning_error() {
        let bindings = consumer_bindings(Some("auth"), QueueArgs::default());
        let names: Vec<_> = bindings.iter().map(|b| b.queue.name.as_str()).collect();
        assert_eq!(names, ["auth_info_logs", "auth_warning_logs", "auth_error_logs"]);
        assert_eq!(bindings[2].routing_key, "auth.error");
        assert!(bindings.iter().all(|b| b.queue.args.max_length == 1_000_000));
    }

    #[test]
    fn unfiltered_binding_is_catch_all() {
        let bindings = consumer_bindings(None, QueueArgs::default());
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].queue.name, "all_logs");
        assert_eq!(bindings[0].routing_key, "#");
        assert_eq!(bindings[0].queue.args.message_ttl, Duration::from_secs(604_800));
    }

    #[test]
    fn catch_all_needs_a_topic_exchange() {
        let catch_all = &consumer_bindings(None, QueueArgs::default())[0];
        assert!(catch_all.is_literal_wildcard(ExchangeKind::Direct));
        assert!(!catch_all.is_literal_wildcard(ExchangeKind::Topic));

        let filtered = consumer_bindings(Some("auth"), QueueArgs::default());
        assert!(filtered.iter().all(|b| !b.is_literal_wildcard(ExchangeKind::Direct)));
    }

    #[test]
    fn exchange_kind_parses() {
        assert_eq!("Topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert!("fanout".parse::<ExchangeKind>().is_err());
    }
}
