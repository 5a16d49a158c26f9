//! Queue and exchange declarations.

use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};

/// The four exchange types every AMQP 0-9-1 broker supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Fanout,
    Direct,
    Topic,
    Headers,
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

/// A queue as it should exist on the broker.
///
/// Declaring is idempotent, but the flags must match any queue of the same
/// name that already exists or the broker refuses the declaration.
#[derive(Debug, Clone)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub passive: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    /// A durable, non-exclusive queue that survives its consumers.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            passive: false,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::default(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    /// True when redeclaring `other` against an existing `self` would be
    /// refused. Arguments such as `x-message-ttl` must match exactly.
    pub fn conflicts_with(&self, other: &QueueDeclaration) -> bool {
        self.durable != other.durable
            || self.exclusive != other.exclusive
            || self.auto_delete != other.auto_delete
            || self.arguments != other.arguments
    }

    pub fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub passive: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl ExchangeDeclaration {
    /// A transient fanout exchange.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ExchangeType::Fanout,
            durable: false,
            passive: false,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeType) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn conflicts_with(&self, other: &ExchangeDeclaration) -> bool {
        self.kind != other.kind
            || self.durable != other.durable
            || self.auto_delete != other.auto_delete
            || self.internal != other.internal
            || self.arguments != other.arguments
    }

    pub fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults_are_durable() {
        let queue = QueueDeclaration::new("orders");
        assert!(queue.durable);
        assert!(!queue.exclusive);
        assert!(!queue.auto_delete);
        assert!(!queue.passive);
    }

    #[test]
    fn test_queue_conflict_ignores_passive_flag() {
        let existing = QueueDeclaration::new("orders");
        assert!(!existing.conflicts_with(&QueueDeclaration::new("orders").passive(true)));
        assert!(existing.conflicts_with(&QueueDeclaration::new("orders").durable(false)));
    }

    #[test]
    fn test_queue_conflict_compares_arguments() {
        let existing = QueueDeclaration::new("orders").argument("x-max-length", AMQPValue::LongInt(10));

        let same = QueueDeclaration::new("orders").argument("x-max-length", AMQPValue::LongInt(10));
        assert!(!existing.conflicts_with(&same));

        let other_limit = QueueDeclaration::new("orders").argument("x-max-length", AMQPValue::LongInt(20));
        assert!(existing.conflicts_with(&other_limit));
        assert!(existing.conflicts_with(&QueueDeclaration::new("orders")));
    }

    #[test]
    fn test_exchange_conflict_compares_arguments() {
        let existing = ExchangeDeclaration::new("events")
            .argument("alternate-exchange", AMQPValue::LongString("unrouted".into()));
        assert!(existing.conflicts_with(&ExchangeDeclaration::new("events")));
        assert!(!existing.conflicts_with(&existing.clone()));
    }

    #[test]
    fn test_exchange_defaults_to_fanout() {
        let exchange = ExchangeDeclaration::new("events");
        assert_eq!(exchange.kind, ExchangeType::Fanout);
        assert!(!exchange.durable);
        assert!(exchange.conflicts_with(&ExchangeDeclaration::new("events").kind(ExchangeType::Topic)));
    }

    #[test]
    fn test_options_carry_flags() {
        let options = QueueDeclaration::new("q").exclusive(true).auto_delete(true).options();
        assert!(options.exclusive && options.auto_delete && options.durable);
        assert!(!options.nowait);

        let options = ExchangeDeclaration::new("x").internal(true).options();
        assert!(options.internal);
    }

    #[test]
    fn test_exchange_type_deserializes_lowercase() {
        let kind: ExchangeType = serde_json::from_str("\"topic\"").unwrap();
        assert_eq!(kind, ExchangeType::Topic);
        assert!(matches!(ExchangeKind::from(kind), ExchangeKind::Topic));
    }
}
