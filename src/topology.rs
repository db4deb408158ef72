// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Declarative Topology
//!
//! A [`TopologyDefinition`] describes a whole set of exchanges, queues, and
//! bindings in one serde-deserializable record, so a topology can be built
//! in code or loaded straight from configuration and handed to
//! `Connection::declare_topology`. Declaration order within the lists is
//! irrelevant: declaring is idempotent and bindings declare their endpoints
//! on the fly.

use crate::{
    broker::Arguments,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
};
use serde::{Deserialize, Serialize};

/// The full set of exchanges, queues, and bindings declared together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologyDefinition {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl TopologyDefinition {
    pub fn new() -> TopologyDefinition {
        TopologyDefinition::default()
    }

    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    pub fn queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    pub fn binding(mut self, spec: BindingSpec) -> Self {
        self.bindings.push(spec);
        self
    }
}

/// One exchange to declare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> ExchangeSpec {
        ExchangeSpec {
            name: name.into(),
            kind,
            options: ExchangeOptions::default(),
        }
    }

    pub fn options(mut self, options: ExchangeOptions) -> Self {
        self.options = options;
        self
    }
}

/// One queue to declare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSpec {
    pub name: String,
    pub options: QueueOptions,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> QueueSpec {
        QueueSpec {
            name: name.into(),
            options: QueueOptions::default(),
        }
    }

    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }
}

/// One binding to declare: from a source exchange to either a queue or an
/// exchange. A spec naming neither destination fails declaration with
/// `InvalidBinding`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindingSpec {
    pub source: String,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub pattern: String,
    pub args: Arguments,
}

impl BindingSpec {
    /// Binds `queue` to messages routed by `source`.
    pub fn to_queue(
        source: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
    ) -> BindingSpec {
        BindingSpec {
            source: source.into(),
            exchange: None,
            queue: Some(queue.into()),
            pattern: pattern.into(),
            args: Arguments::new(),
        }
    }

    /// Binds the destination `exchange` to messages routed by `source`.
    pub fn to_exchange(
        source: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> BindingSpec {
        BindingSpec {
            source: source.into(),
            exchange: Some(exchange.into()),
            queue: None,
            pattern: pattern.into(),
            args: Arguments::new(),
        }
    }

    pub fn args(mut self, args: Arguments) -> Self {
        self.args = args;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topology_deserializes_from_configuration_json() {
        let topology: TopologyDefinition = serde_json::from_value(json!({
            "exchanges": [
                {"name": "events", "type": "topic", "options": {"durable": true}},
                {"name": "audit"}
            ],
            "queues": [
                {"name": "event-log", "options": {"messageTtl": 60000}}
            ],
            "bindings": [
                {"source": "events", "queue": "event-log", "pattern": "audit.*"},
                {"source": "events", "exchange": "audit", "pattern": "#"}
            ]
        }))
        .unwrap();

        assert_eq!(topology.exchanges.len(), 2);
        assert_eq!(topology.exchanges[0].kind, ExchangeKind::Topic);
        assert!(topology.exchanges[0].options.durable);
        assert_eq!(topology.exchanges[1].kind, ExchangeKind::Direct);
        assert_eq!(topology.queues[0].options.message_ttl, Some(60000));
        assert_eq!(topology.bindings[0].queue.as_deref(), Some("event-log"));
        assert_eq!(topology.bindings[1].exchange.as_deref(), Some("audit"));
    }

    #[test]
    fn builders_assemble_the_same_shape() {
        let topology = TopologyDefinition::new()
            .exchange(ExchangeSpec::new("events", ExchangeKind::Topic))
            .queue(QueueSpec::new("event-log"))
            .binding(BindingSpec::to_queue("events", "event-log", "audit.*"));

        assert_eq!(topology.exchanges[0].name, "events");
        assert_eq!(topology.bindings[0].source, "events");
        assert_eq!(topology.bindings[0].pattern, "audit.*");
        assert!(topology.bindings[0].exchange.is_none());
    }

    #[test]
    fn a_binding_spec_may_name_no_destination() {
        let spec: BindingSpec =
            serde_json::from_value(json!({"source": "events", "pattern": ""})).unwrap();
        assert!(spec.exchange.is_none());
        assert!(spec.queue.is_none());
    }
}
