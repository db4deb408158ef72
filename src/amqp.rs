// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Backend
//!
//! Implementation of the broker capability traits over lapin. All lapin
//! types stay inside this module: argument maps are converted between JSON
//! maps and `FieldTable`s at the boundary, message properties are assembled
//! into `BasicProperties`, and lapin's error callback is adapted into the
//! connection event stream the supervisor drains.

use crate::{
    broker::{
        Arguments, Broker, BrokerChannel, BrokerConnection, ConnectionEvent, ConsumeOptions,
        Delivery, DeliveryStream, EventReceiver, ExchangeDeclare, MessageProperties, QueueDeclare,
    },
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRecoverOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Socket option key carrying a human-readable connection name.
pub const SOCKET_OPTION_CONNECTION_NAME: &str = "connectionName";

/// Broker backend speaking AMQP 0-9-1 through lapin.
#[derive(Debug, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Arc<AmqpBroker> {
        Arc::new(AmqpBroker)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        url: &str,
        socket_options: &Arguments,
    ) -> Result<(Arc<dyn BrokerConnection>, EventReceiver), AmqpError> {
        debug!("creating amqp connection...");

        let mut properties = ConnectionProperties::default();
        if let Some(Value::String(name)) = socket_options.get(SOCKET_OPTION_CONNECTION_NAME) {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match Connection::connect(url, properties).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionFailed(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (tx, rx) = mpsc::unbounded_channel();
        conn.on_error(move |err| {
            let _ = tx.send(ConnectionEvent::Error(err.to_string()));
        });

        Ok((Arc::new(AmqpConnection { conn }), rx))
    }
}

struct AmqpConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => Ok(Arc::new(AmqpChannel { channel })),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelFailed(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(200, "closing connection")
            .await
            .map_err(|err| AmqpError::ConnectionFailed(err.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_exchange(&self, name: &str, declare: &ExchangeDeclare) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(&declare.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: declare.durable,
                    auto_delete: declare.auto_delete,
                    internal: declare.internal,
                    nowait: false,
                },
                to_field_table(&declare.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::AssertionFailed(format!("exchange `{}`: {}", name, err))
            })
    }

    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::AssertionFailed(format!("exchange `{}`: {}", name, err)))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| AmqpError::AssertionFailed(format!("exchange `{}`: {}", name, err)))
    }

    async fn assert_queue(&self, name: &str, declare: &QueueDeclare) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: declare.durable,
                    exclusive: declare.exclusive,
                    auto_delete: declare.auto_delete,
                    nowait: false,
                },
                to_field_table(&declare.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                AmqpError::AssertionFailed(format!("queue `{}`: {}", name, err))
            })
    }

    async fn check_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::AssertionFailed(format!("queue `{}`: {}", name, err)))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::AssertionFailed(format!("queue `{}`: {}", name, err)))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions { nowait: false },
                to_field_table(args),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::AssertionFailed(format!(
                    "binding of queue `{}` to exchange `{}`: {}",
                    queue, exchange, err
                ))
            })
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, pattern, to_field_table(args))
            .await
            .map_err(|err| {
                AmqpError::AssertionFailed(format!(
                    "unbinding of queue `{}` from exchange `{}`: {}",
                    queue, exchange, err
                ))
            })
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                pattern,
                ExchangeBindOptions { nowait: false },
                to_field_table(args),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                AmqpError::AssertionFailed(format!(
                    "binding of exchange `{}` to exchange `{}`: {}",
                    destination, source, err
                ))
            })
    }

    async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_unbind(
                destination,
                source,
                pattern,
                ExchangeUnbindOptions { nowait: false },
                to_field_table(args),
            )
            .await
            .map_err(|err| {
                AmqpError::AssertionFailed(format!(
                    "unbinding of exchange `{}` from exchange `{}`: {}",
                    destination, source, err
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(properties),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishFailed(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<(String, DeliveryStream), AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                to_field_table(&options.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumeFailed(queue.to_owned())
            })?;

        let tag = consumer.tag().to_string();
        let stream = consumer.filter_map(|result| async move {
            match result {
                Ok(delivery) => Some(from_lapin_delivery(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    None
                }
            }
        });

        Ok((tag, Box::pin(stream)))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ChannelFailed(err.to_string()))
    }

    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::ChannelFailed(err.to_string()))
    }

    async fn recover(&self) -> Result<(), AmqpError> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await
            .map_err(|err| AmqpError::ChannelFailed(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::ChannelFailed(err.to_string())
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::ChannelFailed(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(200, "closing channel")
            .await
            .map_err(|err| AmqpError::ChannelFailed(err.to_string()))
    }
}

fn exchange_kind(kind: &str) -> lapin::ExchangeKind {
    match kind {
        "direct" => lapin::ExchangeKind::Direct,
        "fanout" => lapin::ExchangeKind::Fanout,
        "topic" => lapin::ExchangeKind::Topic,
        "headers" => lapin::ExchangeKind::Headers,
        other => lapin::ExchangeKind::Custom(other.to_owned()),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        delivery_tag: delivery.delivery_tag,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(content_encoding) = &properties.content_encoding {
        props = props.with_content_encoding(ShortString::from(content_encoding.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        props = props.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(expiration) = &properties.expiration {
        props = props.with_expiration(ShortString::from(expiration.clone()));
    }
    if properties.persistent {
        props = props.with_delivery_mode(2);
    }
    if !properties.headers.is_empty() {
        props = props.with_headers(to_field_table(&properties.headers));
    }
    props
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        content_encoding: props.content_encoding().as_ref().map(|v| v.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        expiration: props.expiration().as_ref().map(|v| v.to_string()),
        persistent: matches!(*props.delivery_mode(), Some(2)),
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

fn to_field_table(args: &Arguments) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in args {
        btree.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    FieldTable::from(btree)
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(v) => {
            if let Some(i) = v.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(v.as_f64().unwrap_or_default())
            }
        }
        Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        Value::Array(values) => {
            AMQPValue::FieldArray(FieldArray::from(
                values.iter().map(to_amqp_value).collect::<Vec<_>>(),
            ))
        }
        Value::Object(map) => AMQPValue::FieldTable(to_field_table(map)),
    }
}

fn from_field_table(table: &FieldTable) -> Arguments {
    let mut args = Arguments::new();
    for (key, value) in table.inner() {
        args.insert(key.to_string(), from_amqp_value(value));
    }
    args
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::ShortString(v) => Value::String(v.to_string()),
        AMQPValue::LongString(v) => {
            Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::FieldArray(values) => {
            Value::Array(values.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(from_field_table(table)),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_values_map_to_their_amqp_counterparts() {
        assert_eq!(to_amqp_value(&Value::Null), AMQPValue::Void);
        assert_eq!(to_amqp_value(&json!(true)), AMQPValue::Boolean(true));
        assert_eq!(to_amqp_value(&json!(42)), AMQPValue::LongLongInt(42));
        assert_eq!(to_amqp_value(&json!(1.5)), AMQPValue::Double(1.5));
        assert_eq!(
            to_amqp_value(&json!("ttl")),
            AMQPValue::LongString(LongString::from("ttl"))
        );
    }

    #[test]
    fn nested_structures_convert_recursively() {
        let mut args = Arguments::new();
        args.insert("x-match".to_owned(), json!("all"));
        args.insert("limits".to_owned(), json!([1, 2]));

        let table = to_field_table(&args);
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-match")),
            Some(&AMQPValue::LongString(LongString::from("all")))
        );
        assert!(matches!(
            inner.get(&ShortString::from("limits")),
            Some(AMQPValue::FieldArray(_))
        ));
    }

    #[test]
    fn field_table_round_trips_through_json() {
        let mut args = Arguments::new();
        args.insert("x-message-ttl".to_owned(), json!(30000));
        args.insert("alternate-exchange".to_owned(), json!("fallback"));

        let round_tripped = from_field_table(&to_field_table(&args));
        assert_eq!(round_tripped, args);
    }

    #[test]
    fn custom_exchange_kinds_pass_through_opaquely() {
        assert_eq!(exchange_kind("topic"), lapin::ExchangeKind::Topic);
        assert_eq!(
            exchange_kind("x-delayed-message"),
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
    }

    #[test]
    fn persistent_messages_use_delivery_mode_two() {
        let props = to_basic_properties(&MessageProperties {
            persistent: true,
            correlation_id: Some("abc".to_owned()),
            ..MessageProperties::default()
        });
        assert_eq!(props.delivery_mode(), &Some(2));
        assert_eq!(
            props.correlation_id().as_ref().map(|v| v.to_string()),
            Some("abc".to_owned())
        );
    }
}
