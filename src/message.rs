// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! A [`Message`] carries the payload bytes, the property record, and, for
//! received messages, the delivery fields and the channel the delivery
//! arrived on so it can be acknowledged. Publishing goes through
//! [`Message::send_to`], which gates on the destination's readiness and
//! retransmits once after a triggered rebuild when the publish fails.

use crate::{
    binding::Destination,
    broker::{BrokerChannel, Delivery, MessageProperties},
    errors::AmqpError,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::error;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Delivery-side fields populated when a message arrives from a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFields {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
}

/// Envelope for a payload travelling through the topology.
#[derive(Clone)]
pub struct Message {
    content: Vec<u8>,
    properties: MessageProperties,
    fields: Option<DeliveryFields>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

impl Message {
    /// Creates a message carrying raw bytes.
    pub fn new(content: impl Into<Vec<u8>>) -> Message {
        Message {
            content: content.into(),
            properties: MessageProperties::default(),
            fields: None,
            channel: None,
        }
    }

    /// Creates a message carrying a UTF-8 encoded string.
    pub fn text(content: impl Into<String>) -> Message {
        Message::new(content.into().into_bytes())
    }

    /// Creates a message carrying a JSON-encoded value.
    ///
    /// Sets `content_type` to `application/json` so the receiving side knows
    /// to parse the payload back.
    pub fn json<T: Serialize>(value: &T) -> Result<Message, AmqpError> {
        let content =
            serde_json::to_vec(value).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        let mut message = Message::new(content);
        message.properties.content_type = Some(JSON_CONTENT_TYPE.to_owned());
        Ok(message)
    }

    /// Replaces the property record.
    pub fn with_properties(mut self, properties: MessageProperties) -> Message {
        self.properties = properties;
        self
    }

    /// Wraps a delivery handed over by a consumer.
    ///
    /// `channel` is the channel the delivery arrived on; it is absent for
    /// auto-acknowledged subscriptions, where ack and nack have no meaning.
    pub(crate) fn received(delivery: Delivery, channel: Option<Arc<dyn BrokerChannel>>) -> Message {
        Message {
            content: delivery.body,
            properties: delivery.properties,
            fields: Some(DeliveryFields {
                exchange: delivery.exchange,
                routing_key: delivery.routing_key,
                redelivered: delivery.redelivered,
                delivery_tag: delivery.delivery_tag,
            }),
            channel,
        }
    }

    /// The payload bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The payload decoded as UTF-8.
    pub fn text_content(&self) -> Result<String, AmqpError> {
        String::from_utf8(self.content.clone())
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// The payload parsed as JSON.
    pub fn json_content<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.content)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }

    /// Delivery fields, present only on received messages.
    pub fn fields(&self) -> Option<&DeliveryFields> {
        self.fields.as_ref()
    }

    /// Publishes this message to an exchange or queue.
    ///
    /// Queue destinations route through the default exchange with the queue
    /// name as routing key; `routing_key` is ignored for them. When the
    /// publish fails the destination's connection is asked to rebuild, and
    /// the message is retransmitted exactly once against the fresh channel.
    pub async fn send_to(
        &self,
        destination: &Destination,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self.publish_once(destination, routing_key).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    destination = destination.name(),
                    "error to publish, rebuilding connection and topology"
                );
                let Some(conn) = destination.connection() else {
                    return Err(err);
                };
                conn.rebuild_all(AmqpError::PublishFailed(err.to_string()))
                    .wait()
                    .await?;
                self.publish_once(destination, routing_key).await
            }
        }
    }

    async fn publish_once(
        &self,
        destination: &Destination,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        destination.initialized().wait().await?;
        let channel = destination.channel()?;
        let (exchange, key) = match destination {
            Destination::Queue(queue) => ("", queue.name()),
            Destination::Exchange(exchange) => (exchange.name(), routing_key),
        };
        channel.publish(exchange, key, &self.content, &self.properties).await
    }

    /// Acknowledges this delivery. No-op on messages that were not received
    /// through a consumer.
    pub async fn ack(&self, all_up_to: bool) -> Result<(), AmqpError> {
        match (&self.channel, &self.fields) {
            (Some(channel), Some(fields)) => channel.ack(fields.delivery_tag, all_up_to).await,
            _ => Ok(()),
        }
    }

    /// Negatively acknowledges this delivery. No-op on messages that were
    /// not received through a consumer.
    pub async fn nack(&self, all_up_to: bool, requeue: bool) -> Result<(), AmqpError> {
        match (&self.channel, &self.fields) {
            (Some(channel), Some(fields)) => {
                channel.nack(fields.delivery_tag, all_up_to, requeue).await
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("content_len", &self.content.len())
            .field("properties", &self.properties)
            .field("fields", &self.fields)
            .finish()
    }
}
