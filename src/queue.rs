// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Bindings and Consumer Options
//!
//! This module provides the types a consumer is configured with: the bindings
//! that steer messages onto its queue and the options controlling queue
//! semantics, prefetch and length limits. Consumers use either a persistent
//! named queue or an ephemeral exclusive queue; the two are mutually
//! exclusive.

use uuid::Uuid;

use crate::errors::PulseError;
use crate::routing::RoutingKeyReference;

/// Default per-channel cap on unacknowledged deliveries.
pub const DEFAULT_PREFETCH: u16 = 5;

/// A `(exchange, routing-key pattern)` association installed on the broker.
///
/// The optional reference describes the components of matching routing keys;
/// deliveries from this exchange then carry a decoded `routing` map.
#[derive(Debug, Clone)]
pub struct Binding {
    pub(crate) exchange: String,
    pub(crate) routing_key_pattern: String,
    pub(crate) reference: Option<RoutingKeyReference>,
}

impl Binding {
    /// Creates a binding for the given exchange and pattern.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to bind against
    /// * `routing_key_pattern` - Topic pattern, `*` and `#` wildcards allowed
    ///
    /// # Returns
    /// A new binding without a routing-key reference
    pub fn new(exchange: &str, routing_key_pattern: &str) -> Binding {
        Binding {
            exchange: exchange.to_owned(),
            routing_key_pattern: routing_key_pattern.to_owned(),
            reference: None,
        }
    }

    /// Attaches a routing-key reference to this binding.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn reference(mut self, reference: RoutingKeyReference) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Options for a topic queue consumer.
///
/// This struct implements the builder pattern. Exactly one of a persistent
/// queue name or the exclusive-queue flag must be chosen; validation happens
/// when the consumer is created.
#[derive(Debug, Clone)]
pub struct ConsumerDefinition {
    pub(crate) queue_name: Option<String>,
    pub(crate) exclusive_queue: bool,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) prefetch: u16,
    pub(crate) max_length: Option<i32>,
}

impl Default for ConsumerDefinition {
    fn default() -> Self {
        ConsumerDefinition {
            queue_name: None,
            exclusive_queue: false,
            bindings: vec![],
            prefetch: DEFAULT_PREFETCH,
            max_length: None,
        }
    }
}

impl ConsumerDefinition {
    /// Creates a definition with default settings.
    ///
    /// # Returns
    /// A new definition with no queue selected yet
    pub fn new() -> ConsumerDefinition {
        ConsumerDefinition::default()
    }

    /// Consumes from the persistent queue with the given name.
    ///
    /// The queue is declared durable and survives both disconnects and
    /// consumer restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_name(mut self, name: &str) -> Self {
        self.queue_name = Some(name.to_owned());
        self
    }

    /// Consumes from a fresh exclusive queue.
    ///
    /// Exclusive queues are deleted when their connection closes, so messages
    /// published while disconnected are lost.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive_queue(mut self) -> Self {
        self.exclusive_queue = true;
        self
    }

    /// Adds a binding to install on the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Sets the per-channel cap on unacknowledged deliveries.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), PulseError> {
        match (&self.queue_name, self.exclusive_queue) {
            (Some(_), true) => Err(PulseError::ConflictingOptions(
                "`queue_name` and `exclusive_queue` are mutually exclusive".to_owned(),
            )),
            (None, false) => Err(PulseError::MissingOption(
                "one of `queue_name` or `exclusive_queue`".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    /// Resolves the broker-wide queue name for this definition.
    ///
    /// Exclusive queues get a fresh slug each time this is called.
    pub(crate) fn resolve_queue_name(&self, namespace: &str) -> String {
        match &self.queue_name {
            Some(name) => format!("queue/{namespace}/{name}"),
            None => format!("queue/{namespace}/exclusive/{}", Uuid::new_v4().simple()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_queue_name_with_exclusive_queue() {
        let err = ConsumerDefinition::new()
            .queue_name("tasks")
            .exclusive_queue()
            .validate()
            .unwrap_err();

        assert!(matches!(err, PulseError::ConflictingOptions(_)));
    }

    #[test]
    fn requires_a_queue_choice() {
        let err = ConsumerDefinition::new().validate().unwrap_err();

        assert_eq!(
            err,
            PulseError::MissingOption("one of `queue_name` or `exclusive_queue`".to_owned())
        );
    }

    #[test]
    fn persistent_queue_names_carry_the_namespace() {
        let definition = ConsumerDefinition::new().queue_name("tasks");

        assert_eq!(definition.resolve_queue_name("me"), "queue/me/tasks");
    }

    #[test]
    fn exclusive_queue_names_get_a_fresh_slug() {
        let definition = ConsumerDefinition::new().exclusive_queue();

        let first = definition.resolve_queue_name("me");
        let second = definition.resolve_queue_name("me");

        assert!(first.starts_with("queue/me/exclusive/"));
        assert_ne!(first, second);
    }

    #[test]
    fn prefetch_defaults_to_five() {
        assert_eq!(ConsumerDefinition::new().prefetch, DEFAULT_PREFETCH);
    }
}
