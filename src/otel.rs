// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for Pulse Consumers
//!
//! This module extracts trace context from incoming message headers and
//! creates consumer spans for message processing, so handler executions link
//! up with the publisher's trace when one propagated context.

use std::borrow::Cow;
use std::collections::BTreeMap;

use lapin::protocol::basic::AMQPProperties;
use lapin::types::{AMQPValue, ShortString};
use opentelemetry::global::{BoxedSpan, BoxedTracer};
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::{SpanKind, Tracer};
use opentelemetry::Context;
use tracing::warn;

/// An adapter for extracting OpenTelemetry context from Pulse message headers.
pub(crate) struct PulseTracePropagator<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> PulseTracePropagator<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for PulseTracePropagator<'_> {
    /// Looks up a propagation header, tolerating both string encodings a
    /// publisher may have used.
    ///
    /// # Parameters
    /// * `key` - The header key to retrieve
    ///
    /// # Returns
    /// The header value as a string slice, or None if absent or not a string
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => match std::str::from_utf8(value.as_bytes()) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(error = err.to_string(), header = key, "non-utf8 trace header");
                    None
                }
            },
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Creates a new OpenTelemetry span for message processing.
///
/// This function extracts trace context from message properties and
/// creates a new consumer span for processing the message.
///
/// # Parameters
/// * `props` - Pulse message properties containing headers
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the routing key)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let headers = props.headers().clone().unwrap_or_default();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&PulseTracePropagator::new(headers.inner()))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
