// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pulse Topic Queue Consumer
//!
//! This module provides the durable topic-consumer abstraction. A consumer
//! declares its queue and bindings once up front, then re-installs them on
//! every fresh connection the manager produces, so a recycled or failed
//! connection never loses the subscription. Deliveries are dispatched with
//! bounded concurrency (the channel's prefetch), decoded into structured
//! messages, and acknowledged according to the redelivery policy: a first
//! handler failure requeues the message, a repeated one discards it and
//! reports to the monitor.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::constants::REPLY_SUCCESS;
use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use lapin::Channel;
use opentelemetry::global;
use opentelemetry::trace::{Span, Status};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connection::{ConnectionEvent, ConnectionState, PulseConnection};
use crate::errors::PulseError;
use crate::manager::PulseManager;
use crate::monitor::ErrorContext;
use crate::otel;
use crate::queue::ConsumerDefinition;
use crate::routing::parse_routing_key;

/// Header carrying the supplementary routes of a delivery
pub const AMQP_HEADERS_CC: &str = "CC";
/// Header field used to cap queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Prefix stripped from `CC` entries when collecting routes
pub const CC_ROUTE_PREFIX: &str = "route.";

/// Errors a message handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A decoded delivery, ready for handling.
#[derive(Debug, Clone)]
pub struct PulseMessage {
    /// The message body, decoded as UTF-8 JSON.
    pub payload: Value,
    /// Exchange the message was published to.
    pub exchange: String,
    /// The delivery's routing key.
    pub routing_key: String,
    /// Whether the broker redelivered this message after an earlier attempt.
    pub redelivered: bool,
    /// Supplementary route names from the `CC` header, prefix stripped.
    pub routes: Vec<String>,
    /// Routing-key components decoded against the binding's reference, when
    /// the delivery's exchange has one.
    pub routing: Option<HashMap<String, String>>,
}

/// Processes decoded messages from a queue.
///
/// Handlers may run concurrently up to the prefetch bound; implementations
/// are responsible for their own synchronization. Returning an error nacks
/// the delivery: the broker retries once, a repeated failure discards the
/// message and reports it to the monitor.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message.
    async fn handle(&self, message: PulseMessage) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(PulseMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: PulseMessage) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Starts consuming from a queue.
///
/// The queue is declared and bound immediately so it exists before the first
/// message is published, then re-declared with identical options on every
/// connection the manager subsequently establishes.
///
/// # Parameters
/// * `manager` - The connection manager to consume through
/// * `definition` - Queue selection, bindings, prefetch and length options
/// * `handler` - Invoked once per delivery
///
/// # Returns
/// A consumer handle, or a configuration error naming the problem
pub async fn consume<H>(
    manager: &PulseManager,
    definition: ConsumerDefinition,
    handler: H,
) -> Result<PulseConsumer, PulseError>
where
    H: MessageHandler + 'static,
{
    definition.validate()?;
    let queue_name = definition.resolve_queue_name(manager.namespace());

    let (errors_tx, _) = broadcast::channel(16);
    let inner = Arc::new(ConsumerInner {
        manager: manager.clone(),
        definition,
        queue_name,
        handler: Arc::new(handler),
        running: AtomicBool::new(true),
        active: Mutex::new(ActiveConsumer::default()),
        in_flight: Arc::new(InFlight::default()),
        errors_tx,
    });

    // Make sure the queue exists before anything is published to it.
    let declared = manager
        .with_channel(|channel| {
            let inner = inner.clone();
            async move { inner.install_queue(&channel).await }
        })
        .await?;
    if declared.is_none() {
        debug!(queue = %inner.queue_name, "initial declaration skipped, broker mid-reconnect");
    }

    let mut connected = manager.on_connected();
    if let Some(connection) = manager.active_connection() {
        inner.attach(connection).await;
    }

    let listener = tokio::spawn({
        let inner = inner.clone();
        async move {
            loop {
                match connected.recv().await {
                    Ok(connection) => inner.attach(connection).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(connection) = inner.manager.active_connection() {
                            inner.attach(connection).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    });

    Ok(PulseConsumer { inner, listener })
}

/// A handle on a running consumer.
pub struct PulseConsumer {
    inner: Arc<ConsumerInner>,
    listener: JoinHandle<()>,
}

impl PulseConsumer {
    /// The broker-wide name of the queue being consumed.
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    /// Subscribes to user-visible consumer errors.
    ///
    /// An exclusive consumer emits
    /// [`PulseError::ExclusiveQueueDisconnected`] here when its connection
    /// retires while the manager keeps running; the queue vanished with the
    /// connection and pending messages are gone.
    pub fn on_error(&self) -> broadcast::Receiver<PulseError> {
        self.inner.errors_tx.subscribe()
    }

    /// Stops consuming. Idempotent.
    ///
    /// Cancels the consumer, waits for in-flight handlers to finish, and
    /// closes the channel. The queue and its bindings remain on the broker.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.listener.abort();

        let (channel, consumer_tag) = {
            let mut active = self.inner.active.lock().expect("consumer state lock poisoned");
            active.connection_id = None;
            (active.channel.take(), active.consumer_tag.take())
        };

        if let (Some(channel), Some(consumer_tag)) = (channel, consumer_tag) {
            detach_channel(&channel, &consumer_tag, &self.inner.in_flight).await;
        } else {
            self.inner.in_flight.wait_idle().await;
        }
    }
}

#[derive(Default)]
struct ActiveConsumer {
    channel: Option<Channel>,
    consumer_tag: Option<String>,
    connection_id: Option<u64>,
}

struct ConsumerInner {
    manager: PulseManager,
    definition: ConsumerDefinition,
    queue_name: String,
    handler: Arc<dyn MessageHandler>,
    running: AtomicBool,
    active: Mutex<ActiveConsumer>,
    in_flight: Arc<InFlight>,
    errors_tx: broadcast::Sender<PulseError>,
}

impl ConsumerInner {
    async fn attach(self: &Arc<Self>, connection: Arc<PulseConnection>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut active = self.active.lock().expect("consumer state lock poisoned");
            if active.connection_id == Some(connection.id()) {
                return;
            }
            active.connection_id = Some(connection.id());
        }

        if let Err(err) = self.install(&connection).await {
            error!(
                error = err.to_string(),
                queue = %self.queue_name,
                "failed to install consumer on connection"
            );
            self.manager.monitor().report_error(
                &err,
                &ErrorContext {
                    queue_name: Some(self.queue_name.clone()),
                    ..ErrorContext::default()
                },
            );
            connection.failed();
        }
    }

    async fn install(self: &Arc<Self>, connection: &Arc<PulseConnection>) -> Result<(), PulseError> {
        // Subscribed before any broker round-trip so retirement cannot slip by.
        let events = connection.subscribe();

        let Some(amqp) = connection.amqp() else {
            return Err(PulseError::ConnectionError);
        };

        let channel = amqp.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            PulseError::ChannelError
        })?;

        channel
            .basic_qos(self.definition.prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| PulseError::QoSDeclarationError(err.to_string()))?;

        self.install_queue(&channel).await?;

        // A channel-level error invalidates the whole connection.
        {
            let connection = connection.clone();
            channel.on_error(move |err| {
                error!(error = err.to_string(), "consumer channel errored");
                connection.failed();
            });
        }

        let consumer_tag = format!("{}-{}", self.queue_name, Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &self.queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                PulseError::ConsumerDeclarationError
            })?;

        {
            let mut active = self.active.lock().expect("consumer state lock poisoned");
            active.channel = Some(channel.clone());
            active.consumer_tag = Some(consumer_tag.clone());
        }

        debug!(queue = %self.queue_name, consumer = %consumer_tag, "consumer installed");

        let this = self.clone();
        let conn = connection.clone();
        tokio::spawn(async move { this.drain_deliveries(consumer, conn).await });

        let this = self.clone();
        let conn = connection.clone();
        tokio::spawn(async move {
            this.watch_retirement(conn, events, channel, consumer_tag).await
        });

        Ok(())
    }

    /// Declares the queue and applies every binding.
    ///
    /// Declaration is idempotent: the same options are used every time, so a
    /// queue surviving from an earlier connection is simply re-asserted.
    async fn install_queue(&self, channel: &Channel) -> Result<(), PulseError> {
        let options = if self.definition.exclusive_queue {
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: true,
                auto_delete: true,
                nowait: false,
            }
        } else {
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            }
        };

        let mut queue_args = BTreeMap::new();
        if let Some(max_length) = self.definition.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max_length)),
            );
        }

        debug!("creating queue: {}", self.queue_name);
        channel
            .queue_declare(&self.queue_name, options, FieldTable::from(queue_args))
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the queue");
                PulseError::DeclareQueueError(self.queue_name.clone())
            })?;

        for binding in &self.definition.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                self.queue_name, binding.exchange, binding.routing_key_pattern
            );
            channel
                .queue_bind(
                    &self.queue_name,
                    &binding.exchange,
                    &binding.routing_key_pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    PulseError::BindQueueError(
                        self.queue_name.clone(),
                        binding.exchange.clone(),
                    )
                })?;
        }

        Ok(())
    }

    async fn drain_deliveries(
        self: Arc<Self>,
        mut consumer: lapin::Consumer,
        connection: Arc<PulseConnection>,
    ) {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    let guard = self.in_flight.enter();
                    let this = self.clone();
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        this.handle_delivery(delivery, connection, guard).await;
                    });
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = %self.queue_name,
                        "consumer stream failed"
                    );
                    connection.failed();
                    break;
                }
            }
        }
    }

    async fn handle_delivery(
        self: Arc<Self>,
        delivery: Delivery,
        connection: Arc<PulseConnection>,
        guard: InFlightGuard,
    ) {
        let message = match self.decode_message(&delivery) {
            Ok(message) => message,
            Err(err) => {
                drop(guard);
                self.internal_failure(err, &connection, None);
                return;
            }
        };

        let exchange = message.exchange.clone();
        let redelivered = message.redelivered;

        let tracer = global::tracer("pulse consumer");
        let (_ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &message.routing_key);

        let result = self.handler.handle(message).await;

        // The in-flight count drops once the handler is done; drain waits on
        // handler completion, not on acknowledgement round-trips.
        drop(guard);

        match result {
            Ok(()) => {
                span.set_status(Status::Ok);
                if let Err(err) = delivery.ack(BasicAckOptions { multiple: false }).await {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    self.internal_failure(PulseError::AckMessageError, &connection, Some(&exchange));
                }
            }
            Err(err) => {
                span.record_error(err.as_ref());
                span.set_status(Status::Error {
                    description: Cow::from("handler failed"),
                });

                if !redelivered {
                    warn!(queue = %self.queue_name, "error whiling handling msg, requeuing for retry");
                    if let Err(nack_err) = delivery
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        })
                        .await
                    {
                        error!(error = nack_err.to_string(), "error whiling requeuing");
                        self.internal_failure(
                            PulseError::NackMessageError,
                            &connection,
                            Some(&exchange),
                        );
                    }
                } else {
                    error!(queue = %self.queue_name, "handler failed on redelivered msg, discarding");
                    self.manager.monitor().report_error(
                        err.as_ref(),
                        &ErrorContext {
                            queue_name: Some(self.queue_name.clone()),
                            exchange: Some(exchange.clone()),
                            redelivered: Some(true),
                        },
                    );
                    if let Err(nack_err) = delivery
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: false,
                        })
                        .await
                    {
                        error!(error = nack_err.to_string(), "error whiling nack msg");
                        self.internal_failure(
                            PulseError::NackMessageError,
                            &connection,
                            Some(&exchange),
                        );
                    }
                }
            }
        }
    }

    fn decode_message(&self, delivery: &Delivery) -> Result<PulseMessage, PulseError> {
        let payload: Value = serde_json::from_slice(&delivery.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            PulseError::ParsePayloadError
        })?;

        let routes = extract_routes(delivery.properties.headers().as_ref());

        let exchange = delivery.exchange.as_str();
        let routing_key = delivery.routing_key.as_str();
        let reference = self.definition.bindings.iter().find_map(|binding| {
            if binding.exchange == exchange {
                binding.reference.as_ref()
            } else {
                None
            }
        });
        let routing = match reference {
            Some(reference) => Some(parse_routing_key(routing_key, reference)?),
            None => None,
        };

        Ok(PulseMessage {
            payload,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: delivery.redelivered,
            routes,
            routing,
        })
    }

    /// A failure outside the user handler: the channel is presumed poisoned.
    fn internal_failure(
        &self,
        err: PulseError,
        connection: &Arc<PulseConnection>,
        exchange: Option<&str>,
    ) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        error!(error = err.to_string(), queue = %self.queue_name, "internal consumer failure");
        self.manager.monitor().report_error(
            &err,
            &ErrorContext {
                queue_name: Some(self.queue_name.clone()),
                exchange: exchange.map(str::to_owned),
                redelivered: None,
            },
        );
        connection.failed();
    }

    async fn watch_retirement(
        self: Arc<Self>,
        connection: Arc<PulseConnection>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        channel: Channel,
        consumer_tag: String,
    ) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Retiring | ConnectionEvent::Finished) => break,
                Ok(ConnectionEvent::Connected) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if matches!(
                        connection.state(),
                        ConnectionState::Retiring | ConnectionState::Finished
                    ) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }

        debug!(queue = %self.queue_name, "connection retiring, winding consumer down");
        detach_channel(&channel, &consumer_tag, &self.in_flight).await;

        {
            let mut active = self.active.lock().expect("consumer state lock poisoned");
            if active.connection_id == Some(connection.id()) {
                active.channel = None;
                active.consumer_tag = None;
            }
        }

        if self.definition.exclusive_queue
            && self.manager.is_running()
            && self.running.load(Ordering::SeqCst)
        {
            let _ = self.errors_tx.send(PulseError::ExclusiveQueueDisconnected);
        }
    }
}

/// Cancels the consumer, lets in-flight handlers drain, then closes the
/// channel. All broker calls are best-effort; the channel may already be
/// dead.
async fn detach_channel(channel: &Channel, consumer_tag: &str, in_flight: &InFlight) {
    if let Err(err) = channel
        .basic_cancel(consumer_tag, BasicCancelOptions::default())
        .await
    {
        debug!(error = err.to_string(), "ignoring consumer cancel failure");
    }

    in_flight.wait_idle().await;

    if let Err(err) = channel.close(REPLY_SUCCESS, "consumer detached").await {
        debug!(error = err.to_string(), "ignoring channel close failure");
    }
}

fn extract_routes(headers: Option<&FieldTable>) -> Vec<String> {
    let Some(headers) = headers else {
        return vec![];
    };
    let Some(AMQPValue::FieldArray(cc)) = headers.inner().get(AMQP_HEADERS_CC) else {
        return vec![];
    };

    cc.as_slice()
        .iter()
        .filter_map(|value| match value {
            AMQPValue::LongString(value) => {
                std::str::from_utf8(value.as_bytes()).ok().map(str::to_owned)
            }
            AMQPValue::ShortString(value) => Some(value.to_string()),
            _ => None,
        })
        .filter_map(|route| route.strip_prefix(CC_ROUTE_PREFIX).map(str::to_owned))
        .collect()
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: self.clone(),
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldArray, LongString};

    fn cc_headers(entries: &[&str]) -> FieldTable {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_CC),
            AMQPValue::FieldArray(FieldArray::from(
                entries
                    .iter()
                    .map(|entry| AMQPValue::LongString(LongString::from(*entry)))
                    .collect::<Vec<_>>(),
            )),
        );
        FieldTable::from(headers)
    }

    #[test]
    fn collects_routes_and_strips_the_prefix() {
        let headers = cc_headers(&["route.index.v1", "route.", "not-a-route"]);

        assert_eq!(
            extract_routes(Some(&headers)),
            vec!["index.v1".to_owned(), "".to_owned()]
        );
    }

    #[test]
    fn missing_cc_header_yields_no_routes() {
        assert!(extract_routes(None).is_empty());
        assert!(extract_routes(Some(&FieldTable::default())).is_empty());
    }

    #[tokio::test]
    async fn closures_are_message_handlers() {
        let handler = |message: PulseMessage| async move {
            assert_eq!(message.payload["i"], 1);
            Ok::<(), HandlerError>(())
        };

        let message = PulseMessage {
            payload: serde_json::json!({ "i": 1 }),
            exchange: "exchange/my-service/v1/event-happened".to_owned(),
            routing_key: "primary.abc".to_owned(),
            redelivered: false,
            routes: vec![],
            routing: None,
        };

        handler.handle(message).await.unwrap();
    }

    #[tokio::test]
    async fn in_flight_guard_releases_waiters() {
        let in_flight = Arc::new(InFlight::default());

        let guard = in_flight.enter();
        let waiter = tokio::spawn({
            let in_flight = in_flight.clone();
            async move { in_flight.wait_idle().await }
        });

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(in_flight.count.load(Ordering::SeqCst), 0);
    }
}
