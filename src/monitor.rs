// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Monitoring Sink
//!
//! This module defines the reporting seam between the Pulse client and whatever
//! error-tracking system the embedding application uses. The client never
//! surfaces transport noise to the monitor; only errors a human should see
//! (repeatedly failing handlers, declaration mistakes, credential failures)
//! are reported here.

use std::error::Error;

use tracing::error;

/// Context attached to a reported error.
///
/// Every field is optional; the reporting site fills in whatever it knows
/// about the delivery or queue involved.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub queue_name: Option<String>,
    pub exchange: Option<String>,
    pub redelivered: Option<bool>,
}

/// A sink for errors the client cannot handle on its own.
///
/// Implement this trait to forward errors to an error tracker, a metrics
/// pipeline, or a log aggregator. Implementations must be cheap and must not
/// block; they are invoked from delivery-processing tasks.
pub trait Monitor: Send + Sync {
    /// Reports an error together with whatever delivery context is known.
    fn report_error(&self, error: &(dyn Error + Send + Sync), context: &ErrorContext);
}

/// A monitor that forwards every report to the `tracing` error level.
///
/// This is the zero-setup implementation; production deployments usually
/// supply their own sink instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMonitor;

impl Monitor for LoggingMonitor {
    fn report_error(&self, error: &(dyn Error + Send + Sync), context: &ErrorContext) {
        error!(
            error = error.to_string(),
            queue = context.queue_name.as_deref().unwrap_or(""),
            exchange = context.exchange.as_deref().unwrap_or(""),
            redelivered = context.redelivered.unwrap_or(false),
            "pulse client reported an error"
        );
    }
}
