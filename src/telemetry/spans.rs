// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Span helpers for manager operations.

use tracing::{info_span, Span};

/// Record an operation's outcome on its span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for the span every manager operation runs in.
pub struct OperationSpan;

impl OperationSpan {
    /// `status` and `error.message` are filled in by
    /// [`SpanExt::record_result`]; `service_id` once a lease is granted.
    pub fn new(op: &'static str, client_id: u64) -> Span {
        info_span!(
            "rm_operation",
            op,
            client_id,
            service_id = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
