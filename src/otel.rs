// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through the envelope's string headers: published
//! messages carry the caller's context, and each delivery is handled inside a
//! consumer span parented on it.

use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Writes trace context entries into envelope headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context entries from envelope headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into `headers` with the global propagator.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Creates a consumer span for a delivery, parented on the context found in
/// its headers.
pub(crate) fn new_span(
    headers: &BTreeMap<String, String>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(headers.get("traceparent").map(String::as_str), Some("00-abc-def-01"));
    }

    #[test]
    fn extractor_reads_headers() {
        let headers = BTreeMap::from([
            ("traceparent".to_owned(), "00-abc-def-01".to_owned()),
            ("tracestate".to_owned(), "k=v".to_owned()),
        ]);
        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("tracestate"), Some("k=v"));
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys(), vec!["traceparent", "tracestate"]);
    }

    #[test]
    fn span_creation_without_context_does_not_fail() {
        let tracer = global::tracer("amqp consumer");
        let (_ctx, _span) = new_span(&BTreeMap::new(), &tracer, "q1");
    }
}
