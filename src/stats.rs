/**************************************************************************/
/*  This file is part of PGM2SSAT.                                        */
/*                                                                        */
/*  Copyright (C) 2025                                                    */
/*    CEA (Commissariat à l'énergie atomique et aux énergies              */
/*         alternatives)                                                  */
/*                                                                        */
/*  you can redistribute it and/or modify it under the terms of the GNU   */
/*  Lesser General Public License as published by the Free Software       */
/*  Foundation, version 2.1.                                              */
/*                                                                        */
/*  It is distributed in the hope that it will be useful,                 */
/*  but WITHOUT ANY WARRANTY; without even the implied warranty of        */
/*  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the         */
/*  GNU Lesser General Public License for more details.                   */
/*                                                                        */
/*  See the GNU Lesser General Public License version 2.1                 */
/*  for more details (enclosed in the file licenses/LGPLv2.1).            */
/*                                                                        */
/**************************************************************************/

//! Collection of statistics from tracing events and spans.
//!
//! Events carrying a `stats` field have their other fields recorded. Integer fields are
//! aggregated (first, last, min, max, sum, count), other fields keep their last value.
//! Spans carrying a `timing` field record their duration in milliseconds, aggregated the
//! same way under `time_<span name>_ms`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Aggregate of the values recorded for one integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    /// first value
    pub first: i128,
    /// last value
    pub last: i128,
    /// smallest value
    pub min: i128,
    /// largest value
    pub max: i128,
    /// sum of the values
    pub sum: i128,
    /// number of values
    pub count: u64,
}

impl Aggregate {
    fn new(value: i128) -> Self {
        Aggregate {
            first: value,
            last: value,
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    fn add(&mut self, value: i128) {
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }
}

/// Everything recorded so far
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    /// integer fields
    pub counters: BTreeMap<String, Aggregate>,
    /// other fields, last value
    pub values: BTreeMap<String, serde_json::Value>,
}

impl Stats {
    fn record_int(&mut self, name: &str, value: i128) {
        match self.counters.get_mut(name) {
            Some(a) => a.add(value),
            None => {
                self.counters.insert(name.to_owned(), Aggregate::new(value));
            }
        }
    }

    /// Flat JSON object: `<name>_<aggregate>` for counters, `<name>` for other values
    pub fn to_json(&self) -> serde_json::Value {
        let mut res = serde_json::Map::new();
        for (name, a) in &self.counters {
            let entries: [(&str, i128); 6] = [
                ("first", a.first),
                ("last", a.last),
                ("min", a.min),
                ("max", a.max),
                ("sum", a.sum),
                ("count", a.count as i128),
            ];
            for &(suffix, v) in entries.iter() {
                let number = if v < 0 {
                    serde_json::Value::from(v as i64)
                } else {
                    serde_json::Value::from(v as u64)
                };
                res.insert(format!("{}_{}", name, suffix), number);
            }
        }
        for (name, v) in &self.values {
            res.insert(name.clone(), v.clone());
        }
        serde_json::Value::Object(res)
    }
}

struct Inner {
    stats: Stats,
    /// None once dumped
    out: Option<Box<dyn Write + Send>>,
}

/// A layer recording statistics. Clones share the same statistics.
#[derive(Clone)]
pub struct StatsLayer {
    inner: Arc<Mutex<Inner>>,
}

struct StatsVisitor<'a>(&'a mut Stats);

impl<'a> StatsVisitor<'a> {
    fn ignored(field: &Field) -> bool {
        matches!(field.name(), "message" | "stats")
    }

    fn value(&mut self, field: &Field, value: serde_json::Value) {
        if !Self::ignored(field) {
            self.0.values.insert(field.name().to_owned(), value);
        }
    }

    fn int(&mut self, field: &Field, value: i128) {
        if !Self::ignored(field) {
            self.0.record_int(field.name(), value);
        }
    }
}

impl<'a> Visit for StatsVisitor<'a> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.value(field, serde_json::Value::String(format!("{:?}", value)))
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.int(field, value.into())
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.int(field, value.into())
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.value(field, value.into())
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.value(field, serde_json::Value::String(value.to_owned()))
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.value(field, serde_json::Value::Bool(value))
    }
}

impl StatsLayer {
    /// A layer writing its statistics to `out` when [`StatsLayer::dump`] is called.
    pub fn new(out: impl Write + Send + 'static) -> Self {
        StatsLayer {
            inner: Arc::new(Mutex::new(Inner {
                stats: Stats::default(),
                out: Some(Box::new(out)),
            })),
        }
    }

    /// A copy of the statistics recorded so far
    pub fn snapshot(&self) -> Stats {
        self.inner.lock().expect("poisoned lock").stats.clone()
    }

    /// Writes statistics as JSON. Noop after the first call.
    pub fn dump(&self) {
        let mut guard = self.inner.lock().expect("poisoned lock");
        let json = guard.stats.to_json();
        let out = guard.out.take();
        drop(guard);
        if let Some(out) = out {
            if let Err(e) = serde_json::to_writer(out, &json) {
                tracing::warn!("failed to write stats: {}", e);
            }
        }
    }
}

struct SpanStart(Instant);

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for StatsLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().fields().field("stats").is_none() {
            return;
        }
        let mut guard = self.inner.lock().expect("poisoned lock");
        event.record(&mut StatsVisitor(&mut guard.stats));
    }

    fn new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: Context<'_, S>,
    ) {
        if attrs.metadata().fields().field("timing").is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanStart(Instant::now()));
        }
    }

    fn on_close(&self, id: tracing::span::Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(&id) {
            if let Some(SpanStart(start)) = span.extensions().get() {
                let key = format!("time_{}_ms", span.name().replace(' ', "_"));
                let mut guard = self.inner.lock().expect("poisoned lock");
                guard.stats.record_int(&key, start.elapsed().as_millis() as i128);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn records_stats_events() {
        let layer = StatsLayer::new(std::io::sink());
        let subscriber = tracing_subscriber::Registry::default().with(layer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::trace!(clauses = 3u64, stats = true);
            tracing::trace!(clauses = 5u64, strategy = "direct", stats = true);
            tracing::trace!(ignored = 7u64, "no stats field");
            let span = tracing::trace_span!("encoding phase", timing = true);
            drop(span.enter());
        });
        let stats = layer.snapshot();
        let clauses = stats.counters["clauses"];
        assert_eq!((clauses.first, clauses.last, clauses.sum), (3, 5, 8));
        assert_eq!((clauses.min, clauses.max, clauses.count), (3, 5, 2));
        assert!(!stats.counters.contains_key("ignored"));
        assert_eq!(stats.values["strategy"], serde_json::json!("direct"));
        assert!(stats.counters.contains_key("time_encoding_phase_ms"));
        let json = stats.to_json();
        assert_eq!(json["clauses_sum"], serde_json::json!(8));
    }
}
