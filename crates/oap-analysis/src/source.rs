// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns decoded spans into indicator updates.
//!
//! A server-side (entry) span updates the global, service, service instance
//! and endpoint scopes of the service that received the call. Both entry and
//! exit spans update the caller → callee relation scopes, keyed by the side
//! that observed the call. An exit span's own service is the caller, so its
//! relation ids read `{self}-{peer}` where an entry span's read `{peer}-{self}`.

use crate::errors::{ConfigError, TimeBucketError};
use crate::indicator::{Function, Indicator};
use crate::processor::{IndicatorProcessor, IndicatorProcessorBuilder};
use crate::time_bucket::minute_bucket;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Histogram bucket width for latency percentiles, in milliseconds.
pub const LATENCY_PRECISION_MS: i32 = 10;

/// Stands in for every side of a call that has no known peer, such as an
/// entry span without a parent reference.
pub const USER: &str = "User";

/// Entity id of the global scope.
pub const ALL_ENTITY: &str = "all";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectPoint {
    /// Observed by the callee, from an entry span.
    #[default]
    Server,
    /// Observed by the caller, from an exit span.
    Client,
}

impl DetectPoint {
    fn label(self) -> &'static str {
        match self {
            DetectPoint::Server => "server",
            DetectPoint::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    Service,
    ServiceInstance,
    Endpoint,
    ServiceRelation(DetectPoint),
    ServiceInstanceRelation(DetectPoint),
    EndpointRelation(DetectPoint),
}

impl Scope {
    const SERVER: [Scope; 7] = [
        Scope::All,
        Scope::Service,
        Scope::ServiceInstance,
        Scope::Endpoint,
        Scope::ServiceRelation(DetectPoint::Server),
        Scope::ServiceInstanceRelation(DetectPoint::Server),
        Scope::EndpointRelation(DetectPoint::Server),
    ];

    // The callee's own scopes are counted by its entry span.
    const CLIENT: [Scope; 3] = [
        Scope::ServiceRelation(DetectPoint::Client),
        Scope::ServiceInstanceRelation(DetectPoint::Client),
        Scope::EndpointRelation(DetectPoint::Client),
    ];

    fn observed_at(detect_point: DetectPoint) -> &'static [Scope] {
        match detect_point {
            DetectPoint::Server => &Self::SERVER,
            DetectPoint::Client => &Self::CLIENT,
        }
    }

    fn prefix(self) -> String {
        match self {
            Scope::All => "all".to_string(),
            Scope::Service => "service".to_string(),
            Scope::ServiceInstance => "service_instance".to_string(),
            Scope::Endpoint => "endpoint".to_string(),
            Scope::ServiceRelation(dp) => format!("service_relation_{}", dp.label()),
            Scope::ServiceInstanceRelation(dp) => {
                format!("service_instance_relation_{}", dp.label())
            }
            Scope::EndpointRelation(dp) => format!("endpoint_relation_{}", dp.label()),
        }
    }

    fn metrics(self) -> &'static [Metric] {
        match self {
            Scope::All | Scope::Service | Scope::ServiceInstance | Scope::Endpoint => {
                &Metric::ENTITY
            }
            _ => &Metric::RELATION,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Metric {
    Calls,
    Sla,
    RespTime,
    Percentile(u8),
}

impl Metric {
    const ENTITY: [Metric; 5] = [
        Metric::Calls,
        Metric::Sla,
        Metric::RespTime,
        Metric::Percentile(50),
        Metric::Percentile(99),
    ];

    const RELATION: [Metric; 3] = [Metric::Calls, Metric::Sla, Metric::RespTime];

    fn kind(self, scope: Scope) -> String {
        let prefix = scope.prefix();
        match self {
            Metric::Calls => format!("{prefix}_cpm"),
            Metric::Sla => format!("{prefix}_sla"),
            Metric::RespTime => format!("{prefix}_resp_time"),
            Metric::Percentile(rank) => format!("{prefix}_p{rank}"),
        }
    }

    fn function(self) -> Function {
        match self {
            Metric::Calls => Function::Count,
            Metric::Sla => Function::Percent,
            Metric::RespTime => Function::LongAvg,
            Metric::Percentile(_) => Function::Percentile,
        }
    }

    fn observe(self, entity_id: &str, time_bucket: i64, span: &SpanSummary) -> Indicator {
        match self {
            Metric::Calls => Indicator::count(entity_id, time_bucket, 1),
            Metric::Sla => Indicator::percent(entity_id, time_bucket, !span.is_error),
            Metric::RespTime => Indicator::long_avg(entity_id, time_bucket, span.latency_ms()),
            Metric::Percentile(rank) => Indicator::percentile(
                entity_id,
                time_bucket,
                span.latency_ms(),
                LATENCY_PRECISION_MS,
                rank,
            ),
        }
    }
}

/// One side of a call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallSide {
    pub service: String,
    pub instance: String,
    pub endpoint: String,
}

impl CallSide {
    pub fn new(service: &str, instance: &str, endpoint: &str) -> Self {
        Self {
            service: service.to_string(),
            instance: instance.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    fn user() -> Self {
        Self::new(USER, USER, USER)
    }
}

/// The parts of an entry or exit span the analysis consumes.
///
/// `service`, `instance` and `endpoint` describe the instance that reported
/// the span; for an exit span `endpoint` is the entry endpoint of the same
/// segment. `peer` is the other side of the call: the caller for an entry
/// span, the callee for an exit span.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpanSummary {
    pub service: String,
    pub instance: String,
    pub endpoint: String,
    #[serde(default)]
    pub peer: Option<CallSide>,
    #[serde(default)]
    pub detect_point: DetectPoint,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default)]
    pub is_error: bool,
}

impl SpanSummary {
    pub fn latency_ms(&self) -> i64 {
        (self.end_ms - self.start_ms).max(0)
    }

    fn local(&self) -> CallSide {
        CallSide::new(&self.service, &self.instance, &self.endpoint)
    }

    /// `(caller, callee)` of the call this span observed.
    fn call(&self) -> (CallSide, CallSide) {
        let peer = self.peer.clone().unwrap_or_else(CallSide::user);
        match self.detect_point {
            DetectPoint::Server => (peer, self.local()),
            DetectPoint::Client => (self.local(), peer),
        }
    }

    fn entity_id(&self, scope: Scope) -> String {
        match scope {
            Scope::All => ALL_ENTITY.to_string(),
            Scope::Service => self.service.clone(),
            Scope::ServiceInstance => format!("{}/{}", self.service, self.instance),
            Scope::Endpoint => format!("{}/{}", self.service, self.endpoint),
            Scope::ServiceRelation(_) => {
                let (source, dest) = self.call();
                format!("{}-{}", source.service, dest.service)
            }
            Scope::ServiceInstanceRelation(_) => {
                let (source, dest) = self.call();
                format!(
                    "{}/{}-{}/{}",
                    source.service, source.instance, dest.service, dest.instance
                )
            }
            Scope::EndpointRelation(_) => {
                let (source, dest) = self.call();
                format!(
                    "{}/{}-{}/{}",
                    source.service, source.endpoint, dest.service, dest.endpoint
                )
            }
        }
    }
}

/// Sends spans to a running [`SpanService`].
#[derive(Clone)]
pub struct SpanHandle {
    tx: mpsc::UnboundedSender<SpanSummary>,
}

impl SpanHandle {
    pub fn send(&self, span: SpanSummary) -> Result<(), mpsc::error::SendError<SpanSummary>> {
        self.tx.send(span)
    }
}

/// Owns a [`SourceDispatcher`] and feeds it every span sent through its
/// handles.
pub struct SpanService {
    dispatcher: SourceDispatcher,
    rx: mpsc::UnboundedReceiver<SpanSummary>,
}

impl SpanService {
    /// Dispatches until every handle is dropped. Cancellation closes the
    /// channel; spans already queued are still dispatched.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        debug!("Span service started");
        let mut closed = false;
        let mut dispatched = 0usize;
        loop {
            let span = tokio::select! {
                span = self.rx.recv() => span,
                () = cancel_token.cancelled(), if !closed => {
                    self.rx.close();
                    closed = true;
                    continue;
                }
            };
            let Some(span) = span else {
                break;
            };
            match self.dispatcher.dispatch(&span) {
                Ok(updates) => dispatched += updates,
                Err(e) => warn!("Dropping span of {}: {}", span.service, e),
            }
        }
        debug!("Span service stopped after {} updates", dispatched);
    }
}

pub struct SourceDispatcher {
    processor: Arc<IndicatorProcessor>,
}

impl SourceDispatcher {
    /// Every indicator kind `dispatch` produces, with its function.
    pub fn indicator_kinds() -> Vec<(String, Function)> {
        Scope::SERVER
            .into_iter()
            .chain(Scope::CLIENT)
            .flat_map(|scope| {
                scope
                    .metrics()
                    .iter()
                    .map(move |metric| (metric.kind(scope), metric.function()))
            })
            .collect()
    }

    /// Registers every kind of [`Self::indicator_kinds`] on `builder`.
    #[must_use]
    pub fn register(mut builder: IndicatorProcessorBuilder) -> IndicatorProcessorBuilder {
        for (kind, function) in Self::indicator_kinds() {
            builder = builder.indicator(&kind, function);
        }
        builder
    }

    /// Fails when `processor` is missing one of the kinds this dispatcher emits.
    pub fn new(processor: Arc<IndicatorProcessor>) -> Result<Self, ConfigError> {
        if let Some((kind, _)) = Self::indicator_kinds()
            .into_iter()
            .find(|(kind, _)| processor.chain(kind).is_none())
        {
            return Err(ConfigError::UnknownIndicator(kind));
        }
        Ok(Self { processor })
    }

    /// Moves the dispatcher behind a channel.
    pub fn into_service(self) -> (SpanService, SpanHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SpanService {
                dispatcher: self,
                rx,
            },
            SpanHandle { tx },
        )
    }

    /// Emits one update per scope and metric observed at the span's detect
    /// point, at the span's start minute. Returns the number of updates
    /// submitted.
    pub fn dispatch(&self, span: &SpanSummary) -> Result<usize, TimeBucketError> {
        let time_bucket = minute_bucket(span.start_ms)?;
        let mut submitted = 0;
        for &scope in Scope::observed_at(span.detect_point) {
            let entity_id = span.entity_id(scope);
            for metric in scope.metrics() {
                let indicator = metric.observe(&entity_id, time_bucket, span);
                match self.processor.submit(&metric.kind(scope), indicator) {
                    Ok(()) => submitted += 1,
                    Err(e) => warn!("Dropping span update: {}", e),
                }
            }
        }
        Ok(submitted)
    }
}
