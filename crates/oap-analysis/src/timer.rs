// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic forced persistence, so low-traffic windows still reach storage.

use crate::processor::IndicatorProcessor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct PersistenceTimer {
    processor: Arc<IndicatorProcessor>,
    period: Duration,
}

impl PersistenceTimer {
    pub fn new(processor: Arc<IndicatorProcessor>, period: Duration) -> Self {
        Self { processor, period }
    }

    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel_token))
    }

    /// Flushes every `period` until cancelled, then flushes once more.
    pub async fn run(self, cancel_token: CancellationToken) {
        let mut persist_interval = interval(self.period);
        persist_interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = persist_interval.tick() => {
                    debug!("Running periodic persistence");
                    self.flush().await;
                }
                () = cancel_token.cancelled() => {
                    info!("Persistence timer cancelled, running final flush");
                    self.flush().await;
                    break;
                }
            }
        }
    }

    async fn flush(&self) {
        let processor = Arc::clone(&self.processor);
        match tokio::task::spawn_blocking(move || processor.flush_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Persistence pass failed: {}", e),
            Err(e) => error!("Persistence task did not complete: {}", e),
        }
    }
}
