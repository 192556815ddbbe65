//! ==============================================================================
//! sampler.rs - timer-driven sensor polling
//! ==============================================================================
//!
//! purpose:
//!     owns the polling cadence and is the only writer of the current sample.
//!     each tick reads the sensor source on the blocking pool (sysfs reads can
//!     stall) under a timeout, then publishes to the feed.
//!
//! failure handling:
//!     a failed or timed-out read is logged and skipped. the previous sample
//!     stays current (stale but present) and the next tick simply tries again.
//!     a read that outlives its timeout is kept and awaited again on the next
//!     tick, so a wedged chip holds one blocking thread, never one per tick.
//!     nothing here can end the loop.
//!
//! relationships:
//!     - uses: sensor.rs (SensorSource)
//!     - writes: feed.rs (SampleFeed::publish)
//!     - knows nothing about sessions or http
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::{Sample, SensorRead};
use crate::error::SensorError;
use crate::feed::SampleFeed;
use crate::sensor::SensorSource;

pub struct Sampler {
    source: Arc<dyn SensorSource>,
    feed: SampleFeed,
    interval: Duration,
    read_timeout: Duration,
    show_data: bool,
    failing_since: Option<u64>,
    ticks: u64,
    in_flight: Option<JoinHandle<Result<SensorRead, SensorError>>>,
}

impl Sampler {
    pub fn new(source: Arc<dyn SensorSource>, feed: SampleFeed, interval: Duration, read_timeout: Duration) -> Self {
        Self {
            source,
            feed,
            interval,
            read_timeout,
            show_data: false,
            failing_since: None,
            ticks: 0,
            in_flight: None,
        }
    }

    /// log every published sample at info level
    pub fn show_data(mut self, on: bool) -> Self {
        self.show_data = on;
        self
    }

    /// read the source once with the configured bound
    ///
    /// at most one read is outstanding: if the last one timed out it is
    /// awaited again instead of starting another
    async fn read_source(&mut self) -> Result<SensorRead, SensorError> {
        let mut read = match self.in_flight.take() {
            Some(pending) => pending,
            None => {
                let source = self.source.clone();
                tokio::task::spawn_blocking(move || source.read())
            }
        };

        match tokio::time::timeout(self.read_timeout, &mut read).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SensorError::Unavailable(format!("read task failed: {e}"))),
            Err(_) => {
                self.in_flight = Some(read);
                Err(SensorError::Timeout(self.read_timeout))
            }
        }
    }

    /// one poll: read, and publish on success
    pub async fn tick(&mut self) -> Result<Arc<Sample>, SensorError> {
        self.ticks += 1;
        match self.read_source().await {
            Ok(read) => {
                for err in &read.errors {
                    tracing::debug!(source = self.source.name(), "{err}");
                }
                let sample = self.feed.publish(read, Utc::now());

                if let Some(since) = self.failing_since.take() {
                    tracing::info!(
                        source = self.source.name(),
                        failed_ticks = self.ticks - since,
                        "sensor source recovered"
                    );
                }
                if self.show_data {
                    for (name, r) in &sample.readings {
                        tracing::info!(seq = sample.seq, "{name}: {:.1} {}", r.value, r.unit);
                    }
                }
                Ok(sample)
            }
            Err(e) => {
                if self.failing_since.is_none() {
                    self.failing_since = Some(self.ticks);
                }
                tracing::warn!(source = self.source.name(), error = %e, "sensor read failed, keeping last sample");
                Err(e)
            }
        }
    }

    /// poll forever. the first tick fires immediately.
    pub async fn run(mut self) {
        tracing::info!(
            source = self.source.name(),
            interval_ms = self.interval.as_millis() as u64,
            "starting sensor polling"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // errors are already logged and never stop the loop
            let _ = self.tick().await;
        }
    }
}
