//! ==============================================================================
//! dispatcher.rs - live feed for the admitted session
//! ==============================================================================
//!
//! purpose:
//!     turns the shared sample slot into an ordered feed for one session.
//!     next_sample() is the only place a client handler waits. it wakes on:
//!     - a sample newer than the last one delivered -> Delivery::Sample
//!     - the gate ending the session               -> Err(Termination)
//!     - nothing new for `keepalive`               -> Delivery::Idle
//!
//!     every call counts as activity for the gate. a client whose transport
//!     stops draining stops calling, and the reaper takes it out.
//!
//! ordering:
//!     samples carry a strictly increasing seq; anything at or below the last
//!     delivered seq is never handed out again. between calls only the newest
//!     sample survives, so a slow client skips samples instead of queueing them.
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::Sample;
use crate::error::Termination;
use crate::feed::SampleSlot;
use crate::session::{SessionHandle, SessionId};

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Sample(Arc<Sample>),
    /// keepalive elapsed without a new sample
    Idle,
}

pub struct Dispatcher {
    session: SessionHandle,
    samples: SampleSlot,
    keepalive: Duration,
    min_gap: Duration,
    last_seq: Option<u64>,
    last_sent_at: Option<Instant>,
}

impl Dispatcher {
    pub fn new(session: SessionHandle, samples: SampleSlot, keepalive: Duration) -> Self {
        Self {
            session,
            samples,
            keepalive,
            min_gap: Duration::ZERO,
            last_seq: None,
            last_sent_at: None,
        }
    }

    /// deliver at most one sample per `gap` (latest wins)
    pub fn with_min_gap(mut self, gap: Duration) -> Self {
        self.min_gap = gap;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub async fn next_sample(&mut self) -> Result<Delivery, Termination> {
        self.session.touch()?;
        let idle_at = Instant::now() + self.keepalive;

        // client asked for a slower rate than the sampler produces
        if let Some(sent) = self.last_sent_at {
            let ready_at = sent + self.min_gap;
            if ready_at > Instant::now() {
                tokio::select! {
                    biased;
                    reason = self.session.terminated() => return Err(reason),
                    _ = tokio::time::sleep_until(ready_at.min(idle_at)) => {}
                }
                if ready_at > idle_at {
                    return Ok(Delivery::Idle);
                }
            }
        }

        loop {
            if let Some(reason) = self.session.termination() {
                return Err(reason);
            }

            let current = self.samples.borrow_and_update().clone();
            if let Some(sample) = current {
                if Some(sample.seq) > self.last_seq {
                    self.last_seq = Some(sample.seq);
                    self.last_sent_at = Some(Instant::now());
                    return Ok(Delivery::Sample(sample));
                }
            }

            tokio::select! {
                biased;
                reason = self.session.terminated() => return Err(reason),
                changed = self.samples.changed() => {
                    if changed.is_err() {
                        // sampler is gone, nothing more will ever arrive
                        return Err(Termination::Disconnected);
                    }
                }
                _ = tokio::time::sleep_until(idle_at) => return Ok(Delivery::Idle),
            }
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Reading, SensorRead};
    use crate::feed::SampleFeed;
    use crate::session::{AdmissionPolicy, SessionGate};
    use chrono::Utc;

    fn read(fan: f64, temp: f64) -> SensorRead {
        let mut r = SensorRead::default();
        r.readings.insert("fan".into(), Reading::new(fan, "rpm", "fan"));
        r.readings.insert("temp".into(), Reading::new(temp, "C", "temp"));
        r
    }

    fn setup() -> (SampleFeed, SessionGate) {
        (SampleFeed::new(8), SessionGate::new(AdmissionPolicy::Preempt, Duration::from_secs(5)))
    }

    fn dispatcher(feed: &SampleFeed, gate: &SessionGate) -> Dispatcher {
        Dispatcher::new(gate.admit(None).unwrap(), feed.subscribe(), Duration::from_secs(2))
    }

    fn expect_sample(d: Result<Delivery, Termination>) -> Arc<Sample> {
        match d {
            Ok(Delivery::Sample(s)) => s,
            other => panic!("expected a sample, got {other:?}"),
        }
    }

    struct FixedSource;

    impl crate::sensor::SensorSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        fn read(&self) -> Result<SensorRead, crate::error::SensorError> {
            Ok(read(1200.0, 55.0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_to_session_timeline() {
        let (feed, gate) = setup();
        let sampler = crate::sampler::Sampler::new(
            Arc::new(FixedSource),
            feed.clone(),
            Duration::from_secs(1),
            Duration::from_millis(500),
        );
        let t0 = Instant::now();
        tokio::spawn(sampler.run());

        // session A shows up at t=0.2s and gets the t=0 sample straight away
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut a = dispatcher(&feed, &gate);
        let first = expect_sample(a.next_sample().await);
        assert_eq!(first.value("fan"), Some(1200.0));
        assert_eq!(first.seq, 1);
        assert!(t0.elapsed() < Duration::from_millis(300));

        // then the t=1s sample
        let second = expect_sample(a.next_sample().await);
        assert_eq!(second.seq, 2);
        let at = t0.elapsed();
        assert!(at >= Duration::from_millis(950) && at <= Duration::from_millis(1050), "at {at:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_sample_delivered_on_connect() {
        let (feed, gate) = setup();
        feed.publish(read(1200.0, 55.0), Utc::now());

        let mut d = dispatcher(&feed, &gate);
        let s = expect_sample(d.next_sample().await);
        assert_eq!(s.value("fan"), Some(1200.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_next_publish() {
        let (feed, gate) = setup();
        feed.publish(read(1200.0, 55.0), Utc::now());
        let mut d = dispatcher(&feed, &gate);
        let first = expect_sample(d.next_sample().await);

        let publisher = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            publisher.publish(read(1250.0, 56.0), Utc::now());
        });

        let started = Instant::now();
        let second = expect_sample(d.next_sample().await);
        assert!(second.seq > first.seq);
        assert_eq!(second.value("fan"), Some(1250.0));
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_repeat_without_new_sample() {
        let (feed, gate) = setup();
        feed.publish(read(1200.0, 55.0), Utc::now());
        let mut d = dispatcher(&feed, &gate);
        expect_sample(d.next_sample().await);

        // nothing newer -> keepalive instead of the same sample again
        assert_eq!(d.next_sample().await, Ok(Delivery::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_client_gets_latest_only() {
        let (feed, gate) = setup();
        let mut d = dispatcher(&feed, &gate);
        feed.publish(read(1.0, 1.0), Utc::now());
        feed.publish(read(2.0, 2.0), Utc::now());
        feed.publish(read(3.0, 3.0), Utc::now());

        let s = expect_sample(d.next_sample().await);
        assert_eq!(s.value("fan"), Some(3.0));
        assert_eq!(d.next_sample().await, Ok(Delivery::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_seq_strictly_increasing() {
        let (feed, gate) = setup();
        let mut d = dispatcher(&feed, &gate);

        let publisher = feed.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                publisher.publish(read(i as f64, 40.0), Utc::now());
                tokio::time::sleep(Duration::from_millis(if i % 3 == 0 { 10 } else { 400 })).await;
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 8 {
            if let Delivery::Sample(s) = d.next_sample().await.unwrap() {
                seen.push((s.seq, s.timestamp));
            }
        }
        assert!(seen.windows(2).all(|w| w[1].0 > w[0].0 && w[1].1 >= w[0].1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preemption_wakes_pending_wait() {
        let (feed, gate) = setup();
        let mut a = dispatcher(&feed, &gate);

        let waiter = tokio::spawn(async move { a.next_sample().await });
        tokio::task::yield_now().await;

        let b = gate.admit(None).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(10), waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(Termination::Preempted));
        assert_eq!(gate.current(), Some(b.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_pending_wait() {
        let (feed, gate) = setup();
        let mut a = dispatcher(&feed, &gate);
        let id = a.session_id();

        let waiter = tokio::spawn(async move { a.next_sample().await });
        tokio::task::yield_now().await;
        gate.stop(Some(id));

        assert_eq!(waiter.await.unwrap(), Err(Termination::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_is_cancelled() {
        let (feed, gate) = setup();
        let mut a = dispatcher(&feed, &gate);
        tokio::time::advance(Duration::from_secs(6)).await;
        gate.reap_stale();
        assert_eq!(a.next_sample().await, Err(Termination::Stale));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_sensor_gap() {
        // tick N failed (nothing published), tick N+1 succeeds
        let (feed, gate) = setup();
        feed.publish(read(1200.0, 55.0), Utc::now());
        let mut d = dispatcher(&feed, &gate);
        expect_sample(d.next_sample().await);
        assert_eq!(d.next_sample().await, Ok(Delivery::Idle));

        feed.publish(read(1300.0, 57.0), Utc::now());
        let s = expect_sample(d.next_sample().await);
        assert_eq!(s.value("temp"), Some(57.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_gap_throttles_and_coalesces() {
        let (feed, gate) = setup();
        let mut d = dispatcher(&feed, &gate).with_min_gap(Duration::from_secs(3));
        feed.publish(read(1.0, 1.0), Utc::now());
        expect_sample(d.next_sample().await);

        let publisher = feed.clone();
        tokio::spawn(async move {
            for i in 2..5 {
                tokio::time::sleep(Duration::from_millis(500)).await;
                publisher.publish(read(i as f64, 1.0), Utc::now());
            }
        });

        // the 2s keepalive comes first, then the coalesced sample at the 3s gap
        let started = Instant::now();
        let s = loop {
            match d.next_sample().await {
                Ok(Delivery::Idle) => continue,
                other => break expect_sample(other),
            }
        };
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(s.value("fan"), Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_min_gap_still_keeps_session_alive() {
        let (feed, gate) = setup();
        let mut d = dispatcher(&feed, &gate).with_min_gap(Duration::from_secs(30));
        feed.publish(read(1.0, 1.0), Utc::now());
        expect_sample(d.next_sample().await);
        feed.publish(read(2.0, 1.0), Utc::now());

        // throttled, but each call still comes back at the keepalive and touches the gate
        // 2s keepalive against a 30s gap: idle at t=2,4..28, sample at t=30
        for _ in 0..14 {
            assert_eq!(d.next_sample().await, Ok(Delivery::Idle));
            assert_eq!(gate.reap_stale(), None);
        }
        let started = Instant::now();
        let s = expect_sample(d.next_sample().await);
        assert_eq!(s.value("fan"), Some(2.0));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }
}
