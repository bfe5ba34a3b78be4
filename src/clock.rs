//! Clock synchronization between server and client monotonic clocks.
//!
//! Each endpoint estimates `(offset, drift)` such that
//!
//! ```text
//! t_remote ≈ t_local + offset + drift · (t_local − basis)
//! ```
//!
//! from NTP-style round trips: the client stamps `t0` into `client/time`,
//! the server answers with `server/time` carrying `t1` (receive) and `t2`
//! (transmit), and the client stamps `t3` on arrival. The filter is a
//! pure value object; all concurrency is snapshot publish / snapshot
//! read through a [`tokio::sync::watch`] channel, so readers never hold a
//! lock while the filter updates.
//!
//! Sample rejection uses a rolling delay median: congestion spikes show
//! up as delay, and the sample offset error is bounded by the delay.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Delay-gate window: number of recent round trips used for the median.
const OUTLIER_WINDOW: usize = 16;

/// Samples with delay above `median × OUTLIER_FACTOR` are rejected.
const OUTLIER_FACTOR: f64 = 2.0;

/// Offset variance (µs²) below which polling decays from 1 Hz.
const SETTLED_VARIANCE: f64 = 10_000.0 * 10_000.0;

/// Offset variance (µs²) above which the estimate is flagged unhealthy
/// and the player should report `state: error`.
const FATAL_VARIANCE: f64 = 250_000.0 * 250_000.0;

/// Innovation (µs) that snaps polling back to 1 Hz.
const EXCURSION_US: f64 = 5_000.0;

/// Fastest polling interval.
const POLL_MIN: Duration = Duration::from_secs(1);

/// Slowest polling interval (0.1 Hz).
const POLL_MAX: Duration = Duration::from_secs(10);

/// Process noise on the offset state, µs² per second.
const PROCESS_NOISE_OFFSET: f64 = 100.0;

/// Process noise on the drift state, (µs/s)² per second.
const PROCESS_NOISE_DRIFT: f64 = 0.01;

/// A monotonic microsecond clock anchored at its creation.
///
/// The server's instance is the reference clock every wire timestamp is
/// expressed in; clients translate through their [`ClockSnapshot`].
#[derive(Copy, Clone, Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Anchors a new clock at now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds since the anchor.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
}

/// One completed `client/time` / `server/time` round trip, µs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClockSample {
    /// Local clock at transmit.
    pub t0: i64,
    /// Remote clock at receive.
    pub t1: i64,
    /// Remote clock at transmit.
    pub t2: i64,
    /// Local clock at receive.
    pub t3: i64,
}

impl ClockSample {
    /// Round-trip delay: `(t3 − t0) − (t2 − t1)`.
    #[must_use]
    pub fn delay(&self) -> i64 {
        (self.t3 - self.t0) - (self.t2 - self.t1)
    }

    /// Sample offset: `((t1 − t0) + (t2 − t3)) / 2`.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn offset(&self) -> f64 {
        ((self.t1 - self.t0) as f64 + (self.t2 - self.t3) as f64) / 2.0
    }
}

/// An immutable `(offset, drift, basis)` triple, published atomically so
/// readers never mix versions.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ClockSnapshot {
    /// Estimated offset in µs at `basis`.
    pub offset_us: f64,
    /// Estimated drift in µs per second (numerically, ppm).
    pub drift_ppm: f64,
    /// Local clock µs the estimate is anchored to.
    pub basis_us: i64,
    /// Offset variance, µs².
    pub variance: f64,
    /// Accepted sample count.
    pub samples: usize,
    /// `false` once variance exceeds the fatal threshold.
    pub healthy: bool,
}

impl ClockSnapshot {
    /// A snapshot with no information, published before the first sample
    /// and after a reset.
    #[must_use]
    pub fn unsynchronized() -> Self {
        Self {
            offset_us: 0.0,
            drift_ppm: 0.0,
            basis_us: 0,
            variance: f64::INFINITY,
            samples: 0,
            healthy: false,
        }
    }

    /// Converts a local clock reading to the remote clock.
    #[must_use]
    #[expect(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn to_remote(&self, local_us: i64) -> i64 {
        let elapsed_s = (local_us - self.basis_us) as f64 / 1_000_000.0;
        local_us + (self.offset_us + self.drift_ppm * elapsed_s) as i64
    }

    /// Converts a remote clock reading to the local clock.
    #[must_use]
    #[expect(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn to_local(&self, remote_us: i64) -> i64 {
        // Invert around the basis; drift over one round trip is far below
        // a microsecond, so the linear inverse is exact enough.
        let approx_local = remote_us - self.offset_us as i64;
        let elapsed_s = (approx_local - self.basis_us) as f64 / 1_000_000.0;
        remote_us - (self.offset_us + self.drift_ppm * elapsed_s) as i64
    }
}

/// Two-state filter tracking offset and drift of a remote clock.
///
/// Pure computation, no I/O. [`SharedClock`] wires it to a watch channel
/// for concurrent use.
#[derive(Debug)]
pub struct ClockFilter {
    offset: f64,
    drift: f64,
    basis: i64,
    var_offset: f64,
    cov: f64,
    var_drift: f64,
    delays: VecDeque<i64>,
    samples: usize,
    poll_interval: Duration,
}

impl Default for ClockFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockFilter {
    /// Creates an empty filter polling at 1 Hz.
    #[must_use]
    pub fn new() -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            basis: 0,
            var_offset: f64::INFINITY,
            cov: 0.0,
            var_drift: 1.0,
            delays: VecDeque::with_capacity(OUTLIER_WINDOW),
            samples: 0,
            poll_interval: POLL_MIN,
        }
    }

    /// Median of the recent delay window.
    fn delay_median(&self) -> Option<i64> {
        if self.delays.is_empty() {
            return None;
        }
        let mut sorted: Vec<i64> = self.delays.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[sorted.len() / 2])
    }

    fn remember_delay(&mut self, delay: i64) {
        if self.delays.len() == OUTLIER_WINDOW {
            self.delays.pop_front();
        }
        self.delays.push_back(delay);
    }

    /// Feeds one round trip into the filter.
    ///
    /// Returns `true` if the sample was accepted, `false` if the delay
    /// gate rejected it. Either way the delay enters the rolling window,
    /// so a persistent delay shift re-opens the gate.
    #[expect(clippy::cast_precision_loss)]
    pub fn update(&mut self, sample: &ClockSample) -> bool {
        let delay = sample.delay();
        if delay < 0 {
            // Clock stepped mid-flight; useless measurement.
            return false;
        }

        let gate = self
            .delay_median()
            .map(|median| (median as f64).max(1.0) * OUTLIER_FACTOR);
        self.remember_delay(delay);
        if self.samples > 0 {
            if let Some(gate) = gate {
                if delay as f64 > gate {
                    trace!("clock sample rejected: delay {delay}µs above gate {gate:.0}µs");
                    return false;
                }
            }
        }

        let measured = sample.offset();
        // Measurement noise grows with the square of the delay.
        let r = ((delay as f64) / 2.0).powi(2).max(100.0);

        if self.samples == 0 {
            self.offset = measured;
            self.drift = 0.0;
            self.basis = sample.t3;
            self.var_offset = r;
            self.cov = 0.0;
            self.var_drift = 1.0;
            self.samples = 1;
            return true;
        }

        // Predict to the new basis.
        let dt = ((sample.t3 - self.basis) as f64 / 1_000_000.0).max(0.0);
        self.offset += self.drift * dt;
        self.var_offset +=
            2.0 * self.cov * dt + self.var_drift * dt * dt + PROCESS_NOISE_OFFSET * dt;
        self.cov += self.var_drift * dt;
        self.var_drift += PROCESS_NOISE_DRIFT * dt;
        self.basis = sample.t3;

        // Correct.
        let innovation = measured - self.offset;
        let s = self.var_offset + r;
        let k_offset = self.var_offset / s;
        let k_drift = self.cov / s;
        self.offset += k_offset * innovation;
        self.drift += k_drift * innovation;
        let cov_prior = self.cov;
        self.var_offset *= 1.0 - k_offset;
        self.cov *= 1.0 - k_offset;
        self.var_drift -= k_drift * cov_prior;
        self.samples += 1;

        self.adapt_polling(innovation);
        true
    }

    fn adapt_polling(&mut self, innovation: f64) {
        if innovation.abs() > EXCURSION_US {
            self.poll_interval = POLL_MIN;
        } else if self.var_offset < SETTLED_VARIANCE {
            self.poll_interval = (self.poll_interval.mul_f64(1.5)).min(POLL_MAX);
        }
    }

    /// How long to wait before the next `client/time` probe.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Current published view of the estimate.
    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        if self.samples == 0 {
            return ClockSnapshot::unsynchronized();
        }
        ClockSnapshot {
            offset_us: self.offset,
            drift_ppm: self.drift,
            basis_us: self.basis,
            variance: self.var_offset,
            samples: self.samples,
            healthy: self.var_offset < FATAL_VARIANCE,
        }
    }
}

/// A [`ClockFilter`] paired with a watch channel: one writer feeds
/// samples, any number of readers clone snapshots without locking.
#[derive(Debug)]
pub struct SharedClock {
    filter: ClockFilter,
    tx: watch::Sender<ClockSnapshot>,
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedClock {
    /// Creates a clock publishing the unsynchronized snapshot.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClockSnapshot::unsynchronized());
        Self {
            filter: ClockFilter::new(),
            tx,
        }
    }

    /// A reader handle; cheap to clone and never blocks the writer.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClockSnapshot> {
        self.tx.subscribe()
    }

    /// Feeds a round trip and publishes the resulting snapshot.
    pub fn update(&mut self, sample: &ClockSample) -> bool {
        let accepted = self.filter.update(sample);
        if accepted {
            self.tx.send_replace(self.filter.snapshot());
        }
        accepted
    }

    /// Next probe interval per the adaptive policy.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.filter.poll_interval()
    }

    /// Discards all state, for reconnects. Publishes the reset snapshot
    /// so readers stop trusting stale estimates immediately.
    pub fn reset(&mut self) {
        self.filter = ClockFilter::new();
        self.tx.send_replace(ClockSnapshot::unsynchronized());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scenario from the protocol definition: a 300 µs round trip with
    // half a second of offset.
    #[test]
    fn first_sample_exposes_textbook_values() {
        let sample = ClockSample {
            t0: 1_000_000,
            t1: 1_500_200,
            t2: 1_500_400,
            t3: 1_000_500,
        };
        assert_eq!(sample.delay(), 300);
        assert!((sample.offset() - 500_050.0).abs() < f64::EPSILON);

        let mut filter = ClockFilter::new();
        assert!(filter.update(&sample));
        let snapshot = filter.snapshot();
        assert!((snapshot.offset_us - 500_050.0).abs() < 1.0);
        assert_eq!(snapshot.basis_us, 1_000_500);
    }

    /// Deterministic noise in ±bound µs.
    fn noise(seq: u64, bound: i64) -> i64 {
        let hashed = seq.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(31);
        #[expect(clippy::cast_possible_wrap)]
        let signed = (hashed % (2 * bound as u64 + 1)) as i64;
        signed - bound
    }

    #[test]
    #[expect(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn converges_on_constant_offset_and_drift() {
        const TRUE_OFFSET: i64 = 123_456;
        const TRUE_DRIFT_PPM: f64 = 25.0; // 25 µs/s
        let mut filter = ClockFilter::new();

        let mut accepted = 0;
        for i in 0..120 {
            let t0 = i * 1_000_000;
            let elapsed_s = t0 as f64 / 1_000_000.0;
            let remote_of = |local: i64| {
                local + TRUE_OFFSET + (TRUE_DRIFT_PPM * elapsed_s) as i64 + noise(i as u64, 150)
            };
            let one_way = 200 + noise(i as u64 + 1000, 50).abs();
            let sample = ClockSample {
                t0,
                t1: remote_of(t0 + one_way),
                t2: remote_of(t0 + one_way + 50),
                t3: t0 + 2 * one_way + 50,
            };
            if filter.update(&sample) {
                accepted += 1;
            }
        }
        assert!(accepted > 60, "gate rejected too many samples: {accepted}");

        let snapshot = filter.snapshot();
        let elapsed_s = snapshot.basis_us as f64 / 1_000_000.0;
        let true_now = TRUE_OFFSET as f64 + TRUE_DRIFT_PPM * elapsed_s;
        assert!(
            (snapshot.offset_us - true_now).abs() < 100.0,
            "offset error {} µs",
            (snapshot.offset_us - true_now).abs()
        );
        assert!(snapshot.healthy);
    }

    #[test]
    fn delay_spikes_are_rejected() {
        let mut filter = ClockFilter::new();
        for i in 0..OUTLIER_WINDOW as i64 {
            let t0 = i * 1_000_000;
            filter.update(&ClockSample {
                t0,
                t1: t0 + 100_150,
                t2: t0 + 100_250,
                t3: t0 + 300,
            });
        }
        let before = filter.snapshot().offset_us;

        // A congested round trip with 20 ms of queueing on one leg.
        let t0 = 100_000_000;
        let accepted = filter.update(&ClockSample {
            t0,
            t1: t0 + 120_100,
            t2: t0 + 120_200,
            t3: t0 + 20_300,
        });
        assert!(!accepted);
        assert!((filter.snapshot().offset_us - before).abs() < f64::EPSILON);
    }

    #[test]
    fn polling_decays_once_settled_and_resumes_on_excursion() {
        let mut filter = ClockFilter::new();
        for i in 0..60 {
            let t0 = i * 1_000_000;
            filter.update(&ClockSample {
                t0,
                t1: t0 + 50_150,
                t2: t0 + 50_250,
                t3: t0 + 300,
            });
        }
        assert!(filter.poll_interval() > POLL_MIN);
        assert!(filter.poll_interval() <= POLL_MAX);

        // A real step in the remote clock: large innovation with a normal
        // delay, so the gate passes it and polling snaps back.
        let t0 = 60 * 1_000_000;
        filter.update(&ClockSample {
            t0,
            t1: t0 + 80_150,
            t2: t0 + 80_250,
            t3: t0 + 300,
        });
        assert_eq!(filter.poll_interval(), POLL_MIN);
    }

    #[test]
    fn snapshot_conversions_are_consistent() {
        let snapshot = ClockSnapshot {
            offset_us: 500_000.0,
            drift_ppm: 0.0,
            basis_us: 0,
            variance: 1.0,
            samples: 10,
            healthy: true,
        };
        let local = 1_000_000;
        assert_eq!(snapshot.to_remote(local), 1_500_000);
        assert_eq!(snapshot.to_local(snapshot.to_remote(local)), local);
    }

    #[test]
    fn shared_clock_publishes_and_resets() {
        let mut clock = SharedClock::new();
        let rx = clock.subscribe();
        assert!(!rx.borrow().healthy);

        clock.update(&ClockSample {
            t0: 0,
            t1: 200,
            t2: 300,
            t3: 400,
        });
        assert_eq!(rx.borrow().samples, 1);

        clock.reset();
        assert_eq!(rx.borrow().samples, 0);
        assert!(!rx.borrow().healthy);
    }
}
