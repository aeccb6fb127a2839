// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Background aggregation of per-request response times, logged on a
//! fixed interval. Delivery from the `Forwarder` is non-blocking: a full
//! channel drops the incoming event rather than pushing back on the
//! request path.

use crate::forwarder::Transport;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How often the aggregate line is logged.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);
/// Bound on the event channel; beyond this, the oldest queued event is
/// dropped to make room rather than blocking the forwarder.
const CHANNEL_CAPACITY: usize = 1024;

/// One completed request, as reported by the `Forwarder`.
#[derive(Debug, Clone, Copy)]
pub struct StatsEvent {
    pub transport: Transport,
    pub response_time: Duration,
}

/// Per-transport counters. `count` is cumulative for the process lifetime;
/// `interval_count`/`interval_total` accumulate since the last report and
/// are reset by `reset_interval`, mirroring `stats.py`'s `count` vs.
/// `interval_count`/`interval_response_time`.
#[derive(Default)]
struct Bucket {
    count: u64,
    interval_count: u64,
    interval_total: Duration,
}

impl Bucket {
    fn record(&mut self, d: Duration) {
        self.count += 1;
        self.interval_count += 1;
        self.interval_total += d;
    }

    fn interval_average(&self) -> Duration {
        if self.interval_count == 0 {
            Duration::ZERO
        } else {
            self.interval_total / self.interval_count as u32
        }
    }

    fn reset_interval(&mut self) {
        self.interval_count = 0;
        self.interval_total = Duration::ZERO;
    }
}

/// Handle to the background stats task. Cloning the sender side is cheap;
/// `StatsSink` itself is what the `Forwarder` holds a reference to.
pub struct StatsSink {
    tx: mpsc::Sender<StatsEvent>,
    task: JoinHandle<()>,
}

impl StatsSink {
    /// Spawn the background aggregator. Call `shutdown` to stop it.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(Self::run(rx));
        Self { tx, task }
    }

    /// Record one completed request. Never blocks: if the channel is full
    /// (a stalled or overwhelmed consumer), this event is dropped and a
    /// debug line is logged, matching the "never back-pressure the
    /// forwarder" requirement.
    pub fn record(&self, event: StatsEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            log::debug!("stats channel full, dropping event");
        }
    }

    /// Stop the background task. Already-queued events are still
    /// processed before it exits.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }

    async fn run(mut rx: mpsc::Receiver<StatsEvent>) {
        let mut buckets: HashMap<&'static str, Bucket> = HashMap::new();
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        // The first tick fires immediately; skip it so the first report
        // reflects a full interval of activity.
        interval.tick().await;
        let mut last_report = Instant::now();

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            buckets
                                .entry(event.transport.as_str())
                                .or_default()
                                .record(event.response_time);
                        }
                        None => {
                            Self::report(&mut buckets, last_report.elapsed());
                            return;
                        }
                    }
                }
                _ = interval.tick() => {
                    Self::report(&mut buckets, last_report.elapsed());
                    last_report = Instant::now();
                }
            }
        }
    }

    /// Log one aggregate line plus one per-transport line, then reset the
    /// interval fields — cumulative `count` survives across reports.
    /// `elapsed` is the actual wall-clock time since the previous report,
    /// used as the QPS denominator (`stats.py`'s `interval_elapsed`).
    ///
    /// The aggregate average is the average *of the per-transport interval
    /// averages*, not a single average over every request — this
    /// reproduces the original implementation's weighting quirk
    /// (`stats.py` sums two already-divided quantities), so a transport
    /// with far fewer requests still counts equally toward the headline
    /// number. Per-transport lines report a correctly count-weighted
    /// average for that transport.
    fn report(buckets: &mut HashMap<&'static str, Bucket>, elapsed: Duration) {
        if buckets.is_empty() || buckets.values().all(|b| b.interval_count == 0) {
            log::info!("stats: no requests in the last interval");
            return;
        }

        let elapsed_secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let total_count: u64 = buckets.values().map(|b| b.count).sum();
        let total_interval_count: u64 = buckets.values().map(|b| b.interval_count).sum();
        let qps = total_interval_count as f64 / elapsed_secs;

        let per_transport_averages: Vec<Duration> =
            buckets.values().map(Bucket::interval_average).collect();
        let overall_avg =
            per_transport_averages.iter().sum::<Duration>() / per_transport_averages.len() as u32;

        let breakdown: Vec<String> = buckets
            .iter()
            .map(|(transport, b)| {
                let transport_qps = b.interval_count as f64 / elapsed_secs;
                format!(
                    "{}: {} total, {:.2} qps, avg {:?}",
                    transport,
                    b.count,
                    transport_qps,
                    b.interval_average()
                )
            })
            .collect();

        log::info!(
            "stats: {} total requests, {:.2} qps, overall avg {:?} ({})",
            total_count,
            qps,
            overall_avg,
            breakdown.join(", ")
        );

        for bucket in buckets.values_mut() {
            bucket.reset_interval();
        }
    }
}
