use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lakeflow_protocol::constants::PROGRESS_SLICE_SIZE;

use crate::store::ByteStream;

/// Snapshot delivered to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Bytes transferred so far across all blocks. Never decreases.
    pub transferred: u64,
    /// Total bytes expected, when known.
    pub total: Option<u64>,
    pub bytes_per_second: f64,
    /// Time left at the current rate, when the total and a rate are known.
    pub eta: Option<Duration>,
}

impl ProgressEvent {
    /// Fraction complete in `[0, 1]`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.transferred as f64 / total as f64),
            None => None,
        }
    }
}

/// Callback invoked with transfer progress.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Aggregates progress from concurrently running blocks into one counter.
///
/// Blocks report their own cumulative byte count through a
/// [`BlockProgress`]; only the delta since that block's previous report is
/// added here. The add and the callback run under one lock, so callers
/// observe a non-decreasing sequence.
pub struct ProgressAccumulator {
    transferred: AtomicU64,
    total: Option<u64>,
    callback: Option<ProgressCallback>,
    guard: Mutex<()>,
    speed: SpeedCalculator,
}

impl ProgressAccumulator {
    pub fn new(total: Option<u64>, callback: Option<ProgressCallback>, window: Duration) -> Self {
        Self {
            transferred: AtomicU64::new(0),
            total,
            callback,
            guard: Mutex::new(()),
            speed: SpeedCalculator::new(window),
        }
    }

    /// Creates a reporter for one block.
    pub fn block(self: &Arc<Self>) -> BlockProgress {
        BlockProgress {
            accumulator: Arc::clone(self),
            reported: 0,
        }
    }

    /// Adds `delta` bytes and notifies the callback.
    pub fn add(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let transferred = self.transferred.fetch_add(delta, Ordering::SeqCst) + delta;
        self.speed.record(delta);
        if let Some(cb) = &self.callback {
            let eta = self
                .total
                .and_then(|total| self.speed.eta(total.saturating_sub(transferred)));
            cb(ProgressEvent {
                transferred,
                total: self.total,
                bytes_per_second: self.speed.bytes_per_second(),
                eta,
            });
        }
    }

    /// Current total without taking the lock.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.speed.bytes_per_second()
    }

    /// Wraps one block's payload so progress is reported as the store pulls it.
    ///
    /// The payload is yielded in slices of at most 64 KiB; slicing a
    /// [`Bytes`] does not copy.
    pub fn reporting_stream(self: &Arc<Self>, data: Bytes) -> ByteStream {
        let reporter = self.block();
        let stream = futures_util::stream::unfold(
            (data, reporter, 0u64),
            |(mut data, mut reporter, mut sent)| async move {
                if data.is_empty() {
                    return None;
                }
                let slice = data.split_to(PROGRESS_SLICE_SIZE.min(data.len()));
                sent += slice.len() as u64;
                reporter.report(sent);
                Some((Ok(slice), (data, reporter, sent)))
            },
        );
        Box::pin(stream)
    }
}

/// Progress reporter owned by one in-flight block.
pub struct BlockProgress {
    accumulator: Arc<ProgressAccumulator>,
    reported: u64,
}

impl BlockProgress {
    /// Reports the block's cumulative bytes; only the increase is forwarded.
    pub fn report(&mut self, block_total: u64) {
        if block_total <= self.reported {
            return;
        }
        let delta = block_total - self.reported;
        self.reported = block_total;
        self.accumulator.add(delta);
    }

    pub fn reported(&self) -> u64 {
        self.reported
    }
}

/// Transfer rate over a sliding time window.
///
/// Samples older than the window are dropped on every insert, so the rate
/// follows the recent throughput rather than the lifetime average.
pub struct SpeedCalculator {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    fn samples(&self) -> MutexGuard<'_, VecDeque<(Instant, u64)>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `bytes` moved just now.
    pub fn record(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.samples();
        samples.push_back((now, bytes));
        while let Some(&(at, _)) = samples.front()
            && now.duration_since(at) > self.window
        {
            samples.pop_front();
        }
    }

    /// Bytes per second across the retained samples; 0 until two samples
    /// some time apart exist.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples();
        let (Some(&(first, _)), Some(&(last, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let elapsed = last.duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        samples.iter().map(|&(_, bytes)| bytes).sum::<u64>() as f64 / elapsed
    }

    /// Estimated time to move `remaining` bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn recording() -> (ProgressCallback, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let cb: ProgressCallback = Arc::new(move |e: ProgressEvent| {
            s.lock().unwrap().push(e.transferred);
        });
        (cb, seen)
    }

    #[test]
    fn block_reports_only_deltas() {
        let (cb, seen) = recording();
        let acc = Arc::new(ProgressAccumulator::new(Some(30), Some(cb), Duration::from_secs(5)));

        let mut a = acc.block();
        let mut b = acc.block();
        a.report(5);
        b.report(3);
        a.report(10);
        // Stale or repeated reports add nothing.
        a.report(7);
        b.report(3);

        assert_eq!(acc.transferred(), 13);
        assert_eq!(*seen.lock().unwrap(), vec![5, 8, 13]);
    }

    #[test]
    fn fraction_handles_unknown_and_empty_totals() {
        let e = ProgressEvent {
            transferred: 5,
            total: Some(10),
            bytes_per_second: 0.0,
            eta: None,
        };
        assert_eq!(e.fraction(), Some(0.5));
        let e = ProgressEvent {
            total: None,
            ..e
        };
        assert_eq!(e.fraction(), None);
        let e = ProgressEvent {
            transferred: 0,
            total: Some(0),
            bytes_per_second: 0.0,
            eta: None,
        };
        assert_eq!(e.fraction(), Some(1.0));
    }

    #[tokio::test]
    async fn reporting_stream_slices_and_reports() {
        let (cb, seen) = recording();
        let acc = Arc::new(ProgressAccumulator::new(None, Some(cb), Duration::from_secs(5)));

        let payload = Bytes::from(vec![9u8; PROGRESS_SLICE_SIZE * 2 + 10]);
        let mut stream = acc.reporting_stream(payload.clone());
        let mut rebuilt = Vec::new();
        while let Some(slice) = stream.next().await {
            let slice = slice.unwrap();
            assert!(slice.len() <= PROGRESS_SLICE_SIZE);
            rebuilt.extend_from_slice(&slice);
        }

        assert_eq!(rebuilt, payload.to_vec());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(*seen.last().unwrap(), payload.len() as u64);
    }

    #[test]
    fn concurrent_blocks_stay_monotonic() {
        use std::thread;

        let (cb, seen) = recording();
        let acc = Arc::new(ProgressAccumulator::new(Some(8000), Some(cb), Duration::from_secs(5)));

        let mut handles = vec![];
        for _ in 0..8 {
            let acc = Arc::clone(&acc);
            handles.push(thread::spawn(move || {
                let mut block = acc.block();
                for i in 1..=100u64 {
                    block.report(i * 10);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 8000);
        assert_eq!(acc.transferred(), 8000);
    }

    #[test]
    fn speed_is_zero_without_two_samples() {
        let calc = SpeedCalculator::new(Duration::from_secs(5));
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
        calc.record(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_and_eta_from_samples() {
        let calc = SpeedCalculator::new(Duration::from_secs(10));
        calc.record(500);
        std::thread::sleep(Duration::from_millis(50));
        calc.record(500);

        assert!(calc.bytes_per_second() > 0.0);
        assert!(calc.eta(10_000).is_some_and(|d| d.as_secs_f64() > 0.0));
    }

    #[test]
    fn events_carry_eta_once_rate_is_known() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let cb: ProgressCallback = Arc::new(move |e: ProgressEvent| sink.lock().unwrap().push(e));
        let acc = ProgressAccumulator::new(Some(1000), Some(cb), Duration::from_secs(10));

        acc.add(100);
        std::thread::sleep(Duration::from_millis(20));
        acc.add(100);

        let events = events.lock().unwrap();
        assert!(events[0].eta.is_none());
        assert!(events[1].eta.is_some_and(|d| d > Duration::ZERO));
    }

    #[test]
    fn old_samples_leave_the_window() {
        let calc = SpeedCalculator::new(Duration::from_millis(20));
        calc.record(1);
        std::thread::sleep(Duration::from_millis(40));
        calc.record(1);
        assert_eq!(calc.samples().len(), 1);
    }
}
