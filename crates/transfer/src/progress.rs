use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use echo_ft_protocol::ProgressReport;

use crate::clock::{Clock, system_clock};

/// Minimum number of samples required to compute a transfer rate.
const MIN_SAMPLES: usize = 2;

/// Maximum number of samples kept in the sliding window.
pub const MAX_SAMPLES: usize = 10;

/// Minimum time between two recorded samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Minimum amount of new data before [`ProgressTracker::observe_bytes_read`]
/// bothers evaluating the sampling rule.
pub const SAMPLE_BYTE_INTERVAL: i64 = 10 * 1024;

#[derive(Debug, Clone, Copy)]
struct Sample {
    bytes: i64,
    at: Duration,
}

/// Progress of a single upload: bytes read so far plus throughput and ETA
/// estimated from a sliding window of timestamped samples.
///
/// One thread (the copy loop) writes, any number of threads read. The
/// scalar counters are atomics; only the sample window sits behind a lock.
#[derive(Debug)]
pub struct ProgressTracker {
    content_length: i64,
    bytes_read: AtomicI64,
    /// Bytes recorded by the newest sample, `-1` before the first one.
    last_sample_bytes: AtomicI64,
    samples: Mutex<VecDeque<Sample>>,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    /// Creates a tracker for an upload of `content_length` bytes.
    ///
    /// Pass a negative value when the total size is unknown.
    pub fn new(content_length: i64) -> Self {
        Self::with_clock(content_length, system_clock())
    }

    /// Creates a tracker reading time from `clock`.
    pub fn with_clock(content_length: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            content_length,
            bytes_read: AtomicI64::new(0),
            last_sample_bytes: AtomicI64::new(-1),
            samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES + 1)),
            clock,
        }
    }

    /// Total size in bytes, `-1` if unknown.
    pub fn content_length(&self) -> i64 {
        if self.content_length < 0 {
            -1
        } else {
            self.content_length
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> i64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// Records the cumulative number of bytes read.
    ///
    /// Out-of-order calls are tolerated (last write wins). A sample is added
    /// when the window is empty or at least [`SAMPLE_INTERVAL`] has passed
    /// since the newest sample.
    pub fn set_bytes_read(&self, bytes_read: i64) {
        self.bytes_read.store(bytes_read, Ordering::Release);
        self.record_sample(bytes_read);
    }

    /// Like [`set_bytes_read`](Self::set_bytes_read) but skips the sampling
    /// step until [`SAMPLE_BYTE_INTERVAL`] new bytes have arrived.
    ///
    /// Meant for copy loops that report after every buffer.
    pub fn observe_bytes_read(&self, bytes_read: i64) {
        self.bytes_read.store(bytes_read, Ordering::Release);
        let last = self.last_sample_bytes.load(Ordering::Acquire);
        if last >= 0 && bytes_read - last < SAMPLE_BYTE_INTERVAL {
            return;
        }
        self.record_sample(bytes_read);
    }

    fn record_sample(&self, bytes_read: i64) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let due = match samples.back() {
            None => true,
            Some(last) => now >= last.at + SAMPLE_INTERVAL,
        };
        if !due {
            return;
        }
        samples.push_back(Sample {
            bytes: bytes_read,
            at: now,
        });
        self.last_sample_bytes.store(bytes_read, Ordering::Release);
        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    /// Completion percentage.
    ///
    /// Returns `-1.0` if the total is unknown and `100.0` for an empty
    /// upload. Values are not clamped: a caller over-reporting bytes gets a
    /// figure above 100.
    pub fn percent_completed(&self) -> f64 {
        match self.content_length() {
            -1 => -1.0,
            0 => 100.0,
            total => self.bytes_read() as f64 / total as f64 * 100.0,
        }
    }

    /// Throughput in bytes per second over the sample window, `-1` if not
    /// yet known.
    ///
    /// Two samples sharing a timestamp also yield `-1` instead of dividing
    /// by zero.
    pub fn transfer_rate(&self) -> i64 {
        let (first, last) = {
            let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            if samples.len() < MIN_SAMPLES {
                return -1;
            }
            match (samples.front(), samples.back()) {
                (Some(first), Some(last)) => (*first, *last),
                _ => return -1,
            }
        };

        let elapsed_ms = last.at.saturating_sub(first.at).as_millis() as i64;
        if elapsed_ms == 0 {
            return -1;
        }
        (last.bytes - first.bytes) * 1000 / elapsed_ms
    }

    /// Estimated seconds until completion.
    ///
    /// `0` once everything has been read; `-1` when the total or the rate is
    /// unknown (a stalled upload with rate `0` counts as unknown).
    pub fn estimated_time_left(&self) -> i64 {
        let total = self.content_length();
        if total == -1 {
            return -1;
        }
        let read = self.bytes_read();
        if read == total {
            return 0;
        }
        let rate = self.transfer_rate();
        if rate <= 0 {
            return -1;
        }
        ((total - read) as f64 / rate as f64).round() as i64
    }

    /// Number of samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Point-in-time report of every derived value.
    pub fn snapshot(&self) -> ProgressReport {
        ProgressReport {
            bytes_read: self.bytes_read(),
            content_length: self.content_length(),
            percent_completed: self.percent_completed(),
            transfer_rate: self.transfer_rate(),
            estimated_time_left: self.estimated_time_left(),
        }
    }
}
