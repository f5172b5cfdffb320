//! Throttled stream copying with a global byte budget shared fairly across
//! every copy running through the same allocator.
//!
//! Each active copy owns an allocation handle holding the bytes it may still
//! write in the current cycle. Once per interval the per-interval budget is
//! split evenly across the handles. A copy that has exhausted its share polls
//! the allocator every [`RETRY_DELAY`] until the next cycle refills it.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::TransferError;
use crate::clock::{Clock, system_clock};

/// Size of the copy buffer.
pub const BUFFER_SIZE: usize = 4096;

/// Default length of one allocation cycle.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(25);

/// Rate used by [`BandwidthAllocator::unthrottled`]: 1 MiB/s.
pub const DEFAULT_BANDWIDTH: u64 = 1024 * 1024;

/// Pause between budget checks while a copy waits for its next share.
pub const RETRY_DELAY: Duration = Duration::from_millis(5);

/// Observer of a single copy.
pub trait CopyTracker {
    /// Called after each write with the cumulative number of bytes copied.
    fn bytes_transferred(&self, _total: u64) {}

    /// Checked before every write; returning `true` stops the copy.
    fn is_aborted(&self) -> bool {
        false
    }
}

impl CopyTracker for () {}

/// How a copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The input reached end of stream.
    Completed(u64),
    /// The tracker asked to stop; carries the bytes written before that.
    Aborted(u64),
}

impl CopyOutcome {
    /// Bytes written to the output.
    pub fn bytes(self) -> u64 {
        match self {
            CopyOutcome::Completed(n) | CopyOutcome::Aborted(n) => n,
        }
    }

    pub fn is_aborted(self) -> bool {
        matches!(self, CopyOutcome::Aborted(_))
    }
}

#[derive(Debug, Default)]
struct AllocState {
    handles: HashMap<u64, Arc<AtomicI64>>,
    next_id: u64,
    last_allocation: Option<Duration>,
}

/// Shares a bytes-per-second budget across concurrent copies.
#[derive(Debug)]
pub struct BandwidthAllocator {
    state: Mutex<AllocState>,
    throttling: AtomicBool,
    bandwidth: AtomicU64,
    bytes_per_interval: AtomicI64,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl BandwidthAllocator {
    /// Creates a throttling allocator limited to `bytes_per_second`.
    pub fn new(bytes_per_second: u64) -> Result<Self, TransferError> {
        if bytes_per_second == 0 {
            return Err(TransferError::InvalidBandwidth(bytes_per_second));
        }
        let allocator = Self::unthrottled();
        allocator.set_bandwidth(bytes_per_second);
        allocator.set_throttling(true);
        Ok(allocator)
    }

    /// Creates an allocator that does not pace copies.
    ///
    /// Its rate is preset to [`DEFAULT_BANDWIDTH`] so that enabling
    /// throttling later has a sane budget.
    pub fn unthrottled() -> Self {
        Self {
            state: Mutex::new(AllocState::default()),
            throttling: AtomicBool::new(false),
            bandwidth: AtomicU64::new(DEFAULT_BANDWIDTH),
            bytes_per_interval: AtomicI64::new(per_interval(DEFAULT_BANDWIDTH, DEFAULT_INTERVAL)),
            interval: DEFAULT_INTERVAL,
            clock: system_clock(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Changes the allocation cycle length and recomputes the per-cycle
    /// budget.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        let bandwidth = self.bandwidth.load(Ordering::Acquire);
        self.bytes_per_interval
            .store(per_interval(bandwidth, self.interval), Ordering::Release);
        self
    }

    /// Target rate in bytes per second.
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth.load(Ordering::Acquire)
    }

    /// Sets the target rate. Zero is ignored; use
    /// [`set_throttling`](Self::set_throttling) to turn pacing off.
    pub fn set_bandwidth(&self, bytes_per_second: u64) {
        if bytes_per_second == 0 {
            debug!("ignoring zero bandwidth");
            return;
        }
        self.bandwidth.store(bytes_per_second, Ordering::Release);
        self.bytes_per_interval
            .store(per_interval(bytes_per_second, self.interval), Ordering::Release);
    }

    pub fn is_throttling(&self) -> bool {
        self.throttling.load(Ordering::Acquire)
    }

    pub fn set_throttling(&self, throttling: bool) {
        self.throttling.store(throttling, Ordering::Release);
    }

    /// Number of copies currently registered.
    pub fn active_transfers(&self) -> usize {
        self.lock_state().handles.len()
    }

    /// Copies `input` to `output`, pacing writes when throttling is on.
    ///
    /// The tracker is polled before each write and informed of the running
    /// total after it. I/O errors are returned as-is; the allocation handle
    /// is released on every exit path.
    pub fn copy<R, W>(
        &self,
        tracker: &dyn CopyTracker,
        input: &mut R,
        output: &mut W,
    ) -> io::Result<CopyOutcome>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let handle = self.register();
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut total: u64 = 0;

        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if tracker.is_aborted() {
                debug!(bytes = total, "copy aborted");
                return Ok(CopyOutcome::Aborted(total));
            }

            output.write_all(&buffer[..n])?;
            total += n as u64;
            tracker.bytes_transferred(total);

            if self.is_throttling() {
                handle.remaining.fetch_sub(n as i64, Ordering::AcqRel);
                self.wait_for_budget(&handle);
            }
        }

        output.flush()?;
        debug!(bytes = total, "copy complete");
        Ok(CopyOutcome::Completed(total))
    }

    fn wait_for_budget(&self, handle: &AllocationHandle<'_>) {
        while handle.remaining.load(Ordering::Acquire) <= 0 {
            self.allocate();
            if handle.remaining.load(Ordering::Acquire) > 0 || !self.is_throttling() {
                break;
            }
            self.clock.sleep(RETRY_DELAY);
        }
    }

    /// Runs one allocation cycle if the interval has elapsed.
    fn allocate(&self) {
        let mut state = self.lock_state();
        let now = self.clock.now();
        if let Some(last) = state.last_allocation {
            if now < last + self.interval {
                return;
            }
        }
        if state.handles.is_empty() {
            return;
        }

        let budget = self.bytes_per_interval.load(Ordering::Acquire);
        // Shares are at least one byte.
        let share = (budget / state.handles.len() as i64).max(1);
        for remaining in state.handles.values() {
            remaining.store(share, Ordering::Release);
        }
        state.last_allocation = Some(now);
    }

    fn register(&self) -> AllocationHandle<'_> {
        let remaining = Arc::new(AtomicI64::new(0));
        let mut state = self.lock_state();
        let id = state.next_id;
        state.next_id += 1;
        state.handles.insert(id, Arc::clone(&remaining));
        AllocationHandle {
            allocator: self,
            id,
            remaining,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BandwidthAllocator {
    fn default() -> Self {
        Self::unthrottled()
    }
}

fn per_interval(bytes_per_second: u64, interval: Duration) -> i64 {
    let millis = interval.as_millis().max(1) as u64;
    (bytes_per_second.saturating_mul(millis) / 1000).min(i64::MAX as u64) as i64
}

/// Membership of one copy in the active set.
struct AllocationHandle<'a> {
    allocator: &'a BandwidthAllocator,
    id: u64,
    remaining: Arc<AtomicI64>,
}

impl Drop for AllocationHandle<'_> {
    fn drop(&mut self) {
        self.allocator.lock_state().handles.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        total: AtomicU64,
        abort_after: Option<u64>,
    }

    impl CopyTracker for Recorder {
        fn bytes_transferred(&self, total: u64) {
            self.total.store(total, Ordering::SeqCst);
        }

        fn is_aborted(&self) -> bool {
            match self.abort_after {
                Some(limit) => self.total.load(Ordering::SeqCst) >= limit,
                None => false,
            }
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unthrottled_copy_moves_everything() {
        let allocator = BandwidthAllocator::unthrottled();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let recorder = Recorder::default();

        let outcome = allocator
            .copy(&recorder, &mut data.as_slice(), &mut out)
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Completed(10_000));
        assert_eq!(out, data);
        assert_eq!(recorder.total.load(Ordering::SeqCst), 10_000);
        assert_eq!(allocator.active_transfers(), 0);
    }

    #[test]
    fn empty_input_completes_with_zero() {
        let allocator = BandwidthAllocator::new(1000).unwrap();
        let mut out = Vec::new();
        let outcome = allocator.copy(&(), &mut io::empty(), &mut out).unwrap();
        assert_eq!(outcome, CopyOutcome::Completed(0));
        assert!(out.is_empty());
    }

    #[test]
    fn abort_before_first_write() {
        let allocator = BandwidthAllocator::unthrottled();
        let recorder = Recorder {
            abort_after: Some(0),
            ..Default::default()
        };
        let mut out = Vec::new();

        let outcome = allocator
            .copy(&recorder, &mut io::repeat(1).take(50_000), &mut out)
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Aborted(0));
        assert!(out.is_empty());
    }

    #[test]
    fn abort_midway_keeps_written_prefix() {
        let allocator = BandwidthAllocator::unthrottled();
        let recorder = Recorder {
            abort_after: Some(3 * BUFFER_SIZE as u64),
            ..Default::default()
        };
        let mut out = Vec::new();

        let outcome = allocator
            .copy(&recorder, &mut io::repeat(1).take(100_000), &mut out)
            .unwrap();

        assert!(outcome.is_aborted());
        assert_eq!(outcome.bytes(), 3 * BUFFER_SIZE as u64);
        assert_eq!(out.len(), 3 * BUFFER_SIZE);
    }

    #[test]
    fn handle_released_after_write_error() {
        let allocator = BandwidthAllocator::new(1_000_000).unwrap();
        let err = allocator
            .copy(&(), &mut io::repeat(0).take(10), &mut FailingWriter)
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(allocator.active_transfers(), 0);
    }

    #[test]
    fn zero_bandwidth_rejected_on_construction() {
        assert!(matches!(
            BandwidthAllocator::new(0),
            Err(TransferError::InvalidBandwidth(0))
        ));
    }

    #[test]
    fn set_bandwidth_zero_is_ignored() {
        let allocator = BandwidthAllocator::new(2048).unwrap();
        allocator.set_bandwidth(0);
        assert_eq!(allocator.bandwidth(), 2048);
        assert!(allocator.is_throttling());
    }

    #[test]
    fn unthrottled_defaults() {
        let allocator = BandwidthAllocator::unthrottled();
        assert!(!allocator.is_throttling());
        assert_eq!(allocator.bandwidth(), DEFAULT_BANDWIDTH);
    }

    #[test]
    fn per_interval_budget() {
        assert_eq!(per_interval(4_000_000, DEFAULT_INTERVAL), 100_000);
        assert_eq!(per_interval(1000, Duration::from_millis(100)), 100);
    }

    #[test]
    fn throttled_copy_paces_on_manual_clock() {
        let clock = Arc::new(ManualClock::new());
        let allocator = BandwidthAllocator::new(4_000_000)
            .unwrap()
            .with_clock(clock.clone());

        let len: u64 = 4 * 1024 * 1024;
        let outcome = allocator
            .copy(&(), &mut io::repeat(9).take(len), &mut io::sink())
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Completed(len));
        // 4 MiB at 4 MB/s is roughly one simulated second.
        let elapsed = clock.now();
        assert!(
            elapsed >= Duration::from_millis(950) && elapsed <= Duration::from_millis(1100),
            "elapsed {elapsed:?}"
        );
    }

    #[test]
    fn throttling_can_be_switched_off() {
        let clock = Arc::new(ManualClock::new());
        let allocator = BandwidthAllocator::new(4_000_000)
            .unwrap()
            .with_clock(clock.clone());
        allocator.set_throttling(false);

        allocator
            .copy(&(), &mut io::repeat(9).take(4 * 1024 * 1024), &mut io::sink())
            .unwrap();
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn concurrent_copies_share_bandwidth_fairly() {
        const THREADS: usize = 3;
        const RATE: u64 = 12_000_000;
        let run_for = Duration::from_millis(600);

        struct Deadline {
            total: AtomicU64,
            until: Instant,
        }

        impl CopyTracker for Deadline {
            fn bytes_transferred(&self, total: u64) {
                self.total.store(total, Ordering::SeqCst);
            }

            fn is_aborted(&self) -> bool {
                Instant::now() >= self.until
            }
        }

        let allocator = Arc::new(BandwidthAllocator::new(RATE).unwrap());
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let tracker = Deadline {
                        total: AtomicU64::new(0),
                        until: Instant::now() + run_for,
                    };
                    let outcome = allocator
                        .copy(&tracker, &mut io::repeat(3), &mut io::sink())
                        .unwrap();
                    assert!(outcome.is_aborted());
                    outcome.bytes()
                })
            })
            .collect();

        let per_thread: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let aggregate: u64 = per_thread.iter().sum();
        let expected = RATE as f64 * run_for.as_secs_f64();

        assert!(
            aggregate as f64 >= expected * 0.7 && aggregate as f64 <= expected * 1.2,
            "aggregate {aggregate} vs expected {expected}"
        );

        let mean = aggregate as f64 / THREADS as f64;
        for bytes in &per_thread {
            let deviation = (*bytes as f64 - mean).abs() / mean;
            assert!(deviation <= 0.2, "per-thread {per_thread:?}");
        }
        assert_eq!(allocator.active_transfers(), 0);
    }
}
