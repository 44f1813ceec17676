//! Throttled progress reporting.
//!
//! A [`Progress`] holds running [`Stat`] counters for one operation. The
//! primary walk adds to them with [`Progress::report`]; a ticker thread calls
//! the sink at a fixed interval so long operations give live feedback without
//! the walk polling a clock itself.

use crate::tree::Stat;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::trace;

/// Receives progress callbacks. Both methods default to doing nothing.
pub trait ProgressSink: Send + Sync {
    /// Latest counters. `ticker` is true for timer-driven calls and false for
    /// calls triggered by [`Progress::report`] or [`Progress::force`].
    fn update(&self, _stat: &Stat, _elapsed: Duration, _ticker: bool) {}

    /// Final counters, called exactly once by [`Progress::done`].
    fn done(&self, _stat: &Stat, _elapsed: Duration) {}
}

/// A sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

struct State {
    current: Stat,
    started: Instant,
    last_update: Instant,
    finished: bool,
}

impl State {
    fn fresh() -> Self {
        let now = Instant::now();
        Self {
            current: Stat::default(),
            started: now,
            last_update: now,
            finished: false,
        }
    }
}

struct Shared {
    sink: Arc<dyn ProgressSink>,
    interval: Duration,
    state: Mutex<State>,
}

impl Shared {
    fn tick(&self) -> bool {
        let (stat, elapsed) = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            state.last_update = Instant::now();
            (state.current, state.started.elapsed())
        };
        self.sink.update(&stat, elapsed, true);
        true
    }
}

struct Ticker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Running counters plus a periodic callback.
pub struct Progress {
    shared: Arc<Shared>,
    ticker: Mutex<Option<Ticker>>,
}

impl Progress {
    /// Create a reporter calling `sink` at most once per `interval` from
    /// [`report`](Self::report), and every `interval` from the ticker once
    /// [`start`](Self::start)ed.
    pub fn new(interval: Duration, sink: impl ProgressSink + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink: Arc::new(sink),
                interval,
                state: Mutex::new(State::fresh()),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// A reporter that reports nowhere.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, NoProgress)
    }

    /// Begin an operation: reset the counters and the clock, then start the
    /// ticker thread unless the interval is zero.
    ///
    /// Each `start` opens a new run that [`done`](Self::done) closes, so one
    /// reporter serves repeated operations. Calling it while the ticker is
    /// running does nothing.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return;
        }
        *self.shared.state.lock() = State::fresh();

        if self.shared.interval.is_zero() {
            return;
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(shared.interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !shared.tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            trace!("progress ticker stopped");
        });

        *ticker = Some(Ticker { stop, handle });
    }

    /// Add `delta` to the counters, calling the sink if the interval has passed
    /// since its last call.
    pub fn report(&self, delta: Stat) {
        let stat = {
            let mut state = self.shared.state.lock();
            state.current += delta;
            if state.finished || state.last_update.elapsed() < self.shared.interval {
                return;
            }
            state.last_update = Instant::now();
            state.current
        };
        self.shared.sink.update(&stat, self.elapsed(), false);
    }

    /// Call the sink now, regardless of the interval.
    pub fn force(&self) {
        let stat = {
            let mut state = self.shared.state.lock();
            if state.finished {
                return;
            }
            state.last_update = Instant::now();
            state.current
        };
        self.shared.sink.update(&stat, self.elapsed(), false);
    }

    /// Stop the ticker and hand the final counters to the sink. Only the first
    /// call after a [`start`](Self::start) has any effect.
    pub fn done(&self) {
        let (stat, elapsed) = {
            let mut state = self.shared.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            (state.current, state.started.elapsed())
        };
        self.stop_ticker();
        self.shared.sink.done(&stat, elapsed);
    }

    /// Current counters.
    pub fn current(&self) -> Stat {
        self.shared.state.lock().current
    }

    /// Time since the reporter was created or last started.
    pub fn elapsed(&self) -> Duration {
        self.shared.state.lock().started.elapsed()
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            // Wakes the thread; a failed send means it already exited.
            let _ = ticker.stop.send(());
            if ticker.handle.join().is_err() {
                trace!("progress ticker panicked");
            }
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("interval", &self.shared.interval)
            .field("current", &self.current())
            .finish()
    }
}

/// Throughput and ETA derived from counters; never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    /// Bytes processed per second so far.
    pub bytes_per_sec: u64,
    /// Share of `todo` bytes done, 0 to 100.
    pub percent: f64,
    /// Estimated time left, if a rate is known.
    pub eta: Option<Duration>,
}

impl Throughput {
    /// Derive throughput from `done` counters out of `todo` after `elapsed`.
    pub fn compute(done: &Stat, todo: &Stat, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs();
        let bytes_per_sec = if secs > 0 { done.bytes / secs } else { 0 };

        let percent = if todo.bytes > 0 {
            (done.bytes as f64 / todo.bytes as f64 * 100.0).min(100.0)
        } else if todo.items() > 0 {
            (done.items() as f64 / todo.items() as f64 * 100.0).min(100.0)
        } else {
            100.0
        };

        let eta = (bytes_per_sec > 0).then(|| {
            Duration::from_secs(todo.bytes.saturating_sub(done.bytes) / bytes_per_sec)
        });

        Self {
            bytes_per_sec,
            percent,
            eta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        forced: AtomicUsize,
        ticks: AtomicUsize,
        done: AtomicUsize,
        last: Mutex<Stat>,
    }

    impl ProgressSink for Arc<Recorder> {
        fn update(&self, stat: &Stat, _elapsed: Duration, ticker: bool) {
            if ticker {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            } else {
                self.forced.fetch_add(1, Ordering::SeqCst);
            }
            *self.last.lock() = *stat;
        }

        fn done(&self, stat: &Stat, _elapsed: Duration) {
            self.done.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = *stat;
        }
    }

    fn one_file(bytes: u64) -> Stat {
        Stat {
            files: 1,
            dirs: 0,
            bytes,
        }
    }

    #[test]
    fn test_report_is_throttled() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Duration::from_secs(3600), Arc::clone(&recorder));

        for _ in 0..100 {
            progress.report(one_file(10));
        }

        assert_eq!(recorder.forced.load(Ordering::SeqCst), 0);
        assert_eq!(progress.current(), Stat { files: 100, dirs: 0, bytes: 1000 });

        progress.force();
        assert_eq!(recorder.forced.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.last.lock().files, 100);
    }

    #[test]
    fn test_zero_interval_reports_every_time() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Duration::ZERO, Arc::clone(&recorder));

        progress.report(one_file(1));
        progress.report(one_file(1));
        assert_eq!(recorder.forced.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_done_called_once() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Duration::from_millis(5), Arc::clone(&recorder));
        progress.start();

        progress.report(one_file(42));
        progress.done();
        progress.done();

        assert_eq!(recorder.done.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.last.lock().bytes, 42);

        // Nothing reaches the sink after done.
        let updates = recorder.forced.load(Ordering::SeqCst);
        progress.force();
        assert_eq!(recorder.forced.load(Ordering::SeqCst), updates);
    }

    #[test]
    fn test_restart_opens_a_new_run() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Duration::from_millis(5), Arc::clone(&recorder));

        progress.start();
        progress.report(one_file(42));
        progress.done();

        progress.start();
        assert_eq!(progress.current(), Stat::default());
        progress.report(one_file(7));
        progress.force();
        progress.done();

        assert_eq!(recorder.done.load(Ordering::SeqCst), 2);
        assert_eq!(*recorder.last.lock(), one_file(7));
    }

    #[test]
    fn test_start_while_running_keeps_counters() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Duration::from_secs(3600), Arc::clone(&recorder));

        progress.start();
        progress.report(one_file(3));
        progress.start();
        assert_eq!(progress.current(), one_file(3));
        progress.done();

        assert_eq!(recorder.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ticker_fires() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Duration::from_millis(5), Arc::clone(&recorder));
        progress.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.ticks.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        progress.done();

        assert!(recorder.ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_throughput() {
        let todo = Stat {
            files: 4,
            dirs: 1,
            bytes: 1000,
        };
        let done = Stat {
            files: 2,
            dirs: 0,
            bytes: 250,
        };

        let t = Throughput::compute(&done, &todo, Duration::from_secs(5));
        assert_eq!(t.bytes_per_sec, 50);
        assert_eq!(t.percent, 25.0);
        assert_eq!(t.eta, Some(Duration::from_secs(15)));

        let t = Throughput::compute(&done, &todo, Duration::ZERO);
        assert_eq!(t.bytes_per_sec, 0);
        assert_eq!(t.eta, None);

        let t = Throughput::compute(&Stat::default(), &Stat::default(), Duration::ZERO);
        assert_eq!(t.percent, 100.0);
    }
}
