//! Background sampling of the measure record.
//!
//! The sampler polls a record source in its own thread, keeps running statistics per phase
//! and a bounded history of the last records. Protocol errors are tolerated while an
//! [`ErrorBudget`] lasts; anything else stops the sampler at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use heapless::Deque;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, error, trace, warn};
use tracing_subscriber::filter::LevelFilter;

use crate::codec::Value;
use crate::diagnostics::ConsoleControl;
use crate::error::{Error, Result};
use crate::param::ParamValue;

/// Records kept by a sampler.
pub const HISTORY_CAPACITY: usize = 1000;

/// Tolerance of the sampling loop to protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Failure level at which sampling gives up.
    pub error_threshold: f64,
    /// Amount the failure level drops per successful read.
    pub error_leak: f64,
    /// Pause between reads, 0 to poll back to back.
    pub poll_interval_ms: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5.0,
            error_leak: 0.1,
            poll_interval_ms: 0,
        }
    }
}

/// Leaky failure counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorBudget {
    threshold: f64,
    leak: f64,
    level: f64,
}

impl ErrorBudget {
    pub fn new(threshold: f64, leak: f64) -> Self {
        Self {
            threshold,
            leak,
            level: 0.0,
        }
    }

    /// Count a failure. Returns `true` once the budget is spent.
    pub fn record_failure(&mut self) -> bool {
        self.level += 1.0;
        self.is_exhausted()
    }

    pub fn record_success(&mut self) {
        self.level = (self.level - self.leak).max(0.0);
    }

    pub fn is_exhausted(&self) -> bool {
        self.level >= self.threshold
    }

    pub fn level(&self) -> f64 {
        self.level
    }
}

impl From<&SamplingConfig> for ErrorBudget {
    fn from(config: &SamplingConfig) -> Self {
        ErrorBudget::new(config.error_threshold, config.error_leak)
    }
}

/// One reading of the measure record: active tap and the squared magnitude of each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeasureRecord {
    pub tap: u8,
    pub ln: u16,
    pub uv: u16,
}

impl TryFrom<&ParamValue> for MeasureRecord {
    type Error = Error;

    fn try_from(value: &ParamValue) -> Result<Self> {
        let field = |i: usize| value.as_tuple().get(i).and_then(Value::as_u64);
        match (field(0), field(1), field(2)) {
            (Some(tap), Some(ln), Some(uv)) if value.as_tuple().len() == 3 => Ok(MeasureRecord {
                tap: u8::try_from(tap).map_err(|_| Error::range("tap does not fit in a byte"))?,
                ln: u16::try_from(ln).map_err(|_| Error::range("LN sample does not fit in 16 bits"))?,
                uv: u16::try_from(uv).map_err(|_| Error::range("UV sample does not fit in 16 bits"))?,
            }),
            _ => Err(Error::format(format!("not a measure record: {value}"))),
        }
    }
}

/// Running statistics of squared magnitudes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseStats {
    scale: f64,
    max: u64,
    min: u64,
    sum: u64,
    count: u64,
}

impl PhaseStats {
    pub fn new(scale: f64) -> Self {
        let mut stats = Self {
            scale,
            max: 0,
            min: 0,
            sum: 0,
            count: 0,
        };
        stats.arm();
        stats
    }

    /// Restart accumulation.
    pub fn arm(&mut self) {
        self.max = 0;
        self.min = (1 << 24) - 1;
        self.sum = 0;
        self.count = 0;
    }

    pub fn add(&mut self, sample: u64) {
        self.sum += sample;
        self.max = self.max.max(sample);
        self.min = self.min.min(sample);
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn max(&self) -> f64 {
        (self.max as f64).sqrt() * self.scale
    }

    /// Smallest sample seen, 0 before the first one.
    pub fn min(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.min as f64).sqrt() * self.scale
    }

    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.sum as f64 / self.count as f64).sqrt() * self.scale
    }
}

impl core::fmt::Display for PhaseStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rms, max, min) = (self.rms(), self.max(), self.min());
        if (max - rms).abs() < 10.0 && (rms - min).abs() < 10.0 {
            write!(f, "{rms:6.2} (+{:4.2}/-{:4.2})", max - rms, rms - min)
        } else {
            write!(f, "{rms:6.2} ( -.--/ -.--)")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerStatus {
    Running,
    Stopped,
    Failed(String),
}

struct Shared {
    running: AtomicBool,
    status: Mutex<SamplerStatus>,
    history: Mutex<Deque<MeasureRecord, HISTORY_CAPACITY>>,
    stats: Mutex<(PhaseStats, PhaseStats)>,
}

/// Starts sampling threads.
pub struct Sampler;

impl Sampler {
    /// Poll `source` in a new thread until stopped, or until it fails for good.
    ///
    /// `scales` convert the LN and UV squared magnitudes to volts. When `console` is given
    /// it is silenced while sampling, since tolerated errors are expected.
    pub fn spawn<F>(
        mut source: F,
        scales: (f64, f64),
        config: &SamplingConfig,
        console: Option<ConsoleControl>,
    ) -> Result<SamplerHandle>
    where
        F: FnMut() -> Result<MeasureRecord> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            status: Mutex::new(SamplerStatus::Running),
            history: Mutex::new(Deque::new()),
            stats: Mutex::new((PhaseStats::new(scales.0), PhaseStats::new(scales.1))),
        });

        let mut budget = ErrorBudget::from(config);
        let interval = Duration::from_millis(config.poll_interval_ms as u64);
        let worker = Arc::clone(&shared);
        let span = Span::current();

        let thread = std::thread::Builder::new()
            .name("est-sampler".into())
            .spawn(move || {
                let _entered = span.enter();
                debug!("Sampler started");
                let restore = console.as_ref().map(|c| {
                    let previous = c.level();
                    if let Err(e) = c.set_level(LevelFilter::OFF) {
                        warn!("Console stays at {previous} while sampling: {e}");
                    }
                    previous
                });

                let mut outcome = SamplerStatus::Stopped;
                while worker.running.load(Ordering::Acquire) {
                    match source() {
                        Ok(record) => {
                            trace!("Measure: {record:?}");
                            {
                                let mut stats = worker.stats.lock();
                                stats.0.add(record.ln as u64);
                                stats.1.add(record.uv as u64);
                            }
                            {
                                let mut history = worker.history.lock();
                                if history.is_full() {
                                    history.pop_front();
                                }
                                let _ = history.push_back(record);
                            }
                            budget.record_success();
                        }
                        Err(Error::Protocol(e)) => {
                            debug!("Tolerated sampling error: {}", e.chain());
                            if budget.record_failure() {
                                outcome = SamplerStatus::Failed(
                                    "measurement failed, too many errors".into(),
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            outcome = SamplerStatus::Failed(format!(
                                "unexpected failure during measurement: {e}"
                            ));
                            break;
                        }
                    }
                    if !interval.is_zero() {
                        std::thread::sleep(interval);
                    }
                }

                if let (Some(console), Some(previous)) = (&console, restore) {
                    if let Err(e) = console.set_level(previous) {
                        warn!("Console level {previous} not restored: {e}");
                    }
                }
                if let SamplerStatus::Failed(reason) = &outcome {
                    error!("{reason}");
                }
                *worker.status.lock() = outcome;
                worker.running.store(false, Ordering::Release);
                debug!("Sampler stopped");
            })
            .map_err(|e| Error::InvalidValue(format!("could not start the sampler: {e}")))?;

        Ok(SamplerHandle {
            shared,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }
}

/// Control and view of a running sampler. Clones refer to the same sampler.
#[derive(Clone)]
pub struct SamplerHandle {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SamplerHandle {
    pub fn status(&self) -> SamplerStatus {
        self.shared.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Ask the thread to finish and wait for it.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                *self.shared.status.lock() = SamplerStatus::Failed("sampler thread panicked".into());
            }
        }
    }

    /// Kept records, oldest first.
    pub fn records(&self) -> Vec<MeasureRecord> {
        self.shared.history.lock().iter().copied().collect()
    }

    pub fn last(&self) -> Option<MeasureRecord> {
        self.shared.history.lock().back().copied()
    }

    /// LN and UV statistics.
    pub fn stats(&self) -> (PhaseStats, PhaseStats) {
        *self.shared.stats.lock()
    }

    /// Restart the statistics, keeping the history.
    pub fn arm(&self) {
        let mut stats = self.shared.stats.lock();
        stats.0.arm();
        stats.1.arm();
    }
}

impl core::fmt::Debug for SamplerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SamplerHandle")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
