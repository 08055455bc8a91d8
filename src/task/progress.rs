//! Progress reporting with byte-level tracking and windowed speed
//! calculation over acknowledged chunks.

use serde::Serialize;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Sliding window for the speed estimate (3 seconds)
const SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Point-in-time view of a task's progress
#[derive(Clone, Serialize)]
pub struct ProgressSnapshot {
    /// Sum of the sizes of acknowledged chunks
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// `100 * uploaded_bytes / total_bytes`
    pub percentage: f64,
    pub speed_bytes_per_sec: u64,
    /// Estimated time remaining; None while the speed is zero
    pub eta_seconds: Option<u64>,
    pub uploaded_chunks: usize,
    pub total_chunks: usize,
}

impl Debug for ProgressSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Progress: {:.1}% ({} / {}) @ {}/s | chunks: {}/{}",
            self.percentage,
            format_bytes(self.uploaded_bytes),
            format_bytes(self.total_bytes),
            format_bytes(self.speed_bytes_per_sec),
            self.uploaded_chunks,
            self.total_chunks,
        )
    }
}

/// Format bytes into human-readable string (e.g., "10.5 MB")
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Speed over a sliding window of ack samples.
///
/// While acks keep arriving the speed is the byte delta across the window.
/// When they stop, the estimate decays linearly toward zero over one
/// window instead of snapping.
struct SpeedWindow {
    samples: Vec<(Instant, u64)>,
    last_rate: u64,
    last_ack: Option<Instant>,
}

impl SpeedWindow {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(32),
            last_rate: 0,
            last_ack: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        let cutoff = now - SPEED_WINDOW;
        self.samples.retain(|(t, _)| *t >= cutoff);
    }

    fn record(&mut self, total_bytes: u64) {
        let now = Instant::now();
        self.samples.push((now, total_bytes));
        self.last_ack = Some(now);
        self.prune(now);
        if let Some(rate) = self.windowed_rate(now) {
            self.last_rate = rate;
        }
    }

    fn windowed_rate(&self, now: Instant) -> Option<u64> {
        if self.samples.len() < 2 {
            return None;
        }
        let (oldest_time, oldest_bytes) = self.samples[0];
        let (_, newest_bytes) = *self.samples.last().unwrap();
        let elapsed = now.duration_since(oldest_time);
        if elapsed.as_millis() == 0 {
            return None;
        }
        let diff = newest_bytes.saturating_sub(oldest_bytes);
        Some((diff as f64 / elapsed.as_secs_f64()) as u64)
    }

    fn current(&mut self) -> u64 {
        let now = Instant::now();
        self.prune(now);
        if let Some(rate) = self.windowed_rate(now) {
            self.last_rate = rate;
            return rate;
        }
        match self.last_ack {
            Some(last) => {
                let idle = now.duration_since(last);
                if idle >= SPEED_WINDOW {
                    0
                } else {
                    let remaining = 1.0 - idle.as_secs_f64() / SPEED_WINDOW.as_secs_f64();
                    (self.last_rate as f64 * remaining) as u64
                }
            }
            None => 0,
        }
    }
}

/// Thread-safe progress tracker shared between chunk jobs.
///
/// `uploaded_bytes` counts acknowledged chunks only, so it is monotonic
/// non-decreasing regardless of retries or out-of-order completion.
pub(crate) struct ProgressTracker {
    total_bytes: u64,
    total_chunks: AtomicUsize,
    uploaded_bytes: AtomicU64,
    uploaded_chunks: AtomicUsize,
    speed: Mutex<SpeedWindow>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            total_chunks: AtomicUsize::new(0),
            uploaded_bytes: AtomicU64::new(0),
            uploaded_chunks: AtomicUsize::new(0),
            speed: Mutex::new(SpeedWindow::new()),
        }
    }

    /// Replanning can change the chunk count mid-upload
    pub fn set_total_chunks(&self, total: usize) {
        self.total_chunks.store(total, Ordering::SeqCst);
    }

    /// Record one acknowledged chunk
    pub fn record_ack(&self, chunk_bytes: u64) {
        let total = self.uploaded_bytes.fetch_add(chunk_bytes, Ordering::SeqCst) + chunk_bytes;
        self.uploaded_chunks.fetch_add(1, Ordering::SeqCst);
        self.speed.lock().expect("speed window poisoned").record(total);
    }

    /// Restore counters from a resumed record without feeding the speed
    /// window.
    pub fn seed(&self, uploaded_bytes: u64, uploaded_chunks: usize) {
        self.uploaded_bytes.store(uploaded_bytes, Ordering::SeqCst);
        self.uploaded_chunks.store(uploaded_chunks, Ordering::SeqCst);
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let uploaded = self.uploaded_bytes.load(Ordering::SeqCst);
        let percentage = if self.total_bytes > 0 {
            (uploaded as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };
        let speed = self.speed.lock().expect("speed window poisoned").current();
        let eta_seconds = if speed > 0 && uploaded < self.total_bytes {
            Some((self.total_bytes - uploaded) / speed)
        } else {
            None
        };

        ProgressSnapshot {
            uploaded_bytes: uploaded,
            total_bytes: self.total_bytes,
            percentage,
            speed_bytes_per_sec: speed,
            eta_seconds,
            uploaded_chunks: self.uploaded_chunks.load(Ordering::SeqCst),
            total_chunks: self.total_chunks.load(Ordering::SeqCst),
        }
    }
}
