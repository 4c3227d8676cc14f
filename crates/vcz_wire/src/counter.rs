//! Transfer rate meters of a connection.
//!
//! Purely observational: recording bytes never changes how the engine
//! behaves.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{sync::Mutex, time::Instant};

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Meter of one direction of traffic.
#[derive(Debug)]
pub struct Meter {
    /// Every byte ever recorded.
    pub total: AtomicU64,

    /// Smoothed rate in bytes/sec, as of the last [`Meter::update_rate`].
    pub rate: AtomicU64,

    window: AtomicU64,
    last_update: Mutex<Instant>,
    ema: Mutex<f64>,
}

impl Default for Meter {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            rate: AtomicU64::new(0),
            window: AtomicU64::new(0),
            last_update: Mutex::new(Instant::now()),
            ema: Mutex::new(0.0),
        }
    }
}

impl Meter {
    pub fn record(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        self.window.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Fold the bytes recorded since the last call into the EMA rate.
    pub async fn update_rate(&self) {
        let now = Instant::now();
        let mut last_update = self.last_update.lock().await;
        let elapsed = now.duration_since(*last_update).as_secs_f64();

        // minimum 1ms elapsed
        if elapsed < 0.001 {
            return;
        }

        let recorded = self.window.swap(0, Ordering::Relaxed);
        let instant_rate = recorded as f64 / elapsed;

        let mut ema = self.ema.lock().await;
        *ema = if *ema == 0.0 {
            instant_rate
        } else {
            EMA_ALPHA * instant_rate + (1.0 - EMA_ALPHA) * *ema
        };

        self.rate.store(*ema as u64, Ordering::Relaxed);
        *last_update = now;
    }
}

/// Download and upload meters of a connection, shared with the application
/// through an `Arc`.
#[derive(Debug, Default)]
pub struct Counter {
    pub download: Meter,
    pub upload: Meter,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64) {
        self.download.record(bytes);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.upload.record(bytes);
    }

    pub async fn update_rates(&self) {
        self.download.update_rate().await;
        self.upload.update_rate().await;
    }
}
