//! Byte-level progress tracking for replication rounds.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Shared counters updated by concurrent download tasks
#[derive(Debug)]
pub struct TransferCounters {
    total_bytes: u64,
    total_files: usize,
    transferred_bytes: AtomicU64,
    completed_files: AtomicUsize,
}

impl TransferCounters {
    pub fn new(total_bytes: u64, total_files: usize) -> Self {
        Self {
            total_bytes,
            total_files,
            transferred_bytes: AtomicU64::new(0),
            completed_files: AtomicUsize::new(0),
        }
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn complete_file(&self) {
        self.completed_files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn completed_files(&self) -> usize {
        self.completed_files.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_files(&self) -> usize {
        self.total_files
    }
}

/// Point-in-time view of a round's download progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub percent_complete: f64,
    pub files_processed: usize,
    pub total_files: usize,
}

/// Turns successive counter readings into speed and ETA
pub struct ProgressTracker {
    last_sample_time: Instant,
    last_bytes: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            last_sample_time: Instant::now(),
            last_bytes: 0,
        }
    }

    pub fn sample(&mut self, counters: &TransferCounters) -> TransferProgress {
        let now = Instant::now();
        let transferred = counters.transferred_bytes();
        let elapsed = now.duration_since(self.last_sample_time).as_secs_f64();

        let bytes_per_second = if elapsed > 0.0 {
            (transferred.saturating_sub(self.last_bytes) as f64 / elapsed) as u64
        } else {
            0
        };

        let eta_seconds = if bytes_per_second > 0 {
            counters.total_bytes().saturating_sub(transferred) / bytes_per_second
        } else {
            0
        };

        let percent_complete = if counters.total_bytes() > 0 {
            ((transferred as f64 / counters.total_bytes() as f64) * 100.0).min(100.0)
        } else {
            100.0
        };

        self.last_sample_time = now;
        self.last_bytes = transferred;

        TransferProgress {
            total_bytes: counters.total_bytes(),
            transferred_bytes: transferred,
            bytes_per_second,
            eta_seconds,
            percent_complete,
            files_processed: counters.completed_files(),
            total_files: counters.total_files(),
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
