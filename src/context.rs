//! Shared pipeline context.
//!
//! One [`PipelineContext`] is created per camera session and handed to the
//! ring buffer, accumulator and watchdog. It carries the swappable
//! configuration and the pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;

use crate::Config;

pub struct PipelineContext {
    config: ArcSwap<Config>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    frames_ingested: AtomicU64,
    results: AtomicU64,
    failures: AtomicU64,
    watchdog_barks: AtomicU64,
    zsl_matches: AtomicU64,
    zsl_evictions: AtomicU64,
}

/// Snapshot of the pipeline counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_ingested: u64,
    pub results: u64,
    pub failures: u64,
    pub watchdog_barks: u64,
    pub zsl_matches: u64,
    pub zsl_evictions: u64,
}

impl PipelineContext {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Current configuration. Components read it when they are (re)built,
    /// so a swap takes effect on the next `open`.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn store_config(&self, config: Config) {
        self.config.store(Arc::new(config));
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let s = &self.stats;
        PipelineMetrics {
            frames_received: s.frames_received.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            frames_ingested: s.frames_ingested.load(Ordering::Relaxed),
            results: s.results.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
            watchdog_barks: s.watchdog_barks.load(Ordering::Relaxed),
            zsl_matches: s.zsl_matches.load(Ordering::Relaxed),
            zsl_evictions: s.zsl_evictions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn frame_received(&self) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self, reason: &'static str) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("postcapture_frames_dropped", "reason" => reason).increment(1);
    }

    pub(crate) fn frame_ingested(&self) {
        self.stats.frames_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn result_emitted(&self) {
        self.stats.results.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("postcapture_results").increment(1);
    }

    pub(crate) fn failure_emitted(&self) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("postcapture_failures").increment(1);
    }

    pub(crate) fn watchdog_barked(&self) {
        self.stats.watchdog_barks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("postcapture_watchdog_barks").increment(1);
    }

    pub(crate) fn zsl_matched(&self) {
        self.stats.zsl_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn zsl_evicted(&self) {
        self.stats.zsl_evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("postcapture_zsl_evictions").increment(1);
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            config: ArcSwap::from_pointee(Config::default()),
            stats: CachePadded::new(Stats::default()),
        }
    }
}
