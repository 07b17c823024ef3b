//! Orchestration: partitions the workload across worker threads,
//! releases them through a barrier, joins them and reduces their
//! statistics into the final summary.

use core::time::Duration;
use std::{
    sync::{Arc, Barrier},
    thread,
    time::Instant,
};

use anyhow::{anyhow, Result};

use crate::{
    cfg::Config,
    pacing::{self, PacingMode, RequestCounter},
    stat::{self, Stats, SummaryStats},
    tls,
    worker::{Worker, WorkerOutput},
};

#[derive(Debug)]
pub struct Summary {
    pub stats: Stats,
    pub ts: SummaryStats,
    pub wall: Duration,
    pub rps: f64,
    pub bps: f64,
    pub percentiles: Vec<(f64, u64)>,
    /// Requests total for the report: the configured count, or the number
    /// actually sent in plain duration mode.
    pub total_requests: u64,
}

#[derive(Debug)]
pub struct Engine {
    cfg: Arc<Config>,
    counters: Arc<RequestCounter>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl Engine {
    pub fn new(cfg: Arc<Config>) -> Result<Self> {
        let counters = Arc::new(match cfg.pacing() {
            // In plain duration mode `nreqs` is the sentinel; the counter
            // is zeroed by the duration timer instead of running out.
            PacingMode::Count { nreqs } => RequestCounter::new(nreqs),
            PacingMode::Rate { .. } => RequestCounter::new(cfg.nreqs),
            PacingMode::Qps { .. } => RequestCounter::unbounded(),
        });
        let tls = if cfg.is_tls() {
            Some(tls::client_config(&cfg))
        } else {
            None
        };

        Ok(Self { cfg, counters, tls })
    }

    pub fn run(&self) -> Result<Summary> {
        let nthreads = self.cfg.nthreads;
        let clients = pacing::split_even(self.cfg.nclients, nthreads);
        let rates = pacing::split_even(self.cfg.rate, nthreads);
        let qps = pacing::split_even(self.cfg.qps, nthreads);

        // All workers start their loops at one instant, together with the
        // wall clock below.
        let barrier = Arc::new(Barrier::new(nthreads as usize + 1));

        let mut handles = Vec::with_capacity(nthreads as usize);
        for i in 0..nthreads as usize {
            let qps_counts = if self.cfg.is_qps_mode() {
                pacing::qps_slots(qps[i])
            } else {
                Vec::new()
            };
            let worker = Worker::new(
                i as u32,
                self.cfg.clone(),
                self.counters.clone(),
                self.tls.clone(),
                clients[i],
                rates[i],
                qps_counts,
            );
            let barrier = barrier.clone();
            let handle = thread::Builder::new()
                .name(format!("volley:{i:02}"))
                .spawn(move || {
                    barrier.wait();
                    worker.run()
                })?;
            handles.push(handle);
        }

        barrier.wait();
        let start = Instant::now();

        let mut outputs: Vec<WorkerOutput> = Vec::with_capacity(handles.len());
        for handle in handles {
            let out = handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))??;
            outputs.push(out);
        }
        let wall = start.elapsed();

        Ok(self.reduce(outputs, wall))
    }

    fn reduce(&self, outputs: Vec<WorkerOutput>, wall: Duration) -> Summary {
        let cfg = &self.cfg;

        let mut stats = Stats::default();
        let mut rtts = Vec::with_capacity(outputs.len());
        let mut rtt_min = u64::MAX;
        let mut rtt_max = u64::MIN;
        for out in outputs {
            rtt_min = rtt_min.min(out.rtt_min);
            rtt_max = rtt_max.max(out.rtt_max);
            rtts.push(out.rtts);
            stats.merge(out.stats);
        }

        let ts = stat::process_time_stats(&stats);

        // Requests never issued because of connection errors count as
        // failed and errored; meaningful in count mode only.
        if !cfg.is_timing_based_mode() && !cfg.is_qps_mode() {
            let req_not_issued = cfg
                .nreqs
                .saturating_sub(stats.req_status_success)
                .saturating_sub(stats.req_failed);
            stats.req_failed += req_not_issued;
            stats.req_error += req_not_issued;
        }

        let (rps, bps) = if cfg.is_timing_based_mode() {
            let d = cfg.duration.as_secs_f64();
            (stats.req_success as f64 / d, stats.bytes_total as f64 / d)
        } else if !wall.is_zero() {
            let d = wall.as_secs_f64();
            (stats.req_success as f64 / d, stats.bytes_total as f64 / d)
        } else {
            (0.0, 0.0)
        };

        let total_requests = if cfg.is_timing_based_mode() && !cfg.is_qps_mode() {
            self.counters.sent()
        } else {
            cfg.nreqs
        };

        let percentiles = stat::latency_percentiles(&rtts, rtt_min, rtt_max);

        Summary {
            stats,
            ts,
            wall,
            rps,
            bps,
            percentiles,
            total_requests,
        }
    }
}
