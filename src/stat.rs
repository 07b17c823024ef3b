//! Per-worker sample collection and end-of-run reduction.

use std::time::{Instant, SystemTime};

use crate::bolt;

/// Timing record of a single request. Time points start unset and are
/// treated as "recorded" once filled in.
#[derive(Debug, Clone)]
pub struct RequestStat {
    pub request_time: Instant,
    pub request_wall_time: SystemTime,
    pub stream_close_time: Option<Instant>,
    pub status: u16,
    pub completed: bool,
}

impl RequestStat {
    pub fn new() -> Self {
        Self {
            request_time: Instant::now(),
            request_wall_time: SystemTime::now(),
            stream_close_time: None,
            status: 0,
            completed: false,
        }
    }
}

impl Default for RequestStat {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing record of a single client.
///
/// `client_start_time` is recorded once per client lifetime; the end time
/// is overwritten on each disconnect, which covers http/1.1's repeated
/// connect/disconnect cycles.
#[derive(Debug, Clone, Default)]
pub struct ClientStat {
    pub client_start_time: Option<Instant>,
    pub client_end_time: Option<Instant>,
    pub connect_start_time: Option<Instant>,
    pub connect_time: Option<Instant>,
    pub ttfb: Option<Instant>,
    pub req_success: u64,
}

/// Per-worker aggregate statistics, merged at the end of the run.
#[derive(Debug, Default)]
pub struct Stats {
    pub req_started: u64,
    pub req_done: u64,
    pub req_success: u64,
    pub req_status_success: u64,
    pub req_failed: u64,
    pub req_error: u64,
    pub req_timedout: u64,
    pub bytes_total: u64,
    pub bytes_head: u64,
    pub bytes_head_decomp: u64,
    pub bytes_body: u64,
    /// HTTP status class buckets; indexes 1 through 5 are used.
    pub status: [u64; 6],
    /// SOFARPC response-status buckets, indexed by status code.
    pub sofarpc_status: [u64; bolt::STATUS_BUCKETS],
    pub req_stats: Vec<RequestStat>,
    pub client_stats: Vec<ClientStat>,
}

impl Stats {
    pub fn merge(&mut self, other: Stats) {
        self.req_started += other.req_started;
        self.req_done += other.req_done;
        self.req_success += other.req_success;
        self.req_status_success += other.req_status_success;
        self.req_failed += other.req_failed;
        self.req_error += other.req_error;
        self.req_timedout += other.req_timedout;
        self.bytes_total += other.bytes_total;
        self.bytes_head += other.bytes_head;
        self.bytes_head_decomp += other.bytes_head_decomp;
        self.bytes_body += other.bytes_body;
        for (dst, src) in self.status.iter_mut().zip(other.status) {
            *dst += src;
        }
        for (dst, src) in self.sofarpc_status.iter_mut().zip(other.sofarpc_status) {
            *dst += src;
        }
        self.req_stats.extend(other.req_stats);
        self.client_stats.extend(other.client_stats);
    }
}

/// Summary of one sample distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SDStat {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sd: f64,
    /// Percentage of samples within `[mean - sd, mean + sd]`.
    pub within_sd: f64,
}

/// The four end-of-run distributions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryStats {
    pub request: SDStat,
    pub connect: SDStat,
    pub ttfb: SDStat,
    pub rps: SDStat,
}

fn within_sd(samples: &[f64], mean: f64, sd: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let lower = mean - sd;
    let upper = mean + sd;
    let m = samples.iter().filter(|&&t| lower <= t && t <= upper).count();

    (m as f64 / samples.len() as f64) * 100.0
}

/// Computes min, max, mean, standard deviation and the share of samples
/// within one deviation of the mean. The deviation uses Welford's online
/// recurrence; population variance by default, sample variance when
/// `sampling` is set.
pub fn compute_stat(samples: &[f64], sampling: bool) -> SDStat {
    if samples.is_empty() {
        return SDStat::default();
    }

    let mut a = 0.0;
    let mut q = 0.0;
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut res = SDStat {
        min: f64::MAX,
        max: f64::MIN,
        ..SDStat::default()
    };
    for &t in samples {
        n += 1;
        res.min = res.min.min(t);
        res.max = res.max.max(t);
        sum += t;

        let na = a + (t - a) / n as f64;
        q += (t - a) * (t - na);
        a = na;
    }

    res.mean = sum / n as f64;
    let div = if sampling && n > 1 { n - 1 } else { n };
    res.sd = (q / div as f64).sqrt();
    res.within_sd = within_sd(samples, res.mean, res.sd);

    res
}

/// Reduces all workers' samples into the four summary distributions:
/// request time, connect time, time to first byte and per-client
/// requests-per-second.
pub fn process_time_stats(stats: &Stats) -> SummaryStats {
    let mut request_times = Vec::new();
    let mut connect_times = Vec::new();
    let mut ttfb_times = Vec::new();
    let mut rps_values = Vec::new();

    for req_stat in &stats.req_stats {
        if !req_stat.completed {
            continue;
        }
        if let Some(close) = req_stat.stream_close_time {
            request_times.push((close - req_stat.request_time).as_secs_f64());
        }
    }

    for cstat in &stats.client_stats {
        if let (Some(start), Some(end)) = (cstat.client_start_time, cstat.client_end_time) {
            let t = (end - start).as_secs_f64();
            if t > 1e-9 {
                rps_values.push(cstat.req_success as f64 / t);
            }
        }

        // The connect event precedes the first byte, so a missing connect
        // time also rules the ttfb sample out.
        let (Some(start), Some(connected)) = (cstat.connect_start_time, cstat.connect_time) else {
            continue;
        };
        connect_times.push((connected - start).as_secs_f64());

        if let Some(ttfb) = cstat.ttfb {
            ttfb_times.push((ttfb - start).as_secs_f64());
        }
    }

    SummaryStats {
        request: compute_stat(&request_times, false),
        connect: compute_stat(&connect_times, false),
        ttfb: compute_stat(&ttfb_times, false),
        rps: compute_stat(&rps_values, false),
    }
}

pub const PERCENTILES: [f64; 5] = [50.0, 75.0, 90.0, 95.0, 99.0];

/// Latency distribution over all workers' round-trip samples.
///
/// A dense histogram indexed by microsecond from the observed minimum to
/// the observed maximum; percentile `p` selects rank `ceil(p/100 * N)` by
/// cumulative sum.
pub fn latency_percentiles(rtts: &[Vec<u64>], mut min: u64, mut max: u64) -> Vec<(f64, u64)> {
    let mut invalid = false;
    if min > max {
        min = 0;
        max = 0;
        invalid = true;
    }

    let mut hist = vec![0u64; (max - min + 1) as usize];
    let mut count = 0u64;
    for worker_rtts in rtts {
        count += worker_rtts.len() as u64;
        for &rtt in worker_rtts {
            hist[(rtt - min) as usize] += 1;
        }
    }

    PERCENTILES
        .iter()
        .map(|&p| {
            if invalid || count == 0 {
                return (p, 0);
            }
            let rank = ((p / 100.0) * count as f64).ceil() as u64;
            let mut total = 0;
            let mut rtt = min;
            for (i, &n) in hist.iter().enumerate() {
                total += n;
                rtt = min + i as u64;
                if total >= rank {
                    break;
                }
            }
            (p, rtt)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_on_constant_sequence_is_zero_sd() {
        let s = compute_stat(&[4.0; 64], false);
        assert_eq!(s.mean, 4.0);
        assert_eq!(s.sd, 0.0);
        assert_eq!(s.min, 4.0);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.within_sd, 100.0);
    }

    #[test]
    fn welford_population_sd_of_two_points() {
        // {x, x+k} has population deviation k/2.
        let s = compute_stat(&[10.0, 16.0], false);
        assert_eq!(s.mean, 13.0);
        assert!((s.sd - 3.0).abs() < 1e-12);
    }

    #[test]
    fn welford_sample_variance_option() {
        let s = compute_stat(&[10.0, 16.0], true);
        // Sample variance divides by n-1.
        assert!((s.sd - (18.0f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_samples_reduce_to_zero() {
        assert_eq!(compute_stat(&[], false), SDStat::default());
    }

    #[test]
    fn percentiles_of_identical_samples() {
        let rtts = vec![vec![250; 100]];
        for (_, v) in latency_percentiles(&rtts, 250, 250) {
            assert_eq!(v, 250);
        }
    }

    #[test]
    fn percentile_rank_is_ceiling_based() {
        // 1..=100 microseconds, one sample each: p% selects exactly p.
        let rtts = vec![(1..=100).collect::<Vec<u64>>()];
        let out = latency_percentiles(&rtts, 1, 100);
        assert_eq!(out, vec![(50.0, 50), (75.0, 75), (90.0, 90), (95.0, 95), (99.0, 99)]);
    }

    #[test]
    fn percentiles_with_no_samples_are_zero() {
        let out = latency_percentiles(&[], u64::MAX, u64::MIN);
        assert!(out.iter().all(|&(_, v)| v == 0));
    }
}
