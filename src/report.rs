//! Final report formatting.

use crate::{
    bolt,
    cfg::{Config, NoTlsProto},
    engine::Summary,
    stat::SDStat,
};

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// `1.21M`-style unit formatting, powers of 1024.
fn funit(n: f64) -> String {
    if n >= GIB {
        format!("{:.2}G", n / GIB)
    } else if n >= MIB {
        format!("{:.2}M", n / MIB)
    } else if n >= KIB {
        format!("{:.2}K", n / KIB)
    } else {
        format!("{n:.0}")
    }
}

/// Seconds to a human duration: `1.23s`, `45.10ms`, `821us`.
fn format_duration(secs: f64) -> String {
    if secs >= 1.0 {
        format!("{secs:.2}s")
    } else if secs >= 1e-3 {
        format!("{:.2}ms", secs * 1e3)
    } else {
        format!("{}us", (secs * 1e6).round() as u64)
    }
}

fn stat_row(label: &str, s: &SDStat, time: bool) {
    let fmt = |v: f64| {
        if time {
            format_duration(v)
        } else {
            format!("{v:.2}")
        }
    };
    println!(
        "{label}: {:>10}  {:>10}  {:>10}  {:>10} {:>8}%",
        fmt(s.min),
        fmt(s.max),
        fmt(s.mean),
        fmt(s.sd),
        format!("{:.2}", s.within_sd),
    );
}

pub fn print(cfg: &Config, summary: &Summary) {
    let stats = &summary.stats;

    println!(
        "\nfinished in {}, {:.2} req/s, {}B/s",
        format_duration(summary.wall.as_secs_f64()),
        summary.rps,
        funit(summary.bps),
    );
    println!(
        "requests: {} total, {} started, {} done, {} succeeded, {} failed, {} errored, {} timeout",
        summary.total_requests,
        stats.req_started,
        stats.req_done,
        stats.req_status_success,
        stats.req_failed,
        stats.req_error,
        stats.req_timedout,
    );

    if cfg.no_tls_proto == NoTlsProto::SofaRpc {
        let s = &stats.sofarpc_status;
        println!("sofaRPC status codes:");
        println!(
            "\t{} success, {} error, {} server exception, {} unknown",
            s[bolt::RESPONSE_STATUS_SUCCESS as usize],
            s[bolt::RESPONSE_STATUS_ERROR as usize],
            s[bolt::RESPONSE_STATUS_SERVER_EXCEPTION as usize],
            s[bolt::RESPONSE_STATUS_UNKNOWN as usize],
        );
        println!(
            "\t{} server threadpool busy, {} error comm, {} no processor, {} timeout",
            s[bolt::RESPONSE_STATUS_SERVER_THREADPOOL_BUSY as usize],
            s[bolt::RESPONSE_STATUS_ERROR_COMM as usize],
            s[bolt::RESPONSE_STATUS_NO_PROCESSOR as usize],
            s[bolt::RESPONSE_STATUS_TIMEOUT as usize],
        );
        println!(
            "\t{} client send error, {} codec exception, {} connection closed, {} server serial exception",
            s[bolt::RESPONSE_STATUS_CLIENT_SEND_ERROR as usize],
            s[bolt::RESPONSE_STATUS_CODEC_EXCEPTION as usize],
            s[bolt::RESPONSE_STATUS_CONNECTION_CLOSED as usize],
            s[bolt::RESPONSE_STATUS_SERVER_SERIAL_EXCEPTION as usize],
        );
        println!(
            "\t{} server deserial exception",
            s[bolt::RESPONSE_STATUS_SERVER_DESERIAL_EXCEPTION as usize],
        );
    } else {
        println!(
            "status codes: {} 2xx, {} 3xx, {} 4xx, {} 5xx",
            stats.status[2], stats.status[3], stats.status[4], stats.status[5],
        );
    }

    let header_space_savings = if stats.bytes_head_decomp > 0 {
        1.0 - stats.bytes_head as f64 / stats.bytes_head_decomp as f64
    } else {
        0.0
    };
    println!(
        "traffic: {}B ({}) total, {}B ({}) headers (space savings {:.2}%), {}B ({}) data",
        funit(stats.bytes_total as f64),
        stats.bytes_total,
        funit(stats.bytes_head as f64),
        stats.bytes_head,
        header_space_savings * 100.0,
        funit(stats.bytes_body as f64),
        stats.bytes_body,
    );

    println!("                         min         max        mean          sd       +/- sd");
    stat_row("time for request", &summary.ts.request, true);
    stat_row("time for connect", &summary.ts.connect, true);
    stat_row("time to 1st byte", &summary.ts.ttfb, true);
    stat_row("req/s           ", &summary.ts.rps, false);

    println!("\n  Latency  Distribution");
    for &(p, rtt) in &summary.percentiles {
        println!(
            "{:>5.0}%{:>13}",
            p,
            format_duration(rtt as f64 / 1_000_000.0),
        );
    }
}
