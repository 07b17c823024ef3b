//! End-to-end count-mode runs against an in-process HTTP/1.1 server.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use clap::Parser;
use volley::{cfg::Config, cmd::Cmd, engine::Engine};

/// Serves canned responses until the client closes the connection.
fn serve_conn(mut conn: TcpStream, status_line: &str) {
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        let n = match conn.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        // One response per request head; requests here have no body.
        while let Some(at) = pending
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            pending.drain(..at + 4);
            let resp = format!("HTTP/1.1 {status_line}\r\nContent-Length: 2\r\n\r\nok");
            if conn.write_all(resp.as_bytes()).is_err() {
                return;
            }
        }
    }
}

fn spawn_server(status_line: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(conn) = conn else { return };
            thread::spawn(move || serve_conn(conn, status_line));
        }
    });

    port
}

fn run(args: &[String]) -> volley::engine::Summary {
    let mut argv = vec!["volley".to_string()];
    argv.extend_from_slice(args);
    let cmd = Cmd::try_parse_from(argv).unwrap();
    let cfg = Arc::new(Config::try_from(cmd).unwrap());

    Engine::new(cfg).unwrap().run().unwrap()
}

#[test]
fn count_mode_completes_every_request() {
    let port = spawn_server("200 OK");
    let args: Vec<String> = ["-n", "10", "-c", "2", "-t", "1", "--h1"]
        .iter()
        .map(|s| s.to_string())
        .chain([format!("http://127.0.0.1:{port}/")])
        .collect();

    let summary = run(&args);
    let stats = &summary.stats;

    assert_eq!(summary.total_requests, 10);
    assert_eq!(stats.req_started, 10);
    assert_eq!(stats.req_done, 10);
    assert_eq!(stats.req_status_success, 10);
    assert_eq!(stats.status[2], 10);
    assert_eq!(stats.req_failed, 0);
    assert_eq!(stats.req_error, 0);
    // One stat record per client, each with a recorded start.
    assert_eq!(stats.client_stats.len(), 2);
    assert!(stats.client_stats.iter().all(|c| c.client_start_time.is_some()));
    assert_eq!(stats.req_stats.len(), 10);
}

#[test]
fn single_request_single_client() {
    let port = spawn_server("200 OK");
    let args: Vec<String> = ["-n", "1", "-c", "1", "-t", "1", "--h1"]
        .iter()
        .map(|s| s.to_string())
        .chain([format!("http://127.0.0.1:{port}/")])
        .collect();

    let summary = run(&args);
    let stats = &summary.stats;

    assert_eq!(stats.req_started, 1);
    assert_eq!(stats.req_done, 1);
    assert_eq!(stats.req_status_success, 1);
    assert_eq!(stats.client_stats.len(), 1);
}

#[test]
fn workers_split_clients_with_remainder_first() {
    let port = spawn_server("200 OK");
    let args: Vec<String> = ["-n", "40", "-c", "5", "-t", "2", "--h1"]
        .iter()
        .map(|s| s.to_string())
        .chain([format!("http://127.0.0.1:{port}/")])
        .collect();

    let summary = run(&args);
    let stats = &summary.stats;

    assert_eq!(stats.req_done, 40);
    assert_eq!(stats.req_status_success, 40);
    // 5 clients over 2 workers: 3 + 2.
    assert_eq!(stats.client_stats.len(), 5);
}

#[test]
fn non_2xx_responses_fail_status_accounting() {
    let port = spawn_server("503 Unavailable");
    let args: Vec<String> = ["-n", "6", "-c", "1", "-t", "1", "--h1"]
        .iter()
        .map(|s| s.to_string())
        .chain([format!("http://127.0.0.1:{port}/")])
        .collect();

    let summary = run(&args);
    let stats = &summary.stats;

    assert_eq!(stats.req_done, 6);
    assert_eq!(stats.status[5], 6);
    assert_eq!(stats.req_status_success, 0);
    // Exchanges completed, but the status class counts them as failed.
    assert_eq!(stats.req_success, 6);
    assert_eq!(stats.req_failed, 6);
}

#[test]
fn connect_refused_counts_everything_errored() {
    // Bind-then-drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let args: Vec<String> = ["-n", "4", "-c", "1", "-t", "1", "--h1"]
        .iter()
        .map(|s| s.to_string())
        .chain([format!("http://127.0.0.1:{port}/")])
        .collect();

    let summary = run(&args);
    let stats = &summary.stats;

    assert_eq!(stats.req_done, 0);
    assert_eq!(stats.req_failed, 4);
    assert_eq!(stats.req_error, 4);
    assert!(stats.status.iter().all(|&n| n == 0));
}
