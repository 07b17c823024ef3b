//! Per-connection client state machine.
//!
//! A client owns one socket, an optional TLS session and one protocol
//! session. It connects (walking the resolved address list), completes the
//! TLS handshake, dispatches on the negotiated ALPN protocol, submits
//! requests under the active pacing discipline, accounts per-stream
//! timings, and recycles or fails the connection on errors.

use core::cell::{Cell, RefCell};
use std::{
    collections::HashMap,
    io::{self, Read, Write},
    os::fd::AsRawFd,
    rc::Rc,
    sync::Arc,
    time::Instant as StdInstant,
};

use anyhow::{anyhow, Result};
use bytes::{Buf, BytesMut};
use rustls::pki_types::ServerName;
use tokio::{
    net::{TcpSocket, TcpStream, UnixStream},
    sync::Semaphore,
    time::{sleep_until, Instant},
};

use crate::{
    bolt,
    cfg::{Address, NoTlsProto, H1_ALPN, H2_ALPN_FAMILY, H2_CLEARTEXT, SOFARPC_ALPN},
    session::{
        bolt::BoltSession, http1::Http1Session, http2::Http2Session, EventSink, Session,
        SessionEvent, BACKOFF_WRITE_BUFFER_THRES,
    },
    stat::{ClientStat, RequestStat},
    worker::{Phase, WorkerCtx},
};

const READ_BUFFER_LEN: usize = 8 * 1024;

/// One in-flight request. `status_success` is tri-state: -1 unknown,
/// 0 failed, 1 succeeded.
#[derive(Debug)]
pub struct Stream {
    pub status_success: i8,
    pub req_stat: RequestStat,
}

impl Stream {
    fn new() -> Self {
        Self {
            status_success: -1,
            req_stat: RequestStat::new(),
        }
    }
}

/// Client state observable by the worker: per-client stat record and the
/// request counters the warm-up snapshot asserts on.
#[derive(Debug)]
pub struct ClientShared {
    pub cstat: RefCell<ClientStat>,
    pub req_started: Cell<u64>,
    pub req_done: Cell<u64>,
    pub req_inflight: Cell<u64>,
    pub qps_waiter: Arc<Semaphore>,
    absorbed: Cell<bool>,
}

impl ClientShared {
    pub fn new() -> Self {
        Self {
            cstat: RefCell::new(ClientStat::default()),
            req_started: Cell::new(0),
            req_done: Cell::new(0),
            req_inflight: Cell::new(0),
            qps_waiter: Arc::new(Semaphore::new(0)),
            absorbed: Cell::new(false),
        }
    }

    /// Recorded only once, at the very first connection initiation.
    pub fn record_client_start_time(&self) {
        let mut cstat = self.cstat.borrow_mut();
        if cstat.client_start_time.is_none() {
            cstat.client_start_time = Some(StdInstant::now());
        }
    }

    /// Overwritten on every disconnect; http/1.1 cycles through many.
    pub fn record_client_end_time(&self) {
        self.cstat.borrow_mut().client_end_time = Some(StdInstant::now());
    }

    pub fn record_connect_start_time(&self) {
        self.cstat.borrow_mut().connect_start_time = Some(StdInstant::now());
    }

    pub fn record_connect_time(&self) {
        self.cstat.borrow_mut().connect_time = Some(StdInstant::now());
    }

    pub fn record_ttfb(&self) {
        let mut cstat = self.cstat.borrow_mut();
        if cstat.ttfb.is_none() {
            cstat.ttfb = Some(StdInstant::now());
        }
    }

    pub fn clear_connect_times(&self) {
        let mut cstat = self.cstat.borrow_mut();
        cstat.connect_start_time = None;
        cstat.connect_time = None;
        cstat.ttfb = None;
    }

    /// Hands the stat record to the worker exactly once.
    pub fn take_stat(&self) -> Option<ClientStat> {
        if self.absorbed.replace(true) {
            return None;
        }
        Some(self.cstat.borrow().clone())
    }
}

impl Default for ClientShared {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP or Unix-domain transport, non-blocking.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    pub async fn connect(addr: &Address) -> io::Result<Self> {
        match addr {
            Address::Tcp(sa) => {
                let sock = if sa.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                let stream = sock.connect(*sa).await?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
            Address::Unix(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.readable().await,
            Self::Unix(s) => s.readable().await,
        }
    }

    pub async fn writable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.writable().await,
            Self::Unix(s) => s.writable().await,
        }
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_read(buf),
            Self::Unix(s) => s.try_read(buf),
        }
    }

    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_write(buf),
            Self::Unix(s) => s.try_write(buf),
        }
    }

    fn shutdown_write(&self) {
        let fd = match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        };
        unsafe {
            libc::shutdown(fd, libc::SHUT_WR);
        }
    }
}

struct SockReader<'a>(&'a Transport);

impl Read for SockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

struct SockWriter<'a>(&'a Transport);

impl Write for SockWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Serve {
    Reconnect,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submit {
    Ok,
    /// QPS budget empty; the submission was parked for a later grant.
    Deferred,
    /// No request budget left, or the session refused the request.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    Again,
    Eof,
}

enum Wake {
    Shutdown,
    Readable,
    Writable,
    QpsGrant,
    ConnTimeout,
    RequestTick,
}

pub struct Client {
    id: u32,
    w: Rc<WorkerCtx>,
    shared: Rc<ClientShared>,
    sock: Option<Transport>,
    tls: Option<rustls::ClientConnection>,
    session: Option<Box<dyn Session>>,
    events: EventSink,
    streams: HashMap<u32, Stream>,
    wb: BytesMut,
    next_addr: usize,
    current_addr: Option<usize>,
    state: ClientState,
    new_connection_requested: bool,
    /// Deferred submissions parked on the QPS gate.
    pending_submits: u32,
    /// Cursor into the timing script.
    sched_idx: usize,
    inactivity_deadline: Option<Instant>,
    active_deadline: Option<Instant>,
    next_request_at: Option<Instant>,
}

impl Client {
    pub fn new(id: u32, w: Rc<WorkerCtx>, shared: Rc<ClientShared>) -> Self {
        Self {
            id,
            w,
            shared,
            sock: None,
            tls: None,
            session: None,
            events: EventSink::new(),
            streams: HashMap::new(),
            wb: BytesMut::new(),
            next_addr: 0,
            current_addr: None,
            state: ClientState::Idle,
            new_connection_requested: false,
            pending_submits: 0,
            sched_idx: 0,
            inactivity_deadline: None,
            active_deadline: None,
            next_request_at: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            let w = self.w.clone();
            let established = tokio::select! {
                biased;
                _ = w.shutdown.wait() => {
                    self.disconnect();
                    break;
                }
                r = self.establish() => r,
            };
            if let Err(err) = established {
                log::error!("client {} could not connect to host: {err}", self.id);
                self.fail();
                break;
            }

            match self.serve().await {
                Serve::Reconnect => continue,
                Serve::Stop => break,
            }
        }

        self.w.absorb_client(&self.shared);
    }

    /// Connects, completes the TLS handshake and brings the protocol
    /// session up. The connection inactivity timeout, when configured,
    /// bounds the whole establishment.
    async fn establish(&mut self) -> Result<()> {
        let deadline = self.w.cfg.conn_inactivity_timeout;
        let fut = async {
            self.connect_socket().await?;
            if self.tls.is_some() {
                self.tls_handshake().await?;
            }
            self.connection_made()
        };

        match deadline {
            Some(t) => tokio::time::timeout(t, fut)
                .await
                .map_err(|_| anyhow!("connect timed out"))?,
            None => fut.await,
        }
    }

    async fn connect_socket(&mut self) -> Result<()> {
        let cfg = self.w.cfg.clone();

        if !cfg.is_timing_based_mode() || self.w.phase.get() == Phase::MainDuration {
            self.shared.record_client_start_time();
            self.shared.clear_connect_times();
            self.shared.record_connect_start_time();
        } else if self.w.phase.get() == Phase::InitialIdle {
            self.w.phase.set(Phase::WarmUp);
            self.w.kick_warmup();
        }

        self.restart_inactivity_timer();

        let sock = match self.current_addr {
            // A requested reconnect keeps using the current address.
            Some(idx) => Transport::connect(&cfg.addrs[idx]).await?,
            None => {
                let mut sock = None;
                while self.next_addr < cfg.addrs.len() {
                    let idx = self.next_addr;
                    self.next_addr += 1;
                    match Transport::connect(&cfg.addrs[idx]).await {
                        Ok(s) => {
                            self.current_addr = Some(idx);
                            sock = Some(s);
                            break;
                        }
                        Err(err) => {
                            log::debug!("connect to {:?} failed: {err}", cfg.addrs[idx]);
                        }
                    }
                }
                sock.ok_or_else(|| anyhow!("all addresses failed"))?
            }
        };

        if cfg.is_tls() {
            let tls_cfg = self
                .w
                .tls
                .clone()
                .ok_or_else(|| anyhow!("missing TLS context"))?;
            let server_name = ServerName::try_from(cfg.host.clone())
                .map_err(|e| anyhow!("bad server name {}: {e}", cfg.host))?;
            let conn = rustls::ClientConnection::new(tls_cfg, server_name)?;
            self.tls = Some(conn);
        }
        self.sock = Some(sock);

        Ok(())
    }

    async fn tls_handshake(&mut self) -> Result<()> {
        let sock = self.sock.as_ref().ok_or_else(|| anyhow!("no socket"))?;
        let conn = self.tls.as_mut().ok_or_else(|| anyhow!("no TLS session"))?;

        loop {
            while conn.wants_write() {
                match conn.write_tls(&mut SockWriter(sock)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => sock.writable().await?,
                    Err(e) => return Err(e.into()),
                }
            }
            if !conn.is_handshaking() {
                return Ok(());
            }

            sock.readable().await?;
            match conn.read_tls(&mut SockReader(sock)) {
                Ok(0) => return Err(anyhow!("connection closed during TLS handshake")),
                Ok(_) => {
                    conn.process_new_packets()
                        .map_err(|e| anyhow!("TLS handshake failed: {e}"))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Determines the application protocol and brings the session up.
    fn connection_made(&mut self) -> Result<()> {
        let cfg = self.w.cfg.clone();

        let mut selected: Option<String> = None;
        let session: Option<Box<dyn Session>> = if let Some(conn) = &self.tls {
            self.report_tls_info();

            match conn.alpn_protocol() {
                Some(proto) => {
                    let proto = String::from_utf8_lossy(proto).to_string();
                    let s: Option<Box<dyn Session>> = if H2_ALPN_FAMILY.contains(&proto.as_str()) {
                        Some(Box::new(Http2Session::new(cfg.clone())))
                    } else if proto == H1_ALPN {
                        Some(Box::new(Http1Session::new(cfg.clone())))
                    } else if proto == SOFARPC_ALPN {
                        Some(Box::new(BoltSession::new(cfg.clone())))
                    } else {
                        None
                    };
                    // Keep the negotiation result for reporting even when
                    // the protocol is unsupported.
                    selected = Some(proto);
                    s
                }
                None => {
                    println!("No protocol negotiated. Fallback behaviour may be activated");
                    let mut s: Option<Box<dyn Session>> = None;
                    for proto in &cfg.npn_list {
                        if proto == H1_ALPN {
                            println!("Server does not support ALPN. Falling back to HTTP/1.1.");
                            s = Some(Box::new(Http1Session::new(cfg.clone())));
                            selected = Some(H1_ALPN.to_string());
                            break;
                        }
                    }
                    s
                }
            }
        } else {
            let (s, name): (Box<dyn Session>, &str) = match cfg.no_tls_proto {
                NoTlsProto::Http2 => (Box::new(Http2Session::new(cfg.clone())), H2_CLEARTEXT),
                NoTlsProto::Http1 => (Box::new(Http1Session::new(cfg.clone())), H1_ALPN),
                NoTlsProto::SofaRpc => (Box::new(BoltSession::new(cfg.clone())), SOFARPC_ALPN),
            };
            selected = Some(name.to_string());
            Some(s)
        };

        if let Some(proto) = &selected {
            self.report_app_info(proto);
        }
        let Some(mut session) = session else {
            println!("No supported protocol was negotiated. Supported protocols were:");
            for proto in &cfg.npn_list {
                println!("{proto}");
            }
            self.disconnect();
            return Err(anyhow!("no supported protocol negotiated"));
        };

        self.state = ClientState::Connected;
        session.on_connect(&mut self.events);
        self.session = Some(session);
        self.shared.record_connect_time();

        if cfg.timings.is_empty() {
            let nreq = self.session.as_ref().map(|s| s.max_concurrent_streams()).unwrap_or(0);
            for _ in 0..nreq {
                match self.submit_request()? {
                    Submit::Ok | Submit::Deferred => {}
                    Submit::Exhausted => {
                        self.process_request_failure();
                        break;
                    }
                }
            }
        } else {
            self.sched_idx = 0;
            self.next_request_at = Some(Instant::now() + cfg.timings[0]);
        }
        self.dispatch_events()?;

        Ok(())
    }

    /// Pacing-mode dispatch for one submission.
    fn submit_request(&mut self) -> Result<Submit> {
        if self.w.cfg.is_qps_mode() {
            if !self.w.qps.try_take() {
                self.w.qps.park(self.shared.qps_waiter.clone());
                self.pending_submits += 1;
                return Ok(Submit::Deferred);
            }
        } else if !self.w.counters.try_take() {
            return Ok(Submit::Exhausted);
        }
        self.w.counters.on_sent();

        let Some(session) = self.session.as_mut() else {
            return Ok(Submit::Exhausted);
        };
        if session.submit_request(&mut self.events).is_err() {
            return Ok(Submit::Exhausted);
        }

        if self.w.phase.get() != Phase::MainDuration {
            return Ok(Submit::Ok);
        }

        self.w.stats.borrow_mut().req_started += 1;
        self.shared.req_started.set(self.shared.req_started.get() + 1);
        self.shared.req_inflight.set(self.shared.req_inflight.get() + 1);

        if let Some(t) = self.w.cfg.conn_active_timeout {
            // One-shot: armed by the first submission of this connection.
            if self.active_deadline.is_none() {
                self.active_deadline = Some(Instant::now() + t);
            }
        }

        Ok(Submit::Ok)
    }

    fn process_request_failure(&mut self) {
        if self.w.phase.get() != Phase::MainDuration {
            self.w.shutdown.fire();
            return;
        }
        // Nothing in flight and nothing left to submit: wind the
        // connection down instead of idling until a server timeout.
        if self.shared.req_inflight.get() == 0 {
            self.terminate_session();
        }
    }

    async fn serve(&mut self) -> Serve {
        debug_assert_eq!(self.state, ClientState::Connected);
        loop {
            let want_write = match self.flush() {
                Ok(w) => w,
                Err(err) => {
                    log::debug!("client {}: write failed: {err}", self.id);
                    self.fail();
                    return Serve::Stop;
                }
            };

            let session_done = match &self.session {
                Some(session) => session.is_closed(),
                None => true,
            };
            if session_done && !want_write {
                self.disconnect();
                return Serve::Stop;
            }

            let wake = {
                let sock = match self.sock.as_ref() {
                    Some(sock) => sock,
                    None => return Serve::Stop,
                };
                let inactivity = self.inactivity_deadline;
                let active = self.active_deadline;
                let tick = self.next_request_at;
                let far = Instant::now() + core::time::Duration::from_secs(86_400);

                tokio::select! {
                    biased;
                    _ = self.w.shutdown.wait() => Wake::Shutdown,
                    grant = self.shared.qps_waiter.clone().acquire_owned(), if self.pending_submits > 0 => {
                        if let Ok(permit) = grant {
                            permit.forget();
                        }
                        Wake::QpsGrant
                    }
                    _ = sleep_until(inactivity.unwrap_or(far)), if inactivity.is_some() => Wake::ConnTimeout,
                    _ = sleep_until(active.unwrap_or(far)), if active.is_some() => Wake::ConnTimeout,
                    _ = sleep_until(tick.unwrap_or(far)), if tick.is_some() => Wake::RequestTick,
                    // Socket-level errors surface through the read/write
                    // paths themselves.
                    _ = sock.readable() => Wake::Readable,
                    _ = sock.writable(), if want_write => Wake::Writable,
                }
            };

            match wake {
                Wake::Shutdown => {
                    self.shared.record_client_end_time();
                    if let Some(session) = self.session.as_mut() {
                        session.terminate();
                    }
                    let _ = self.flush();
                    self.disconnect();
                    return Serve::Stop;
                }
                Wake::Readable => {
                    self.restart_inactivity_timer();
                    match self.do_read() {
                        Ok(ReadOutcome::Again) => {}
                        Ok(ReadOutcome::Eof) => return self.try_again_or_fail(),
                        Err(err) => {
                            log::debug!("client {}: read failed: {err}", self.id);
                            return self.try_again_or_fail();
                        }
                    }
                }
                Wake::Writable => {
                    self.restart_inactivity_timer();
                }
                Wake::QpsGrant => {
                    if self.pending_submits > 0 {
                        self.pending_submits -= 1;
                        match self.submit_request() {
                            Ok(Submit::Exhausted) => self.process_request_failure(),
                            Ok(_) => {}
                            Err(_) => self.process_request_failure(),
                        }
                        if self.dispatch_events().is_err() {
                            self.fail();
                            return Serve::Stop;
                        }
                    }
                }
                Wake::ConnTimeout => {
                    self.inactivity_deadline = None;
                    self.active_deadline = None;
                    self.process_timedout_streams();
                    self.disconnect();
                    return Serve::Stop;
                }
                Wake::RequestTick => {
                    if self.on_request_schedule().is_err() {
                        self.fail();
                        return Serve::Stop;
                    }
                }
            }
        }
    }

    /// Timing-script tick: submit the next request(s); offsets closer
    /// than a nanosecond coalesce into the same tick.
    fn on_request_schedule(&mut self) -> Result<()> {
        let cfg = self.w.cfg.clone();
        let timings = &cfg.timings;
        let max_streams = self
            .session
            .as_ref()
            .map(|s| s.max_concurrent_streams())
            .unwrap_or(0) as usize;

        self.next_request_at = None;
        if self.streams.len() >= max_streams {
            return Ok(());
        }

        let mut submitted = 0usize;
        loop {
            match self.submit_request()? {
                Submit::Exhausted => {
                    self.process_request_failure();
                    break;
                }
                Submit::Ok | Submit::Deferred => {}
            }
            if self.w.counters.is_exhausted() {
                break;
            }

            let prev = timings[self.sched_idx % timings.len()];
            self.sched_idx += 1;
            let next = timings[self.sched_idx % timings.len()];
            let gap = next.saturating_sub(prev);

            if gap.as_nanos() >= 1 && self.sched_idx % timings.len() != 0 {
                self.next_request_at = Some(Instant::now() + gap);
                break;
            }
            // Guard against degenerate scripts collapsing every offset.
            submitted += 1;
            if submitted > timings.len() {
                self.next_request_at = Some(Instant::now() + core::time::Duration::from_millis(1));
                break;
            }
        }
        self.dispatch_events()
    }

    fn do_read(&mut self) -> Result<ReadOutcome> {
        let mut buf = [0u8; READ_BUFFER_LEN];

        if self.tls.is_some() {
            loop {
                let raw = {
                    let sock = self.sock.as_ref().ok_or_else(|| anyhow!("no socket"))?;
                    let conn = self.tls.as_mut().ok_or_else(|| anyhow!("no TLS session"))?;
                    match conn.read_tls(&mut SockReader(sock)) {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Again),
                        Err(e) => return Err(e.into()),
                    }
                };
                if raw == 0 {
                    self.notify_eof()?;
                    return Ok(ReadOutcome::Eof);
                }

                let state = {
                    let conn = self.tls.as_mut().ok_or_else(|| anyhow!("no TLS session"))?;
                    conn.process_new_packets().map_err(|e| anyhow!("TLS error: {e}"))?
                };
                loop {
                    let n = {
                        let conn = self.tls.as_mut().ok_or_else(|| anyhow!("no TLS session"))?;
                        match conn.reader().read(&mut buf) {
                            Ok(n) => n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    };
                    if n == 0 {
                        self.notify_eof()?;
                        return Ok(ReadOutcome::Eof);
                    }
                    self.feed(&buf[..n])?;
                }
                if state.peer_has_closed() {
                    self.notify_eof()?;
                    return Ok(ReadOutcome::Eof);
                }
            }
        } else {
            loop {
                let n = {
                    let sock = self.sock.as_ref().ok_or_else(|| anyhow!("no socket"))?;
                    match sock.try_read(&mut buf) {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Again),
                        Err(e) => return Err(e.into()),
                    }
                };
                if n == 0 {
                    self.notify_eof()?;
                    return Ok(ReadOutcome::Eof);
                }
                self.feed(&buf[..n])?;
            }
        }
    }

    fn notify_eof(&mut self) -> Result<()> {
        if let Some(session) = self.session.as_mut() {
            session.on_eof(&mut self.events);
        }
        self.dispatch_events()
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(anyhow!("read without a session"));
        };
        session.on_read(data, &mut self.events)?;

        if self.w.phase.get() == Phase::MainDuration {
            self.w.stats.borrow_mut().bytes_total += data.len() as u64;
        }

        self.dispatch_events()
    }

    /// Pulls frames from the session and pushes them through TLS (when
    /// present) onto the socket. Returns whether socket-level bytes are
    /// still pending, i.e. write interest.
    fn flush(&mut self) -> Result<bool> {
        loop {
            let before = self.wb.len();

            if before < BACKOFF_WRITE_BUFFER_THRES {
                if let Some(session) = self.session.as_mut() {
                    session.on_write(&mut self.wb, &mut self.events)?;
                }
            }

            if self.tls.is_none() {
                if self.wb.is_empty() {
                    return Ok(false);
                }
                let n = {
                    let sock = self.sock.as_ref().ok_or_else(|| anyhow!("no socket"))?;
                    match sock.try_write(&self.wb) {
                        Ok(0) => return Err(anyhow!("connection closed while writing")),
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                        Err(e) => return Err(e.into()),
                    }
                };
                self.wb.advance(n);
                self.restart_inactivity_timer();
                continue;
            }

            // TLS: move plaintext into rustls, then drain its records.
            let mut progress = self.wb.len() != before;
            if !self.wb.is_empty() {
                let conn = self.tls.as_mut().ok_or_else(|| anyhow!("no TLS session"))?;
                let n = conn.writer().write(&self.wb)?;
                if n > 0 {
                    self.wb.advance(n);
                    progress = true;
                }
            }
            {
                let sock = self.sock.as_ref().ok_or_else(|| anyhow!("no socket"))?;
                let conn = self.tls.as_mut().ok_or_else(|| anyhow!("no TLS session"))?;
                while conn.wants_write() {
                    match conn.write_tls(&mut SockWriter(sock)) {
                        Ok(_) => progress = true,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            if progress {
                self.restart_inactivity_timer();
            }
            if self.wb.is_empty() {
                return Ok(false);
            }
            if !progress {
                return Ok(true);
            }
        }
    }

    fn dispatch_events(&mut self) -> Result<()> {
        while let Some(ev) = self.events.pop_front() {
            match ev {
                SessionEvent::Request { stream_id } => self.on_request(stream_id),
                SessionEvent::Header { stream_id, name, value } => {
                    self.on_header(stream_id, &name, &value);
                }
                SessionEvent::StatusCode { stream_id, status } => {
                    self.on_status_code(stream_id, status);
                }
                SessionEvent::RpcStatus { stream_id, status } => {
                    self.on_sofarpc_status(stream_id, status);
                }
                SessionEvent::StreamClose { stream_id, success, last } => {
                    self.on_stream_close(stream_id, success, last)?;
                }
                SessionEvent::FirstByte => self.shared.record_ttfb(),
                SessionEvent::NewConnection => self.new_connection_requested = true,
                SessionEvent::HeadBytes { wire, decomp } => {
                    if self.w.phase.get() == Phase::MainDuration {
                        let mut stats = self.w.stats.borrow_mut();
                        stats.bytes_head += wire;
                        stats.bytes_head_decomp += decomp;
                    }
                }
                SessionEvent::BodyBytes { n } => {
                    if self.w.phase.get() == Phase::MainDuration {
                        self.w.stats.borrow_mut().bytes_body += n;
                    }
                }
            }
        }

        Ok(())
    }

    fn on_request(&mut self, stream_id: u32) {
        self.streams.insert(stream_id, Stream::new());
    }

    fn on_header(&mut self, stream_id: u32, name: &[u8], value: &[u8]) {
        let phase = self.w.phase.get();
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if phase != Phase::MainDuration {
            // Warm-up streams count as successes without touching the
            // status-class buckets.
            stream.status_success = 1;
            return;
        }

        if stream.status_success == -1 && name == b":status" {
            let mut status: u32 = 0;
            for &c in value {
                if !c.is_ascii_digit() {
                    break;
                }
                status = status * 10 + u32::from(c - b'0');
                if status > 999 {
                    stream.status_success = 0;
                    return;
                }
            }

            stream.req_stat.status = status as u16;
            let mut stats = self.w.stats.borrow_mut();
            if (200..300).contains(&status) {
                stats.status[2] += 1;
                stream.status_success = 1;
            } else if status < 400 {
                stats.status[3] += 1;
                stream.status_success = 1;
            } else if status < 600 {
                stats.status[(status / 100) as usize] += 1;
                stream.status_success = 0;
            } else {
                stream.status_success = 0;
            }
        }
    }

    fn on_status_code(&mut self, stream_id: u32, status: u16) {
        let phase = self.w.phase.get();
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if phase != Phase::MainDuration {
            stream.status_success = 1;
            return;
        }

        stream.req_stat.status = status;
        let mut stats = self.w.stats.borrow_mut();
        if (200..300).contains(&status) {
            stats.status[2] += 1;
            stream.status_success = 1;
        } else if status < 400 {
            stats.status[3] += 1;
            stream.status_success = 1;
        } else if status < 600 {
            stats.status[(status / 100) as usize] += 1;
            stream.status_success = 0;
        } else {
            stream.status_success = 0;
        }
    }

    fn on_sofarpc_status(&mut self, stream_id: u32, status: u16) {
        let phase = self.w.phase.get();
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if phase != Phase::MainDuration {
            stream.status_success = 1;
            return;
        }

        stream.req_stat.status = status;
        stream.status_success = i8::from(status == bolt::RESPONSE_STATUS_SUCCESS);

        if (status as usize) < bolt::STATUS_BUCKETS {
            self.w.stats.borrow_mut().sofarpc_status[status as usize] += 1;
        }
    }

    fn on_stream_close(&mut self, stream_id: u32, success: bool, last: bool) -> Result<()> {
        if self.w.phase.get() == Phase::MainDuration {
            if self.shared.req_inflight.get() > 0 {
                self.shared.req_inflight.set(self.shared.req_inflight.get() - 1);
            }
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                return Ok(());
            };

            let now = StdInstant::now();
            stream.req_stat.stream_close_time = Some(now);
            {
                let mut stats = self.w.stats.borrow_mut();
                if success {
                    stream.req_stat.completed = true;
                    stats.req_success += 1;
                    self.shared.cstat.borrow_mut().req_success += 1;

                    if stream.status_success == 1 {
                        stats.req_status_success += 1;
                    } else {
                        stats.req_failed += 1;
                    }

                    stats.req_stats.push(stream.req_stat.clone());
                } else {
                    stats.req_failed += 1;
                    stats.req_error += 1;
                }
                stats.req_done += 1;
            }
            self.shared.req_done.set(self.shared.req_done.get() + 1);

            let rtt = now.duration_since(stream.req_stat.request_time).as_micros() as u64;
            self.w.record_rtt(rtt);
        }

        self.streams.remove(&stream_id);

        if self.w.counters.is_exhausted() {
            self.terminate_session();
            return Ok(());
        }

        if !last {
            if let Submit::Exhausted = self.submit_request()? {
                self.process_request_failure();
            }
        }

        Ok(())
    }

    fn terminate_session(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.terminate();
        }
    }

    /// After a read-side failure: reconnect to the same address when the
    /// session asked for a fresh connection and requests remain,
    /// otherwise fail for good.
    fn try_again_or_fail(&mut self) -> Serve {
        self.disconnect();

        if self.new_connection_requested {
            self.new_connection_requested = false;

            if !self.w.counters.is_exhausted() {
                if self.w.phase.get() == Phase::MainDuration {
                    // Requests in flight cannot be restarted; fail them.
                    let n = self.shared.req_inflight.get();
                    let mut stats = self.w.stats.borrow_mut();
                    stats.req_failed += n;
                    stats.req_error += n;
                    drop(stats);
                    self.shared.req_inflight.set(0);
                }
                return Serve::Reconnect;
            }
        }

        self.process_abandoned_streams();
        Serve::Stop
    }

    fn fail(&mut self) {
        self.disconnect();
        self.process_abandoned_streams();
    }

    fn disconnect(&mut self) {
        self.shared.record_client_end_time();

        self.inactivity_deadline = None;
        self.active_deadline = None;
        self.next_request_at = None;
        self.pending_submits = 0;
        self.streams.clear();
        self.session = None;
        self.events.clear();
        self.wb.clear();
        self.state = ClientState::Idle;

        if let Some(mut conn) = self.tls.take() {
            conn.send_close_notify();
            if let Some(sock) = &self.sock {
                while conn.wants_write() {
                    if conn.write_tls(&mut SockWriter(sock)).is_err() {
                        break;
                    }
                }
            }
        }
        if let Some(sock) = self.sock.take() {
            sock.shutdown_write();
        }
    }

    fn process_timedout_streams(&mut self) {
        if self.w.phase.get() != Phase::MainDuration {
            return;
        }

        let now = StdInstant::now();
        for stream in self.streams.values_mut() {
            if !stream.req_stat.completed {
                stream.req_stat.stream_close_time = Some(now);
            }
        }
        self.w.stats.borrow_mut().req_timedout += self.shared.req_inflight.get();

        self.process_abandoned_streams();
    }

    fn process_abandoned_streams(&mut self) {
        if self.w.phase.get() != Phase::MainDuration {
            return;
        }

        let n = self.shared.req_inflight.get();
        let mut stats = self.w.stats.borrow_mut();
        stats.req_failed += n;
        stats.req_error += n;
        drop(stats);
        self.shared.req_inflight.set(0);
    }

    fn restart_inactivity_timer(&mut self) {
        if let Some(t) = self.w.cfg.conn_inactivity_timeout {
            self.inactivity_deadline = Some(Instant::now() + t);
        }
    }

    fn report_tls_info(&self) {
        if self.w.id != 0 || self.w.tls_info_report_done.get() {
            return;
        }
        self.w.tls_info_report_done.set(true);

        if let Some(conn) = &self.tls {
            let version = conn
                .protocol_version()
                .map(|v| format!("{v:?}"))
                .unwrap_or_else(|| "unknown".to_string());
            let cipher = conn
                .negotiated_cipher_suite()
                .map(|c| format!("{:?}", c.suite()))
                .unwrap_or_else(|| "unknown".to_string());
            println!("TLS Protocol: {version}\nCipher: {cipher}");
        }
    }

    fn report_app_info(&self, proto: &str) {
        if self.w.id != 0 || self.w.app_info_report_done.get() {
            return;
        }
        self.w.app_info_report_done.set(true);
        println!("Application protocol: {proto}");
    }
}
