//! Worker: one OS thread running a single-threaded cooperative loop over
//! a set of clients, plus the warm-up/duration timers and the QPS ticker.

use core::cell::{Cell, RefCell};
use std::{rc::Rc, sync::Arc};

use anyhow::{anyhow, Result};
use tokio::{
    runtime::Builder,
    sync::Notify,
    task::{spawn_local, JoinHandle, LocalSet},
    time,
};

use crate::{
    cfg::Config,
    client::{Client, ClientShared},
    pacing::{QpsGate, RequestCounter, QPS_UPDATE_PERIOD},
    stat::Stats,
};

/// Coarse worker lifecycle; statistics are recorded only in
/// [`Phase::MainDuration`]. Progression is monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InitialIdle,
    WarmUp,
    MainDuration,
    DurationOver,
}

/// Single-shot, single-thread shutdown flag with wakeup.
#[derive(Debug, Default)]
pub struct Shutdown {
    fired: Cell<bool>,
    notify: Notify,
}

impl Shutdown {
    pub fn fire(&self) {
        self.fired.set(true);
        self.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.get()
    }

    pub async fn wait(&self) {
        loop {
            if self.fired.get() {
                return;
            }
            let notified = self.notify.notified();
            if self.fired.get() {
                return;
            }
            notified.await;
        }
    }
}

/// One-way latch: fires once, wakes all waiters.
#[derive(Debug, Default)]
struct Latch {
    set: Cell<bool>,
    notify: Notify,
}

impl Latch {
    fn fire(&self) {
        if !self.set.replace(true) {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            if self.set.get() {
                return;
            }
            let notified = self.notify.notified();
            if self.set.get() {
                return;
            }
            notified.await;
        }
    }
}

/// Worker state shared between the client tasks and the timer tasks.
/// Everything lives on one thread; interior mutability is cells.
#[derive(Debug)]
pub struct WorkerCtx {
    pub cfg: Arc<Config>,
    pub id: u32,
    pub counters: Arc<RequestCounter>,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub phase: Cell<Phase>,
    pub stats: RefCell<Stats>,
    pub qps: QpsGate,
    pub shutdown: Shutdown,
    pub tls_info_report_done: Cell<bool>,
    pub app_info_report_done: Cell<bool>,
    rtts: RefCell<Vec<u64>>,
    rtt_min: Cell<u64>,
    rtt_max: Cell<u64>,
    clients: RefCell<Vec<Rc<ClientShared>>>,
    warmup_kick: Latch,
    main_started: Latch,
    nconns_made: Cell<u64>,
    next_client_id: Cell<u32>,
}

impl WorkerCtx {
    pub fn record_rtt(&self, rtt_us: u64) {
        self.rtts.borrow_mut().push(rtt_us);
        self.rtt_min.set(self.rtt_min.get().min(rtt_us));
        self.rtt_max.set(self.rtt_max.get().max(rtt_us));
    }

    /// Takes a finished client's stat record into the worker stats.
    pub fn absorb_client(&self, shared: &ClientShared) {
        if let Some(cstat) = shared.take_stat() {
            self.stats.borrow_mut().client_stats.push(cstat);
        }
    }

    /// First connection initiation starts the warm-up timer.
    pub fn kick_warmup(&self) {
        self.warmup_kick.fire();
    }
}

#[derive(Debug)]
pub struct WorkerOutput {
    pub stats: Stats,
    pub rtts: Vec<u64>,
    pub rtt_min: u64,
    pub rtt_max: u64,
}

#[derive(Debug)]
pub struct Worker {
    id: u32,
    cfg: Arc<Config>,
    counters: Arc<RequestCounter>,
    tls: Option<Arc<rustls::ClientConfig>>,
    /// This worker's share of the client count.
    nclients: u64,
    /// This worker's share of the connection rate.
    rate: u64,
    /// This worker's randomized 5ms QPS slots; empty outside QPS mode.
    qps_counts: Vec<u64>,
}

impl Worker {
    pub fn new(
        id: u32,
        cfg: Arc<Config>,
        counters: Arc<RequestCounter>,
        tls: Option<Arc<rustls::ClientConfig>>,
        nclients: u64,
        rate: u64,
        qps_counts: Vec<u64>,
    ) -> Self {
        Self {
            id,
            cfg,
            counters,
            tls,
            nclients,
            rate,
            qps_counts,
        }
    }

    pub fn run(self) -> Result<WorkerOutput> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let local = LocalSet::new();

        local.block_on(&runtime, self.run_inner())
    }

    async fn run_inner(self) -> Result<WorkerOutput> {
        let initial_phase = if self.cfg.is_timing_based_mode() {
            Phase::InitialIdle
        } else {
            Phase::MainDuration
        };

        let ctx = Rc::new(WorkerCtx {
            cfg: self.cfg.clone(),
            id: self.id,
            counters: self.counters.clone(),
            tls: self.tls.clone(),
            phase: Cell::new(initial_phase),
            stats: RefCell::new(Stats::default()),
            qps: QpsGate::new(self.qps_counts.clone()),
            shutdown: Shutdown::default(),
            tls_info_report_done: Cell::new(false),
            app_info_report_done: Cell::new(false),
            rtts: RefCell::new(Vec::new()),
            rtt_min: Cell::new(u64::MAX),
            rtt_max: Cell::new(u64::MIN),
            clients: RefCell::new(Vec::new()),
            warmup_kick: Latch::default(),
            main_started: Latch::default(),
            nconns_made: Cell::new(0),
            next_client_id: Cell::new(0),
        });

        if self.nclients == 0 {
            return Ok(Self::output_of(ctx)?);
        }

        let mut aux: Vec<JoinHandle<()>> = Vec::new();
        if self.cfg.is_timing_based_mode() {
            aux.push(spawn_local(phase_timer(ctx.clone())));
        }
        if self.cfg.is_qps_mode() {
            aux.push(spawn_local(qps_ticker(ctx.clone())));
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if self.cfg.is_rate_mode() {
            let mut interval = time::interval(self.cfg.rate_period);
            while ctx.nconns_made.get() < self.nclients {
                tokio::select! {
                    biased;
                    _ = ctx.shutdown.wait() => break,
                    _ = interval.tick() => {
                        let batch = self.rate.min(self.nclients - ctx.nconns_made.get());
                        for _ in 0..batch {
                            tasks.push(spawn_client(&ctx));
                        }
                    }
                }
            }
        } else {
            for _ in 0..self.nclients {
                tasks.push(spawn_client(&ctx));
            }
        }

        for task in tasks {
            task.await.expect("no self join");
        }
        // In count mode the run ends when the clients drain; in
        // timing-based modes the phase timer decides.
        for task in aux {
            task.await.expect("no self join");
        }

        Self::output_of(ctx)
    }

    fn output_of(ctx: Rc<WorkerCtx>) -> Result<WorkerOutput> {
        let ctx = Rc::try_unwrap(ctx).map_err(|_| anyhow!("worker context still shared"))?;

        Ok(WorkerOutput {
            stats: ctx.stats.into_inner(),
            rtts: ctx.rtts.into_inner(),
            rtt_min: ctx.rtt_min.get(),
            rtt_max: ctx.rtt_max.get(),
        })
    }
}

fn spawn_client(ctx: &Rc<WorkerCtx>) -> JoinHandle<()> {
    let id = ctx.next_client_id.get();
    ctx.next_client_id.set(id + 1);
    ctx.nconns_made.set(ctx.nconns_made.get() + 1);

    let shared = Rc::new(ClientShared::new());
    ctx.clients.borrow_mut().push(shared.clone());

    let client = Client::new(id, ctx.clone(), shared);
    spawn_local(client.run())
}

/// Warm-up and main-duration timers.
///
/// The warm-up timer starts at the first connection initiation. When it
/// fires, nothing may have been recorded yet; the clients' connect times
/// are re-based so the measured phase starts from a clean slate.
async fn phase_timer(ctx: Rc<WorkerCtx>) {
    tokio::select! {
        biased;
        _ = ctx.shutdown.wait() => return,
        _ = ctx.warmup_kick.wait() => {}
    }
    tokio::select! {
        biased;
        _ = ctx.shutdown.wait() => return,
        _ = time::sleep(ctx.cfg.warm_up_time) => {}
    }

    {
        let stats = ctx.stats.borrow();
        debug_assert_eq!(stats.req_started, 0);
        debug_assert_eq!(stats.req_done, 0);
    }
    for client in ctx.clients.borrow().iter() {
        debug_assert_eq!(client.req_inflight.get(), 0);
        debug_assert_eq!(client.req_started.get(), 0);
        debug_assert_eq!(client.req_done.get(), 0);

        client.record_client_start_time();
        client.clear_connect_times();
        client.record_connect_start_time();
    }

    ctx.phase.set(Phase::MainDuration);
    ctx.main_started.fire();

    tokio::select! {
        biased;
        _ = ctx.shutdown.wait() => return,
        _ = time::sleep(ctx.cfg.duration) => {}
    }

    // Duration is over: cancel the whole workload and stop every client.
    ctx.counters.exhaust();
    ctx.phase.set(Phase::DurationOver);
    ctx.shutdown.fire();
}

/// Refills the QPS budget every 5ms once the measured phase starts.
async fn qps_ticker(ctx: Rc<WorkerCtx>) {
    tokio::select! {
        biased;
        _ = ctx.shutdown.wait() => return,
        _ = ctx.main_started.wait() => {}
    }

    let mut interval = time::interval(QPS_UPDATE_PERIOD);
    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.wait() => return,
            _ = interval.tick() => ctx.qps.tick(),
        }
    }
}
