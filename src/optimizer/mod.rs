// Optimizer module - shared search state and the parallel driver
//
// The search runs on plain OS threads. Every worker owns its evaluator and
// synchronises with the rest of the system only to run the acceptance rule
// and publish improvements; everything protected by the one global mutex
// is O(history length) at worst. A few atomics mirror hot values so
// workers can pre-check without taking the lock.

pub mod acceptance;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::line::SpriteRowBits;
use crate::config::{ConfigError, OptimizerConfig};
use crate::dual::{DualFrameState, DualPhase, FixedFrames};
use crate::emulator::{EvalContext, Evaluator};
use crate::mutation::MUTATION_COUNT;
use crate::palette::MAX_COLOR_DISTANCE;
use crate::program::RasterPicture;
use crate::rng::SEED_STRIDE;
use crate::stats::{normalize_score, StatPoint, StatisticsList};
use crate::target::MAX_HEIGHT;

pub use acceptance::{AcceptanceMode, AcceptanceState, Outcome};

/// Everything the workers share under the global mutex.
pub struct GlobalState {
    pub initialized: bool,
    pub update_initialized: bool,
    pub update_improvement: bool,
    pub update_autosave: bool,
    pub finished: bool,
    pub threads_active: usize,

    pub evaluations: u64,
    pub last_best_evaluation: u64,

    pub best_pic: RasterPicture,
    pub best_cost: f64,

    /// Painted rows and sprite memory of the best solution, for
    /// visualisation and export.
    pub painted: Vec<Vec<u8>>,
    pub painted_targets: Vec<Vec<u8>>,
    pub sprites: Vec<SpriteRowBits>,

    pub mutation_stats: [u64; MUTATION_COUNT],
    pub acceptance: AcceptanceState,
    pub statistics: StatisticsList,

    /// Frame B state, present only in dual-frame runs.
    pub dual: Option<DualFrameState>,
}

impl GlobalState {
    fn new(cfg: &OptimizerConfig, height: usize, width: usize) -> GlobalState {
        let drift_scale = width as f64 * height as f64 * (MAX_COLOR_DISTANCE / 10_000.0);
        GlobalState {
            initialized: false,
            update_initialized: false,
            update_improvement: false,
            update_autosave: false,
            finished: false,
            threads_active: 0,
            evaluations: 0,
            last_best_evaluation: 0,
            best_pic: RasterPicture::new(height),
            best_cost: f64::MAX,
            painted: vec![vec![0; width]; height],
            painted_targets: vec![vec![0; width]; height],
            sprites: vec![[[false; 8]; 4]; height],
            mutation_stats: [0; MUTATION_COUNT],
            acceptance: AcceptanceState::new(
                cfg.optimizer,
                cfg.solutions,
                cfg.unstuck_after,
                cfg.unstuck_drift_norm,
                drift_scale,
            ),
            statistics: Vec::new(),
            dual: None,
        }
    }
}

/// Shared handle between the driver and the workers.
pub struct SharedState {
    pub state: Mutex<GlobalState>,
    pub update: Condvar,
    /// Serialises expensive per-worker cache clears.
    pub cache_clear: Mutex<()>,

    // Mirrors of lock-protected values for lock-free pre-checks.
    pub finished: AtomicBool,
    pub evaluations: AtomicU64,
    pub last_best_evaluation: AtomicU64,
    best_cost_bits: AtomicU64,

    pub start_time: Instant,
    pub save_period: i64,
    pub max_evals: u64,

    // Dual-frame coordination (idle in single-frame runs).
    pub gen_a: AtomicU64,
    pub gen_b: AtomicU64,
    pub focus_b: AtomicBool,
    pub stage_counter: AtomicU64,
    pub dual_phase: AtomicU8,
    pub fixed_frames: FixedFrames,
}

impl SharedState {
    pub fn new(cfg: &OptimizerConfig, height: usize, width: usize) -> SharedState {
        SharedState {
            state: Mutex::new(GlobalState::new(cfg, height, width)),
            update: Condvar::new(),
            cache_clear: Mutex::new(()),
            finished: AtomicBool::new(false),
            evaluations: AtomicU64::new(0),
            last_best_evaluation: AtomicU64::new(0),
            best_cost_bits: AtomicU64::new(f64::MAX.to_bits()),
            start_time: Instant::now(),
            save_period: cfg.save_period,
            max_evals: cfg.max_evals,
            gen_a: AtomicU64::new(0),
            gen_b: AtomicU64::new(0),
            focus_b: AtomicBool::new(false),
            stage_counter: AtomicU64::new(0),
            dual_phase: AtomicU8::new(DualPhase::Single as u8),
            fixed_frames: FixedFrames::new(),
        }
    }

    /// Best cost mirror; safe to read without the lock.
    #[inline]
    pub fn best_cost(&self) -> f64 {
        f64::from_bits(self.best_cost_bits.load(Ordering::Relaxed))
    }

    /// Update the mirror; call while holding the state lock.
    #[inline]
    pub fn set_best_cost(&self, cost: f64) {
        self.best_cost_bits.store(cost.to_bits(), Ordering::Relaxed);
    }

    /// Current dual phase.
    #[inline]
    pub fn phase(&self) -> DualPhase {
        DualPhase::from_u8(self.dual_phase.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_phase(&self, phase: DualPhase) {
        self.dual_phase.store(phase as u8, Ordering::Relaxed);
    }

    /// Request termination; workers observe and exit.
    pub fn request_stop(&self) {
        self.finished.store(true, Ordering::Relaxed);
        let mut gs = self.state.lock().unwrap();
        gs.finished = true;
        self.update.notify_all();
    }
}

/// Event returned from [`Optimizer::wait_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// First evaluation done; acceptance history seeded.
    Initialized,
    /// A new global best was published.
    Improved,
    /// The autosave period elapsed.
    Autosave,
    /// The run reached a steady finished state.
    Finished,
    /// Timeout with nothing new.
    Tick,
}

/// Snapshot of the best solution and the run counters.
#[derive(Clone)]
pub struct BestSnapshot {
    pub picture: RasterPicture,
    pub cost: f64,
    pub normalized_cost: f64,
    pub evaluations: u64,
    pub last_best_evaluation: u64,
    pub painted: Vec<Vec<u8>>,
    pub painted_targets: Vec<Vec<u8>>,
    pub sprites: Vec<SpriteRowBits>,
    pub mutation_stats: [u64; MUTATION_COUNT],
    pub statistics: StatisticsList,
}

/// Parallel single-frame optimiser driver.
pub struct Optimizer {
    ctx: Arc<EvalContext>,
    shared: Arc<SharedState>,
    cfg: OptimizerConfig,
    handles: Vec<JoinHandle<()>>,
}

impl Optimizer {
    /// Validate the configuration and target dimensions and build the
    /// shared state. Workers are not spawned until [`Optimizer::start`].
    pub fn new(ctx: EvalContext, cfg: OptimizerConfig) -> Result<Optimizer, ConfigError> {
        cfg.validate()?;
        let height = ctx.target.height();
        let width = ctx.target.width();
        if height == 0 || height > MAX_HEIGHT {
            return Err(ConfigError::BadHeight(height));
        }
        if width == 0 {
            return Err(ConfigError::BadWidth);
        }

        let shared = Arc::new(SharedState::new(&cfg, height, width));
        Ok(Optimizer {
            ctx: Arc::new(ctx),
            shared,
            cfg,
            handles: Vec::new(),
        })
    }

    pub fn context(&self) -> &Arc<EvalContext> {
        &self.ctx
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.cfg
    }

    /// Install the starting program and spawn the worker threads.
    pub fn start(&mut self, initial: RasterPicture) {
        {
            let mut gs = self.shared.state.lock().unwrap();
            gs.best_pic = initial;
            gs.best_pic.uncache_all();
            gs.threads_active = self.cfg.threads;
        }

        for k in 0..self.cfg.threads {
            let seed = self.cfg.initial_seed.wrapping_add(k as u64 * SEED_STRIDE);
            let ev = Evaluator::new(
                k,
                seed,
                self.cfg.cache_size,
                Arc::clone(&self.ctx),
                Arc::clone(&self.shared),
            );
            self.handles.push(std::thread::spawn(move || {
                worker::run_worker(ev);
            }));
        }
    }

    /// Block until something happens or `timeout` elapses.
    pub fn wait_update(&self, timeout: Duration) -> Update {
        wait_update_shared(&self.shared, timeout)
    }

    /// Ask the workers to stop.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Join every worker thread.
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Run to the finished state, blocking the caller.
    pub fn run(&mut self, initial: RasterPicture) {
        self.start(initial);
        loop {
            if self.wait_update(Duration::from_millis(200)) == Update::Finished {
                break;
            }
        }
        self.join();
    }

    /// Copy out the best solution and counters.
    pub fn snapshot(&self) -> BestSnapshot {
        snapshot_shared(
            &self.shared,
            self.ctx.target.width(),
            self.ctx.target.height(),
        )
    }

    /// Statistics samples collected so far.
    pub fn statistics(&self) -> Vec<StatPoint> {
        self.shared.state.lock().unwrap().statistics.clone()
    }
}

/// Event wait shared by the single and dual drivers.
pub(crate) fn wait_update_shared(shared: &SharedState, timeout: Duration) -> Update {
    let mut gs = shared.state.lock().unwrap();
    let deadline = Instant::now() + timeout;
    loop {
        if gs.finished && gs.threads_active == 0 {
            return Update::Finished;
        }
        if gs.update_improvement {
            gs.update_improvement = false;
            return Update::Improved;
        }
        if gs.update_autosave {
            gs.update_autosave = false;
            return Update::Autosave;
        }
        if gs.update_initialized {
            gs.update_initialized = false;
            return Update::Initialized;
        }

        let now = Instant::now();
        if now >= deadline {
            return Update::Tick;
        }
        let (guard, _res) = shared.update.wait_timeout(gs, deadline - now).unwrap();
        gs = guard;
    }
}

/// Best-solution snapshot shared by the single and dual drivers.
pub(crate) fn snapshot_shared(shared: &SharedState, width: usize, height: usize) -> BestSnapshot {
    let gs = shared.state.lock().unwrap();
    BestSnapshot {
        picture: gs.best_pic.clone(),
        cost: gs.best_cost,
        normalized_cost: normalize_score(gs.best_cost, width, height),
        evaluations: gs.evaluations,
        last_best_evaluation: gs.last_best_evaluation,
        painted: gs.painted.clone(),
        painted_targets: gs.painted_targets.clone(),
        sprites: gs.sprites.clone(),
        mutation_stats: gs.mutation_stats,
        statistics: gs.statistics.clone(),
    }
}
