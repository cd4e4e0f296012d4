// Dual module - two-frame blended optimisation
//
// Two programs A and B are optimised so that their per-pixel YUV blend
// matches the target, with a penalty on the temporal difference between
// them (visible flicker). One frame is always frozen: its painted rows
// feed the other frame's register selection. The coordinator bootstraps
// each frame alone with the single-frame objective, then alternates focus
// between them on a fixed evaluation cadence.

pub mod tables;

pub use tables::DualTables;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info};

use crate::cache::line::SpriteRowBits;
use crate::config::{ConfigError, DualInit, OptimizerConfig};
use crate::emulator::{EvalContext, Evaluator};
use crate::optimizer::{self, BestSnapshot, SharedState, Update};
use crate::program::generator;
use crate::program::RasterPicture;
use crate::rng::{XorShift, SEED_STRIDE};
use crate::stats::{StatPoint, STATISTICS_PERIOD};
use crate::target::MAX_HEIGHT;

/// Phase of a dual-frame run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DualPhase {
    /// Not a dual run.
    Single = 0,
    /// Frame A optimised alone against the single-frame objective.
    BootstrapA = 1,
    /// Frame B prepared (copied or bootstrapped alone).
    BootstrapB = 2,
    /// Focus alternates between frames under the blended objective.
    Alternating = 3,
}

impl DualPhase {
    pub fn from_u8(v: u8) -> DualPhase {
        match v {
            1 => DualPhase::BootstrapA,
            2 => DualPhase::BootstrapB,
            3 => DualPhase::Alternating,
            _ => DualPhase::Single,
        }
    }
}

/// Double-buffered snapshot of the frozen frame's painted rows.
///
/// Writers fill the inactive slot and release-store the active index;
/// readers acquire-load the index and clone the slot's `Arc`, which keeps
/// the snapshot alive for the whole evaluation even across a concurrent
/// publish.
pub struct FixedFrames {
    slots: [Mutex<Arc<Vec<Vec<u8>>>>; 2],
    active: AtomicUsize,
}

impl FixedFrames {
    pub fn new() -> FixedFrames {
        FixedFrames {
            slots: [
                Mutex::new(Arc::new(Vec::new())),
                Mutex::new(Arc::new(Vec::new())),
            ],
            active: AtomicUsize::new(0),
        }
    }

    /// The currently published rows. May be empty before the first
    /// publish; callers fall back to zero rows.
    pub fn snapshot(&self) -> Arc<Vec<Vec<u8>>> {
        let idx = self.active.load(Ordering::Acquire);
        self.slots[idx].lock().unwrap().clone()
    }

    /// Publish a new frozen frame, flipping the active slot.
    pub fn publish(&self, rows: Vec<Vec<u8>>) {
        let next = 1 - self.active.load(Ordering::Acquire);
        *self.slots[next].lock().unwrap() = Arc::new(rows);
        self.active.store(next, Ordering::Release);
    }
}

impl Default for FixedFrames {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame B's best solution, guarded by the global mutex alongside A's.
pub struct DualFrameState {
    pub best_pic_b: RasterPicture,
    pub best_cost_b: f64,
    pub painted_b: Vec<Vec<u8>>,
    pub painted_targets_b: Vec<Vec<u8>>,
    pub sprites_b: Vec<SpriteRowBits>,
}

impl DualFrameState {
    pub fn new(width: usize, height: usize) -> DualFrameState {
        DualFrameState {
            best_pic_b: RasterPicture::new(height),
            best_cost_b: f64::MAX,
            painted_b: vec![vec![0; width]; height],
            painted_targets_b: vec![vec![0; width]; height],
            sprites_b: vec![[[false; 8]; 4]; height],
        }
    }
}

/// Dual-frame optimiser driver. Same outer surface as the single-frame
/// [`crate::optimizer::Optimizer`], plus access to frame B.
pub struct DualOptimizer {
    ctx: Arc<EvalContext>,
    shared: Arc<SharedState>,
    cfg: OptimizerConfig,
    tables: Arc<DualTables>,
    coordinator: Option<JoinHandle<()>>,
}

impl DualOptimizer {
    pub fn new(ctx: EvalContext, cfg: OptimizerConfig) -> Result<DualOptimizer, ConfigError> {
        cfg.validate()?;
        let height = ctx.target.height();
        let width = ctx.target.width();
        if height == 0 || height > MAX_HEIGHT {
            return Err(ConfigError::BadHeight(height));
        }
        if width == 0 {
            return Err(ConfigError::BadWidth);
        }

        let tables = Arc::new(DualTables::new(
            &ctx.palette,
            ctx.target.pixels(),
            cfg.flicker_luma_tol,
            cfg.flicker_chroma_tol,
        ));
        let shared = Arc::new(SharedState::new(&cfg, height, width));
        {
            let mut gs = shared.state.lock().unwrap();
            gs.dual = Some(DualFrameState::new(width, height));
        }

        Ok(DualOptimizer {
            ctx: Arc::new(ctx),
            shared,
            cfg,
            tables,
            coordinator: None,
        })
    }

    pub fn context(&self) -> &Arc<EvalContext> {
        &self.ctx
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn tables(&self) -> &Arc<DualTables> {
        &self.tables
    }

    pub fn phase(&self) -> DualPhase {
        self.shared.phase()
    }

    /// Install frame A's starting program and spawn the coordinator.
    pub fn start(&mut self, initial: RasterPicture) {
        {
            let mut gs = self.shared.state.lock().unwrap();
            gs.best_pic = initial;
            gs.best_pic.uncache_all();
            gs.threads_active = 1;
        }

        let ctx = Arc::clone(&self.ctx);
        let shared = Arc::clone(&self.shared);
        let tables = Arc::clone(&self.tables);
        let cfg = self.cfg.clone();
        self.coordinator = Some(std::thread::spawn(move || {
            coordinate(ctx, shared, cfg, tables);
        }));
    }

    pub fn wait_update(&self, timeout: Duration) -> Update {
        optimizer::wait_update_shared(&self.shared, timeout)
    }

    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.coordinator.take() {
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

    /// Frame A snapshot (the shared best).
    pub fn snapshot(&self) -> BestSnapshot {
        optimizer::snapshot_shared(
            &self.shared,
            self.ctx.target.width(),
            self.ctx.target.height(),
        )
    }

    /// Frame B snapshot: program, painted rows, register rows, sprites.
    pub fn snapshot_b(&self) -> Option<(RasterPicture, Vec<Vec<u8>>, Vec<Vec<u8>>, Vec<SpriteRowBits>)> {
        let gs = self.shared.state.lock().unwrap();
        gs.dual.as_ref().map(|d| {
            (
                d.best_pic_b.clone(),
                d.painted_b.clone(),
                d.painted_targets_b.clone(),
                d.sprites_b.clone(),
            )
        })
    }

    /// Blend frame A's and B's painted rows into preview RGB rows.
    pub fn blended_preview(&self) -> Vec<Vec<crate::palette::Rgb>> {
        let gs = self.shared.state.lock().unwrap();
        let empty = Vec::new();
        let painted_b = gs.dual.as_ref().map(|d| &d.painted_b).unwrap_or(&empty);
        gs.painted
            .iter()
            .enumerate()
            .map(|(y, row_a)| {
                row_a
                    .iter()
                    .enumerate()
                    .map(|(x, &a)| {
                        let b = painted_b
                            .get(y)
                            .and_then(|r| r.get(x))
                            .copied()
                            .unwrap_or(0);
                        self.tables.blended_rgb(a, b)
                    })
                    .collect()
            })
            .collect()
    }
}

/// Which frame a bootstrap loop is optimising.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Frame {
    A,
    B,
}

/// Coordinator body: bootstrap A, prepare B, then alternate.
fn coordinate(
    ctx: Arc<EvalContext>,
    shared: Arc<SharedState>,
    cfg: OptimizerConfig,
    tables: Arc<DualTables>,
) {
    let threads = cfg.threads.max(1);
    let height = ctx.target.height();

    let mut evaluators: Vec<Evaluator> = (0..threads)
        .map(|k| {
            let seed = cfg.initial_seed.wrapping_add(k as u64 * SEED_STRIDE);
            let mut ev = Evaluator::new(
                k,
                seed,
                cfg.cache_size,
                Arc::clone(&ctx),
                Arc::clone(&shared),
            );
            ev.set_dual_tables(Arc::clone(&tables));
            ev
        })
        .collect();

    // Auxiliary evaluator for the coordinator's own scoring passes.
    let mut aux = Evaluator::new(
        threads,
        cfg.initial_seed.wrapping_add(101),
        cfg.cache_size,
        Arc::clone(&ctx),
        Arc::clone(&shared),
    );

    // ---- Bootstrap A ----
    shared.set_phase(DualPhase::BootstrapA);
    info!("dual: bootstrapping frame A for {} evaluations", cfg.first_dual_steps);

    let mut best_a = {
        let gs = shared.state.lock().unwrap();
        gs.best_pic.clone()
    };
    let cost_a = aux.execute(&mut best_a);
    {
        let mut gs = shared.state.lock().unwrap();
        gs.best_cost = cost_a;
        shared.set_best_cost(cost_a);
        gs.best_pic = best_a.clone();
        gs.best_pic.uncache_all();
        for y in 0..height {
            gs.painted[y].copy_from_slice(&aux.painted()[y]);
            gs.painted_targets[y].copy_from_slice(&aux.painted_targets()[y]);
        }
        gs.sprites.copy_from_slice(aux.sprites());
        if gs.last_best_evaluation == 0 {
            gs.last_best_evaluation = gs.evaluations;
        }
        gs.acceptance.seed(cost_a);
        gs.initialized = true;
        gs.update_initialized = true;
        shared.update.notify_all();
    }

    let target_a = shared.evaluations.load(Ordering::Relaxed) + cfg.first_dual_steps;
    std::thread::scope(|s| {
        for ev in evaluators.iter_mut() {
            s.spawn(move || bootstrap_worker(ev, target_a, Frame::A));
        }
    });
    if shared.finished.load(Ordering::Relaxed) {
        finish(&shared);
        return;
    }

    // ---- Bootstrap B ----
    shared.set_phase(DualPhase::BootstrapB);
    match cfg.after_dual_steps {
        DualInit::Copy => {
            info!("dual: copying frame A into frame B");
            let mut gs = shared.state.lock().unwrap();
            let best_pic = gs.best_pic.clone();
            let best_cost = gs.best_cost;
            let painted = gs.painted.clone();
            let painted_targets = gs.painted_targets.clone();
            let sprites = gs.sprites.clone();
            if let Some(d) = gs.dual.as_mut() {
                d.best_pic_b = best_pic;
                d.best_cost_b = best_cost;
                d.painted_b = painted;
                d.painted_targets_b = painted_targets;
                d.sprites_b = sprites;
            }
            drop(gs);
            shared.gen_b.fetch_add(1, Ordering::AcqRel);
        }
        DualInit::Fresh => {
            info!("dual: bootstrapping a fresh frame B for {} evaluations", cfg.first_dual_steps);
            let mut rng = XorShift::new(cfg.initial_seed.wrapping_add(777));
            let mut pic_b = generator::random_picture(&ctx.target, &mut rng);
            let cost_b = aux.execute(&mut pic_b);
            {
                let mut gs = shared.state.lock().unwrap();
                if let Some(d) = gs.dual.as_mut() {
                    d.best_pic_b = pic_b.clone();
                    d.best_pic_b.uncache_all();
                    d.best_cost_b = cost_b;
                    for y in 0..height {
                        d.painted_b[y].copy_from_slice(&aux.painted()[y]);
                        d.painted_targets_b[y].copy_from_slice(&aux.painted_targets()[y]);
                    }
                    d.sprites_b.copy_from_slice(aux.sprites());
                }
                // B starts its own walk: reset the history to B's cost.
                gs.acceptance.seed(cost_b);
            }
            shared.gen_b.fetch_add(1, Ordering::AcqRel);

            let target_b = shared.evaluations.load(Ordering::Relaxed) + cfg.first_dual_steps;
            std::thread::scope(|s| {
                for ev in evaluators.iter_mut() {
                    s.spawn(move || bootstrap_worker(ev, target_b, Frame::B));
                }
            });
            if shared.finished.load(Ordering::Relaxed) {
                finish(&shared);
                return;
            }
        }
    }

    // ---- Alternating ----
    // Bootstrap scored against the palette-quantised single-frame
    // objective; alternation scores blended pairs. The scales are not
    // comparable, so every cache is dropped and the acceptance history is
    // reseeded from a dual baseline.

    // Pass 1: refresh B's painted rows under the dual objective, A fixed.
    let fixed_a = {
        let gs = shared.state.lock().unwrap();
        gs.painted.clone()
    };
    let mut pic_b = {
        let gs = shared.state.lock().unwrap();
        gs.dual
            .as_ref()
            .map(|d| d.best_pic_b.clone())
            .unwrap_or_else(|| gs.best_pic.clone())
    };
    pic_b.uncache_all();
    aux.clear_all_caches();
    let _ = aux.execute_dual(&mut pic_b, &tables, &fixed_a, true);
    {
        let mut gs = shared.state.lock().unwrap();
        if let Some(d) = gs.dual.as_mut() {
            for y in 0..height {
                d.painted_b[y].copy_from_slice(&aux.painted()[y]);
                d.painted_targets_b[y].copy_from_slice(&aux.painted_targets()[y]);
            }
            d.sprites_b.copy_from_slice(aux.sprites());
        }
    }

    // Pass 2: frame A against fixed B gives the alternating baseline.
    let fixed_b = {
        let gs = shared.state.lock().unwrap();
        gs.dual
            .as_ref()
            .map(|d| d.painted_b.clone())
            .unwrap_or_default()
    };
    let mut pic_a = {
        let gs = shared.state.lock().unwrap();
        gs.best_pic.clone()
    };
    pic_a.uncache_all();
    aux.clear_all_caches();
    let baseline = aux.execute_dual(&mut pic_a, &tables, &fixed_b, false);
    {
        let mut gs = shared.state.lock().unwrap();
        gs.best_pic = pic_a.clone();
        gs.best_pic.uncache_all();
        gs.best_cost = baseline;
        shared.set_best_cost(baseline);
        gs.acceptance.seed(baseline);
        gs.last_best_evaluation = gs.evaluations;
        shared
            .last_best_evaluation
            .store(gs.evaluations, Ordering::Relaxed);
        for y in 0..height {
            gs.painted[y].copy_from_slice(&aux.painted()[y]);
            gs.painted_targets[y].copy_from_slice(&aux.painted_targets()[y]);
        }
        gs.sprites.copy_from_slice(aux.sprites());
        gs.update_improvement = true;
        shared.update.notify_all();
    }
    info!("dual: baseline seeded at {}", baseline);

    // Bootstrap results were scored under a different metric.
    for ev in evaluators.iter_mut() {
        ev.clear_all_caches();
    }

    shared.fixed_frames.publish(fixed_b);
    shared.focus_b.store(false, Ordering::Relaxed);
    shared.stage_counter.store(0, Ordering::Relaxed);
    shared.set_phase(DualPhase::Alternating);
    info!("dual: alternating focus every {} evaluations", cfg.altering_dual_steps);

    std::thread::scope(|s| {
        for ev in evaluators.iter_mut() {
            let tables = &tables;
            let cfg = &cfg;
            s.spawn(move || alternating_worker(ev, tables, cfg));
        }
    });

    finish(&shared);
}

fn finish(shared: &Arc<SharedState>) {
    shared.finished.store(true, Ordering::Relaxed);
    let mut gs = shared.state.lock().unwrap();
    gs.finished = true;
    gs.threads_active = gs.threads_active.saturating_sub(1);
    shared.update.notify_all();
}

/// Single-frame bootstrap loop bounded by a global evaluation target.
fn bootstrap_worker(ev: &mut Evaluator, target_evals: u64, frame: Frame) {
    let shared = Arc::clone(&ev.shared);
    let height = ev.height();

    {
        let gs = shared.state.lock().unwrap();
        let (pic, cost) = match frame {
            Frame::A => (gs.best_pic.clone(), gs.best_cost),
            Frame::B => {
                let d = gs.dual.as_ref();
                (
                    d.map(|d| d.best_pic_b.clone())
                        .unwrap_or_else(|| gs.best_pic.clone()),
                    gs.best_cost,
                )
            }
        };
        drop(gs);
        ev.adopt_best(&pic, cost);
    }

    let mut local_gen_b = shared.gen_b.load(Ordering::Relaxed);

    loop {
        if shared.finished.load(Ordering::Relaxed)
            || shared.evaluations.load(Ordering::Relaxed) >= target_evals
        {
            return;
        }

        // Resync when another thread published a better base.
        match frame {
            Frame::A => {
                if shared.best_cost() < ev.best_cost {
                    let gs = shared.state.lock().unwrap();
                    let pic = gs.best_pic.clone();
                    let cost = gs.best_cost;
                    drop(gs);
                    ev.adopt_best(&pic, cost);
                }
            }
            Frame::B => {
                let gen = shared.gen_b.load(Ordering::Acquire);
                if gen != local_gen_b {
                    let gs = shared.state.lock().unwrap();
                    let adopted = gs
                        .dual
                        .as_ref()
                        .map(|d| (d.best_pic_b.clone(), d.best_cost_b));
                    drop(gs);
                    if let Some((pic, cost)) = adopted {
                        ev.adopt_best(&pic, cost);
                    }
                    local_gen_b = gen;
                }
            }
        }

        ev.enforce_cache_budget(None);

        let mut candidate = ev.best_pic.clone();
        ev.mutate_program(&mut candidate);
        let result = ev.execute(&mut candidate);

        let mut gs = shared.state.lock().unwrap();
        if gs.finished || gs.evaluations >= target_evals {
            return;
        }
        gs.evaluations += 1;
        shared.evaluations.store(gs.evaluations, Ordering::Relaxed);

        let evaluations = gs.evaluations;
        let last_best_evaluation = gs.last_best_evaluation;
        let best_cost = gs.best_cost;
        let out = gs
            .acceptance
            .apply(result, evaluations, last_best_evaluation, best_cost);

        if out.accepted && !out.improved {
            // Walk onward from the accepted candidate.
            ev.best_pic = candidate.clone();
        }

        match frame {
            Frame::A => {
                if out.improved {
                    gs.last_best_evaluation = gs.evaluations;
                    shared
                        .last_best_evaluation
                        .store(gs.evaluations, Ordering::Relaxed);
                    gs.best_cost = result;
                    shared.set_best_cost(result);
                    gs.best_pic = candidate.clone();
                    gs.best_pic.uncache_all();
                    for y in 0..height {
                        gs.painted[y].copy_from_slice(&ev.painted[y]);
                        gs.painted_targets[y].copy_from_slice(&ev.painted_targets[y]);
                    }
                    gs.sprites.copy_from_slice(&ev.sprites);
                    let mut stats = gs.mutation_stats;
                    ev.drain_current_mutations(&mut stats);
                    gs.mutation_stats = stats;
                    gs.update_improvement = true;
                    shared.update.notify_all();
                    ev.best_pic = candidate.clone();
                    ev.best_cost = result;
                }
            }
            Frame::B => {
                let improves_b = gs
                    .dual
                    .as_ref()
                    .map(|d| result < d.best_cost_b)
                    .unwrap_or(false);
                if out.improved || improves_b {
                    if out.improved {
                        gs.last_best_evaluation = gs.evaluations;
                        shared
                            .last_best_evaluation
                            .store(gs.evaluations, Ordering::Relaxed);
                    }
                    let painted = &ev.painted;
                    let painted_targets = &ev.painted_targets;
                    let sprites = &ev.sprites;
                    if let Some(d) = gs.dual.as_mut() {
                        d.best_pic_b = candidate.clone();
                        d.best_pic_b.uncache_all();
                        d.best_cost_b = result;
                        for y in 0..height {
                            d.painted_b[y].copy_from_slice(&painted[y]);
                            d.painted_targets_b[y].copy_from_slice(&painted_targets[y]);
                        }
                        d.sprites_b.copy_from_slice(sprites);
                    }
                    shared.gen_b.fetch_add(1, Ordering::AcqRel);
                    gs.update_improvement = true;
                    shared.update.notify_all();
                    ev.best_pic = candidate.clone();
                    ev.best_cost = result;
                    local_gen_b = shared.gen_b.load(Ordering::Relaxed);
                }
            }
        }

        if shared.save_period > 0 && gs.evaluations % shared.save_period as u64 == 0 {
            gs.update_autosave = true;
            shared.update.notify_all();
        }
        if gs.evaluations >= shared.max_evals {
            gs.finished = true;
            shared.finished.store(true, Ordering::Relaxed);
            shared.update.notify_all();
        }
        if gs.evaluations % STATISTICS_PERIOD == 0 {
            let point = StatPoint {
                evaluations: gs.evaluations,
                seconds: shared.start_time.elapsed().as_secs(),
                distance: gs.acceptance.current_cost,
            };
            gs.statistics.push(point);
        }
    }
}

/// Alternating-phase loop: evaluate the focused frame against the frozen
/// opposite frame, flipping focus on a fixed evaluation cadence.
fn alternating_worker(ev: &mut Evaluator, tables: &Arc<DualTables>, cfg: &OptimizerConfig) {
    let shared = Arc::clone(&ev.shared);
    let height = ev.height();

    let (mut current_a, mut current_b) = {
        let gs = shared.state.lock().unwrap();
        let b = gs
            .dual
            .as_ref()
            .map(|d| d.best_pic_b.clone())
            .unwrap_or_else(|| gs.best_pic.clone());
        (gs.best_pic.clone(), b)
    };
    current_a.uncache_all();
    current_b.uncache_all();
    let mut local_accepted = shared.best_cost();
    let mut local_focus_b = shared.focus_b.load(Ordering::Relaxed);

    let zero_rows: Vec<Vec<u8>> = vec![Vec::new(); height];

    loop {
        if shared.finished.load(Ordering::Relaxed) {
            return;
        }

        // Stage coordination: the increment that crosses the cadence
        // exchanges the counter back to zero, so exactly one worker flips.
        let mut mutate_b = shared.focus_b.load(Ordering::Relaxed);
        let counter = shared.stage_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if counter >= cfg.altering_dual_steps
            && shared.stage_counter.swap(0, Ordering::Relaxed) >= cfg.altering_dual_steps
        {
            let new_focus_b = !mutate_b;
            shared.focus_b.store(new_focus_b, Ordering::Relaxed);
            // The newly frozen frame's generation moves so every worker
            // invalidates its dual caches.
            if new_focus_b {
                shared.gen_a.fetch_add(1, Ordering::AcqRel);
            } else {
                shared.gen_b.fetch_add(1, Ordering::AcqRel);
            }
            debug!("dual: focus flipped to {}", if new_focus_b { "B" } else { "A" });
        }
        mutate_b = shared.focus_b.load(Ordering::Relaxed);

        // On a flip, resync local copies and publish the frozen frame's
        // rows for everyone.
        if local_focus_b != mutate_b {
            let gs = shared.state.lock().unwrap();
            if gs.best_cost < local_accepted {
                current_a = gs.best_pic.clone();
                current_a.uncache_all();
                if let Some(d) = gs.dual.as_ref() {
                    current_b = d.best_pic_b.clone();
                    current_b.uncache_all();
                }
                local_accepted = gs.best_cost;
            }
            let rows = if mutate_b {
                gs.painted.clone()
            } else {
                gs.dual
                    .as_ref()
                    .map(|d| d.painted_b.clone())
                    .unwrap_or_default()
            };
            drop(gs);
            shared.fixed_frames.publish(rows);
            local_focus_b = mutate_b;
        }

        // Lock-free pre-check before resyncing to a moved best.
        if shared.best_cost() < local_accepted {
            let gs = shared.state.lock().unwrap();
            if gs.best_cost < local_accepted {
                current_a = gs.best_pic.clone();
                current_a.uncache_all();
                if let Some(d) = gs.dual.as_ref() {
                    current_b = d.best_pic_b.clone();
                    current_b.uncache_all();
                }
                local_accepted = gs.best_cost;
            }
        }

        let mut candidate = if mutate_b {
            current_b.clone()
        } else {
            current_a.clone()
        };

        // Zero-copy snapshot of the frozen frame; a transient empty
        // snapshot (publish in flight) falls back to zero rows.
        let snapshot = shared.fixed_frames.snapshot();
        let rows: &[Vec<u8>] = if snapshot.len() == height {
            &snapshot
        } else {
            &zero_rows
        };

        ev.set_dual_other_rows(Some(Arc::clone(&snapshot)));
        ev.mutate_program(&mut candidate);
        let result = ev.execute_dual(&mut candidate, tables, rows, mutate_b);

        let mut gs = shared.state.lock().unwrap();
        if gs.finished {
            return;
        }
        gs.evaluations += 1;
        shared.evaluations.store(gs.evaluations, Ordering::Relaxed);

        let evaluations = gs.evaluations;
        let last_best_evaluation = gs.last_best_evaluation;
        let best_cost = gs.best_cost;
        let out = gs
            .acceptance
            .apply(result, evaluations, last_best_evaluation, best_cost);

        if out.accepted && !out.improved {
            if mutate_b {
                current_b = candidate.clone();
                current_b.uncache_all();
            } else {
                current_a = candidate.clone();
                current_a.uncache_all();
            }
            local_accepted = result;
        }

        if out.improved {
            gs.last_best_evaluation = gs.evaluations;
            shared
                .last_best_evaluation
                .store(gs.evaluations, Ordering::Relaxed);
            gs.best_cost = result;
            shared.set_best_cost(result);

            if mutate_b {
                let painted = &ev.painted;
                let painted_targets = &ev.painted_targets;
                let sprites = &ev.sprites;
                if let Some(d) = gs.dual.as_mut() {
                    d.best_pic_b = candidate.clone();
                    d.best_pic_b.uncache_all();
                    d.best_cost_b = result;
                    for y in 0..height {
                        d.painted_b[y].copy_from_slice(&painted[y]);
                        d.painted_targets_b[y].copy_from_slice(&painted_targets[y]);
                    }
                    d.sprites_b.copy_from_slice(sprites);
                }
                shared.gen_b.fetch_add(1, Ordering::AcqRel);
                current_b = candidate.clone();
                current_b.uncache_all();
            } else {
                gs.best_pic = candidate.clone();
                gs.best_pic.uncache_all();
                for y in 0..height {
                    gs.painted[y].copy_from_slice(&ev.painted[y]);
                    gs.painted_targets[y].copy_from_slice(&ev.painted_targets[y]);
                }
                gs.sprites.copy_from_slice(&ev.sprites);
                shared.gen_a.fetch_add(1, Ordering::AcqRel);
                current_a = candidate.clone();
                current_a.uncache_all();
            }

            let mut stats = gs.mutation_stats;
            ev.drain_current_mutations(&mut stats);
            gs.mutation_stats = stats;
            gs.update_improvement = true;
            shared.update.notify_all();
            local_accepted = result;
        }

        if shared.save_period > 0 && gs.evaluations % shared.save_period as u64 == 0 {
            gs.update_autosave = true;
            shared.update.notify_all();
        }
        if gs.evaluations >= shared.max_evals {
            gs.finished = true;
            shared.finished.store(true, Ordering::Relaxed);
            shared.update.notify_all();
        }
        if gs.evaluations % STATISTICS_PERIOD == 0 {
            let point = StatPoint {
                evaluations: gs.evaluations,
                seconds: shared.start_time.elapsed().as_secs(),
                distance: gs.acceptance.current_cost,
            };
            gs.statistics.push(point);
        }
    }
}
