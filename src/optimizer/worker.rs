// Worker driver - the per-thread evaluation loop
//
// Each worker repeats: enforce the cache budget, copy the shared best,
// mutate, evaluate, then take the global lock once to run acceptance and
// publish. The first iteration evaluates the starting program verbatim so
// the acceptance history has a baseline.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::emulator::Evaluator;
use crate::stats::{StatPoint, STATISTICS_PERIOD};

/// Body of one single-frame worker thread. Returns when the shared state
/// reaches the finished steady state.
pub fn run_worker(mut ev: Evaluator) {
    let shared = Arc::clone(&ev.shared);
    let height = ev.height();

    // Adopt the starting program as the local best.
    {
        let gs = shared.state.lock().unwrap();
        let pic = gs.best_pic.clone();
        let cost = gs.best_cost;
        drop(gs);
        ev.adopt_best(&pic, cost);
    }

    let mut first_evaluation = true;

    loop {
        if ev.enforce_cache_budget(None) {
            debug!(
                "worker {}: cache budget exceeded, performed full clear",
                ev.thread_id
            );
        }

        let mut candidate = ev.best_pic.clone();
        if first_evaluation {
            // Seed the baseline with the unmutated starting program.
            first_evaluation = false;
        } else {
            ev.mutate_program(&mut candidate);
        }

        let result = ev.execute(&mut candidate);

        let mut gs = shared.state.lock().unwrap();

        gs.evaluations += 1;
        shared.evaluations.store(gs.evaluations, Ordering::Relaxed);

        if !gs.initialized {
            if !gs.acceptance.is_seeded() {
                gs.acceptance.seed(result);
            }
            gs.initialized = true;
            gs.update_initialized = true;
            shared.update.notify_all();
        }

        let evaluations = gs.evaluations;
        let last_best_evaluation = gs.last_best_evaluation;
        let best_cost = gs.best_cost;
        let out = gs
            .acceptance
            .apply(result, evaluations, last_best_evaluation, best_cost);

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

            // The candidate's interned identities are valid in this
            // worker's caches; keep it as the local best directly.
            ev.best_pic = candidate.clone();
            ev.best_cost = result;
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

        // Another worker moved the global best: adopt it.
        if ev.best_cost != gs.best_cost {
            let pic = gs.best_pic.clone();
            let cost = gs.best_cost;
            ev.adopt_best(&pic, cost);
        }

        if gs.evaluations % STATISTICS_PERIOD == 0 {
            let point = StatPoint {
                evaluations: gs.evaluations,
                seconds: shared.start_time.elapsed().as_secs(),
                distance: gs.acceptance.current_cost,
            };
            gs.statistics.push(point);
        }

        if gs.finished {
            gs.threads_active -= 1;
            shared.update.notify_all();
            return;
        }
        drop(gs);
    }
}
