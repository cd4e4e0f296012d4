// Mutation module - neighbour generation over raster programs
//
// Neighbours are produced by a family of typed line edits. The selector is
// self-tuning: each operator's weight follows its recent accepted-success
// rate, with a floor so nothing ever starves, and a short allow-list of
// exploratory operators is boosted while the search sits on a plateau.
//
// Operator application keeps the original engine's fall-through shape: if
// the selected operator's gate fails (line boundaries, cycle budget), the
// next operator in application order is tried instead, and the success is
// still credited to the operator that was selected.

use crate::emulator::cycles::{cycle_length, cycle_offset};
use crate::emulator::Evaluator;
use crate::program::{
    Instruction, Opcode, RasterPicture, Target, FREE_CYCLES, REG_COUNT, SPRITE_SCREEN_OFFSET,
    SPRITE_WIDTH,
};

/// Number of mutation operators.
pub const MUTATION_COUNT: usize = 10;

/// Evaluations a cached plateau verdict stays valid.
const STUCK_TTL_EVALS: u64 = 128;

/// Evaluations cached operator weights stay valid while not stuck.
const WEIGHTS_TTL_EVALS: u64 = 1024;

/// Typed mutation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MutationKind {
    PushBackToPrev = 0,
    CopyLineToNext = 1,
    SwapLineWithPrev = 2,
    AddInstruction = 3,
    RemoveInstruction = 4,
    SwapInstruction = 5,
    ChangeTarget = 6,
    ChangeValue = 7,
    ChangeValueToColor = 8,
    ComplementValueDual = 9,
}

impl MutationKind {
    pub const ALL: [MutationKind; MUTATION_COUNT] = [
        MutationKind::PushBackToPrev,
        MutationKind::CopyLineToNext,
        MutationKind::SwapLineWithPrev,
        MutationKind::AddInstruction,
        MutationKind::RemoveInstruction,
        MutationKind::SwapInstruction,
        MutationKind::ChangeTarget,
        MutationKind::ChangeValue,
        MutationKind::ChangeValueToColor,
        MutationKind::ComplementValueDual,
    ];

    /// Application order: a failed gate falls through to the next entry.
    const APPLY_ORDER: [MutationKind; MUTATION_COUNT] = [
        MutationKind::CopyLineToNext,
        MutationKind::PushBackToPrev,
        MutationKind::SwapLineWithPrev,
        MutationKind::AddInstruction,
        MutationKind::RemoveInstruction,
        MutationKind::SwapInstruction,
        MutationKind::ChangeTarget,
        MutationKind::ChangeValue,
        MutationKind::ChangeValueToColor,
        MutationKind::ComplementValueDual,
    ];

    /// Operators boosted while the search is stuck.
    fn exploratory(self) -> bool {
        matches!(
            self,
            MutationKind::AddInstruction
                | MutationKind::RemoveInstruction
                | MutationKind::ChangeValueToColor
                | MutationKind::ComplementValueDual
                | MutationKind::SwapLineWithPrev
                | MutationKind::CopyLineToNext
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MutationKind::PushBackToPrev => "push back to prev",
            MutationKind::CopyLineToNext => "copy line to next",
            MutationKind::SwapLineWithPrev => "swap line with prev",
            MutationKind::AddInstruction => "add instruction",
            MutationKind::RemoveInstruction => "remove instruction",
            MutationKind::SwapInstruction => "swap instruction",
            MutationKind::ChangeTarget => "change target",
            MutationKind::ChangeValue => "change value",
            MutationKind::ChangeValueToColor => "change value to color",
            MutationKind::ComplementValueDual => "complement value dual",
        }
    }

    pub fn from_index(i: usize) -> MutationKind {
        Self::ALL[i % MUTATION_COUNT]
    }
}

impl Evaluator {
    /// Generate one neighbour of `pic` in place.
    pub fn mutate_program(&mut self, pic: &mut RasterPicture) {
        self.current_mutations = [0; MUTATION_COUNT];

        let stuck = self.is_stuck();
        let height = pic.lines.len();

        let thread_count = self.ctx.thread_count.max(1);
        let lines_per_thread = height / thread_count;
        let region_start = self.thread_id * lines_per_thread;
        let region_end = if self.thread_id == thread_count - 1 {
            height
        } else {
            region_start + lines_per_thread
        };

        // Mutate mostly inside this worker's slice of the picture so
        // workers do not chase each other over the same lines.
        if self.rng.rand(100) < 80 && region_end > region_start {
            self.mutated_y = region_start + self.rng.rand(region_end - region_start);
        } else if self.mutated_y >= height {
            self.mutated_y = 0;
        }

        // Occasionally nudge one initial register (never COLBAK).
        if self.rng.rand(10) == 0 {
            let mut c: i32 = 1;
            if self.rng.rand(2) == 1 {
                c = -c;
            }
            if self.rng.rand(2) == 1 {
                c *= 16;
            }
            let mut slot = self.rng.rand(REG_COUNT);
            while slot == Target::Colbak.index() {
                slot = self.rng.rand(REG_COUNT);
            }
            pic.reg_init[slot] = (pic.reg_init[slot] as i32).wrapping_add(c) as u8;
        }

        self.mutate_line(pic, self.mutated_y, stuck);

        // Occasionally walk a drifting cursor over neighbouring lines.
        let chain_prob = if stuck { 5 } else { 20 };
        let steps = if stuck { 30 } else { 10 };
        if self.rng.rand(chain_prob) == 0 {
            for _ in 0..steps {
                if self.rng.rand(2) == 1 && self.mutated_y > region_start {
                    self.mutated_y -= 1;
                } else if self.mutated_y + 1 < region_end {
                    self.mutated_y += 1;
                } else {
                    self.mutated_y = region_start + self.rng.rand(region_end - region_start);
                }
                self.mutate_line(pic, self.mutated_y, stuck);
            }
        }

        self.recache_picture(pic);
    }

    /// Apply a batch of single mutations to line `y`, escalating when the
    /// search is stuck.
    fn mutate_line(&mut self, pic: &mut RasterPicture, y: usize, stuck: bool) {
        let len = pic.lines[y].instructions.len();
        let mut count = (3 + len / 5).min(8);
        if stuck {
            count += 5 + self.rng.rand(10);
        }
        for _ in 0..count {
            self.mutate_once(pic, y);
        }
        pic.lines[y].rehash();
    }

    /// Apply one single mutation to line `y`, falling through the
    /// application order until an operator's gate passes.
    fn mutate_once(&mut self, pic: &mut RasterPicture, y: usize) {
        let len = pic.lines[y].instructions.len();
        let i1 = self.rng.rand(len);
        let mut i2 = i1;
        if len > 2 {
            loop {
                i2 = self.rng.rand(len);
                if i2 != i1 {
                    break;
                }
            }
        }

        let selected = self.select_mutation();
        self.mutation_attempts[selected as usize] += 1;

        let start = MutationKind::APPLY_ORDER
            .iter()
            .position(|&k| k == selected)
            .unwrap_or(0);

        for &kind in &MutationKind::APPLY_ORDER[start..] {
            if let Some(applied) = self.try_apply(kind, pic, y, i1, i2) {
                // Success feeds the weight of the operator that was
                // selected; the applied counter records what actually ran.
                let credited = if selected == MutationKind::ComplementValueDual
                    && applied == MutationKind::ChangeValueToColor
                {
                    applied
                } else {
                    selected
                };
                self.mutation_successes[credited as usize] += 1;
                self.current_mutations[applied as usize] += 1;
                return;
            }
        }
    }

    fn try_apply(
        &mut self,
        kind: MutationKind,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
        i2: usize,
    ) -> Option<MutationKind> {
        match kind {
            MutationKind::CopyLineToNext => self.try_copy_line_to_next(pic, y),
            MutationKind::PushBackToPrev => self.try_push_back_to_prev(pic, y, i1),
            MutationKind::SwapLineWithPrev => self.try_swap_line_with_prev(pic, y),
            MutationKind::AddInstruction => self.try_add_instruction(pic, y, i1),
            MutationKind::RemoveInstruction => self.try_remove_instruction(pic, y, i1),
            MutationKind::SwapInstruction => self.try_swap_instruction(pic, y, i1, i2),
            MutationKind::ChangeTarget => self.try_change_target(pic, y, i1),
            MutationKind::ChangeValue => self.try_change_value(pic, y, i1),
            MutationKind::ChangeValueToColor => self.try_change_value_to_color(pic, y, i1),
            MutationKind::ComplementValueDual => self.try_complement_value_dual(pic, y, i1),
        }
    }

    // ========================================
    // Individual operators
    // ========================================

    fn try_copy_line_to_next(&mut self, pic: &mut RasterPicture, y: usize) -> Option<MutationKind> {
        if y + 1 >= pic.lines.len() {
            return None;
        }
        pic.lines[y] = pic.lines[y + 1].clone();
        Some(MutationKind::CopyLineToNext)
    }

    fn try_push_back_to_prev(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
    ) -> Option<MutationKind> {
        if y == 0 || pic.lines[y].instructions.is_empty() {
            return None;
        }
        let instr = pic.lines[y].instructions[i1];
        let c = instr.cycles();
        let prev = &mut pic.lines[y - 1];
        if prev.cycles + c < FREE_CYCLES {
            // Duplicate into the previous line; the current line keeps it.
            prev.cycles += c;
            prev.instructions.push(instr);
            prev.cache_key = None;
            return Some(MutationKind::PushBackToPrev);
        }
        None
    }

    fn try_swap_line_with_prev(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
    ) -> Option<MutationKind> {
        if y == 0 {
            return None;
        }
        let (before, after) = pic.lines.split_at_mut(y);
        before[y - 1].swap(&mut after[0]);
        Some(MutationKind::SwapLineWithPrev)
    }

    fn try_add_instruction(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
    ) -> Option<MutationKind> {
        let line_cycles = pic.lines[y].cycles;
        if line_cycles + 2 >= FREE_CYCLES {
            return None;
        }

        let instr = if line_cycles + 4 < FREE_CYCLES && self.rng.rand(2) == 1 {
            Instruction {
                opcode: match self.rng.rand(3) {
                    0 => Opcode::Sta,
                    1 => Opcode::Stx,
                    _ => Opcode::Sty,
                },
                value: (self.rng.rand(128) * 2) as u8,
                target: Target::from_index(self.rng.rand(REG_COUNT)),
            }
        } else {
            let opcode = match self.rng.rand(4) {
                0 => Opcode::Lda,
                1 => Opcode::Ldx,
                2 => Opcode::Ldy,
                _ => Opcode::Nop,
            };
            let value = match self.rng.rand(3) {
                0 => (self.rng.rand(128) * 2) as u8,
                1 => {
                    let colors = self.ctx.target.possible_colors(y);
                    colors[self.rng.rand(colors.len())]
                }
                _ => {
                    let x = self.rng.rand(self.ctx.target.width());
                    self.ctx.target.nearest_reg_value(x, y)
                }
            };
            Instruction {
                opcode,
                value,
                target: Target::from_index(self.rng.rand(REG_COUNT)),
            }
        };

        let line = &mut pic.lines[y];
        let at = i1.min(line.instructions.len());
        line.instructions.insert(at, instr);
        line.cycles += instr.cycles();
        line.cache_key = None;
        Some(MutationKind::AddInstruction)
    }

    fn try_remove_instruction(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
    ) -> Option<MutationKind> {
        let line = &mut pic.lines[y];
        if line.cycles <= 4 || line.instructions.is_empty() {
            return None;
        }
        let c = line.instructions[i1].cycles();
        if line.cycles - c == 0 {
            return None;
        }
        line.cycles -= c;
        line.instructions.remove(i1);
        line.cache_key = None;
        Some(MutationKind::RemoveInstruction)
    }

    fn try_swap_instruction(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
        i2: usize,
    ) -> Option<MutationKind> {
        let line = &mut pic.lines[y];
        if line.instructions.len() <= 2 {
            return None;
        }
        line.instructions.swap(i1, i2);
        line.cache_key = None;
        Some(MutationKind::SwapInstruction)
    }

    fn try_change_target(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
    ) -> Option<MutationKind> {
        let line = &mut pic.lines[y];
        if line.instructions.is_empty() {
            return None;
        }
        let target = Target::from_index(self.rng.rand(REG_COUNT));
        line.instructions[i1].target = target;
        line.cache_key = None;
        Some(MutationKind::ChangeTarget)
    }

    fn try_change_value(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
    ) -> Option<MutationKind> {
        if pic.lines[y].instructions.is_empty() {
            return None;
        }
        let value = if self.rng.rand(10) == 0 {
            if self.rng.rand(2) == 1 {
                (self.rng.rand(128) * 2) as u8
            } else {
                let colors = self.ctx.target.possible_colors(y);
                colors[self.rng.rand(colors.len())]
            }
        } else {
            let mut c: i32 = 1;
            if self.rng.rand(2) == 1 {
                c = -c;
            }
            if self.rng.rand(2) == 1 {
                c *= 16;
            }
            (pic.lines[y].instructions[i1].value as i32).wrapping_add(c) as u8
        };
        let line = &mut pic.lines[y];
        line.instructions[i1].value = value;
        line.cache_key = None;
        Some(MutationKind::ChangeValue)
    }

    /// Pick the screen position an instruction's write lands on and set
    /// its value to the target colour there, optionally drifting into the
    /// following lines.
    fn pick_screen_position(&mut self, pic: &RasterPicture, y: usize, i1: usize) -> (usize, usize) {
        let width = self.ctx.target.width();
        let height = self.ctx.target.height();
        let line = &pic.lines[y];

        let mut x: i32 = if line.instructions[i1].target.is_sprite_pos() {
            let slot = line.instructions[i1].target.index();
            self.mem_regs[slot] as i32 - SPRITE_SCREEN_OFFSET
                + self.rng.rand(SPRITE_WIDTH as usize) as i32
        } else {
            // Walk the cycle offsets of the instructions scheduled ahead.
            let mut c = 0usize;
            for instr in line.instructions.iter().take(i1.saturating_sub(1)) {
                c += instr.cycles() as usize;
            }
            while self.rng.rand(5) == 0 {
                c += 1;
            }
            if c >= FREE_CYCLES as usize {
                c = FREE_CYCLES as usize - 1;
            }
            cycle_offset(c) + self.rng.rand(cycle_length(c).max(0) as usize) as i32
        };

        if x < 0 || x >= width as i32 {
            x = self.rng.rand(width) as i32;
        }

        let mut yy = y;
        while self.rng.rand(5) == 0 && yy + 1 < height {
            yy += 1;
        }
        (x as usize, yy)
    }

    fn try_change_value_to_color(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
    ) -> Option<MutationKind> {
        if pic.lines[y].instructions.is_empty() {
            return None;
        }
        let (x, yy) = self.pick_screen_position(pic, y, i1);
        let value = self.ctx.target.nearest_reg_value(x, yy);
        let line = &mut pic.lines[y];
        line.instructions[i1].value = value;
        line.cache_key = None;
        Some(MutationKind::ChangeValueToColor)
    }

    fn try_complement_value_dual(
        &mut self,
        pic: &mut RasterPicture,
        y: usize,
        i1: usize,
    ) -> Option<MutationKind> {
        if pic.lines[y].instructions.is_empty() {
            return None;
        }
        let dual_ok = self.dual_tables.is_some() && self.dual_other_rows.is_some();
        if !dual_ok {
            // Degrade gracefully to the single-frame colour snap.
            return self.try_change_value_to_color(pic, y, i1);
        }

        let (x, yy) = self.pick_screen_position(pic, y, i1);
        let width = self.ctx.target.width();

        let other_idx = match &self.dual_other_rows {
            Some(rows) if yy < rows.len() && !rows[yy].is_empty() => rows[yy][x],
            _ => 0,
        };
        let best = match &self.dual_tables {
            Some(tables) => tables.best_self_index(other_idx, yy * width + x),
            None => 0,
        };

        let line = &mut pic.lines[y];
        line.instructions[i1].value = best * 2;
        line.cache_key = None;
        Some(MutationKind::ComplementValueDual)
    }

    // ========================================
    // Operator selection
    // ========================================

    /// Pick an operator by self-tuned weight. Weights are recomputed on a
    /// TTL (immediately while stuck) and the dual-only operator is gated
    /// off when no dual context is installed.
    fn select_mutation(&mut self) -> MutationKind {
        use std::sync::atomic::Ordering;

        let evals = self.shared.evaluations.load(Ordering::Relaxed);

        if evals >= self.stuck_valid_until {
            self.stuck_cached = self.is_stuck();
            self.stuck_valid_until = evals + STUCK_TTL_EVALS;
        }
        let stuck = self.stuck_cached;

        let dual_ok = self.dual_tables.is_some() && self.dual_other_rows.is_some();
        let need_recompute = self.cached_total_weight <= 0.0
            || stuck
            || evals >= self.weights_valid_until
            || dual_ok != self.last_dual_ok;

        if need_recompute {
            self.cached_total_weight = 0.0;
            for kind in MutationKind::ALL {
                let i = kind as usize;
                if kind == MutationKind::ComplementValueDual && !dual_ok {
                    self.cached_weights[i] = 0.0;
                    continue;
                }
                let success_rate = if self.mutation_attempts[i] > 10 {
                    self.mutation_successes[i] as f64 / self.mutation_attempts[i] as f64
                } else {
                    0.1
                };
                let mut w = 0.1 + 0.9 * success_rate;
                if stuck && kind.exploratory() {
                    w *= 2.0;
                }
                self.cached_weights[i] = w;
                self.cached_total_weight += w;
            }
            self.weights_valid_until = if stuck { evals } else { evals + WEIGHTS_TTL_EVALS };
            self.last_dual_ok = dual_ok;
        }

        if self.cached_total_weight <= 0.0 {
            return MutationKind::from_index(self.rng.rand(MUTATION_COUNT));
        }
        let r = self.rng.rand(10_000) as f64 / 10_000.0 * self.cached_total_weight;
        let mut sum = 0.0;
        for kind in MutationKind::ALL {
            sum += self.cached_weights[kind as usize];
            if r <= sum {
                return kind;
            }
        }
        MutationKind::from_index(self.rng.rand(MUTATION_COUNT))
    }

    /// Drain the per-iteration applied-operator counters into a caller
    /// accumulator; called under the global lock on accepted improvements.
    pub fn drain_current_mutations(&mut self, stats: &mut [u64; MUTATION_COUNT]) {
        for i in 0..MUTATION_COUNT {
            stats[i] += self.current_mutations[i];
            self.current_mutations[i] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::emulator::EvalContext;
    use crate::optimizer::SharedState;
    use crate::palette::{DistanceMetric, Palette};
    use crate::program::RasterLine;
    use crate::target::TargetImage;
    use std::sync::Arc;

    fn test_evaluator(height: usize) -> Evaluator {
        let palette = Palette::grayscale();
        let pixels = vec![palette.color(10); 160 * height];
        let target = TargetImage::new(160, height, pixels, &palette, DistanceMetric::Euclidean);
        let ctx = Arc::new(EvalContext {
            target,
            palette,
            onoff: None,
            thread_count: 1,
            unstuck_after: 0,
        });
        let cfg = OptimizerConfig::default();
        let shared = Arc::new(SharedState::new(&cfg, height, 160));
        Evaluator::new(0, 7, 16 * 1024 * 1024, ctx, shared)
    }

    fn seed_picture(height: usize) -> RasterPicture {
        let mut pic = RasterPicture::new(height);
        for y in 0..height {
            let mut line = RasterLine::new();
            line.push(Instruction::new(Opcode::Lda, 20, Target::Color0));
            line.push(Instruction::new(Opcode::Sta, 20, Target::Color0));
            line.push(Instruction::new(Opcode::Ldx, 40, Target::Color1));
            line.push(Instruction::new(Opcode::Stx, 40, Target::Color1));
            line.rehash();
            pic.lines[y] = line;
        }
        pic
    }

    #[test]
    fn test_mutations_preserve_cycle_budget() {
        let mut ev = test_evaluator(16);
        let mut pic = seed_picture(16);
        for _ in 0..2000 {
            ev.mutate_program(&mut pic);
            for line in &pic.lines {
                let actual: u32 = line.instructions.iter().map(|i| i.cycles()).sum();
                assert_eq!(actual, line.cycles);
                assert!(line.cycles <= FREE_CYCLES);
            }
        }
    }

    #[test]
    fn test_mutations_keep_targets_valid() {
        let mut ev = test_evaluator(8);
        let mut pic = seed_picture(8);
        for _ in 0..500 {
            ev.mutate_program(&mut pic);
        }
        for line in &pic.lines {
            for instr in &line.instructions {
                assert!(instr.target.index() <= Target::Hitclr.index());
            }
        }
    }

    #[test]
    fn test_mutated_lines_are_reinterned() {
        let mut ev = test_evaluator(8);
        let mut pic = seed_picture(8);
        ev.recache_picture(&mut pic);
        for _ in 0..100 {
            ev.mutate_program(&mut pic);
            assert!(pic.lines.iter().all(|l| l.cache_key.is_some()));
        }
    }

    #[test]
    fn test_mutation_changes_something() {
        let mut ev = test_evaluator(8);
        let mut pic = seed_picture(8);
        let reference = seed_picture(8);
        let mut changed = 0;
        for _ in 0..50 {
            ev.mutate_program(&mut pic);
            let differs = pic
                .lines
                .iter()
                .zip(reference.lines.iter())
                .any(|(a, b)| a.instructions != b.instructions)
                || pic.reg_init != reference.reg_init;
            if differs {
                changed += 1;
            }
        }
        assert!(changed > 40, "mutations barely changed the program");
    }

    #[test]
    fn test_attempt_counters_grow() {
        let mut ev = test_evaluator(8);
        let mut pic = seed_picture(8);
        for _ in 0..200 {
            ev.mutate_program(&mut pic);
        }
        let attempts: u64 = ev.mutation_attempts.iter().sum();
        let successes: u64 = ev.mutation_successes.iter().sum();
        assert!(attempts > 0);
        assert!(successes > 0);
        assert!(successes <= attempts);
    }

    #[test]
    fn test_dual_operator_gated_without_tables() {
        let mut ev = test_evaluator(8);
        let mut pic = seed_picture(8);
        for _ in 0..500 {
            ev.mutate_program(&mut pic);
        }
        // Selection never lands on the dual-only operator while the dual
        // context is missing; the applied counter can only move via the
        // degraded path, which credits the colour snap instead.
        assert_eq!(
            ev.current_mutations[MutationKind::ComplementValueDual as usize],
            0
        );
        assert_eq!(
            ev.mutation_attempts[MutationKind::ComplementValueDual as usize],
            0
        );
    }
}
