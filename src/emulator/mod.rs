// Emulator module - cycle-scheduled scanline execution and candidate scoring
//
// The evaluator executes a raster program the way the display hardware
// would: instruction retirement is pinned to beam positions from the cycle
// table, sprites shift out from latched horizontal positions, and every
// visible pixel picks the colour register closest to the target. Results
// are memoised per scanline so that re-scoring a mutated candidate only
// emulates the lines that changed.
//
// One evaluator is owned by exactly one worker thread. It carries its own
// arena, caches and RNG; the only shared pieces it touches are the atomics
// and the cache-clear coordination lock.

pub mod cycles;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::arena::Arena;
use crate::cache::line::SpriteRowBits;
use crate::cache::{LineCache, LineCacheKey, LineCacheValue, SequenceCache};
use crate::dual::tables::DualTables;
use crate::mutation::MUTATION_COUNT;
use crate::optimizer::SharedState;
use crate::palette::Palette;
use crate::program::{
    Instruction, Opcode, RasterPicture, RegisterState, Target, MEM_SLOTS, REG_COUNT,
    SPRITE_SCREEN_OFFSET, SPRITE_WIDTH,
};
use crate::rng::XorShift;
use crate::target::{OnOffMap, TargetImage, SCREEN_WIDTH};
use cycles::{cycle_offset, OFFSET_END};

/// Error added per pixel when a horizontal-position write lands inside the
/// 6-colour-clock latch window of a visible sprite. Real hardware does not
/// reproduce such a move cleanly, so candidates relying on it are pushed
/// far away from acceptance.
pub const HPOS_HAZARD_PENALTY: f64 = 100_000.0;

/// Upper bound on per-line restarts: one per sprite-memory bit.
const MAX_LINE_RESTARTS: u32 = 32;

/// Read-only evaluation inputs shared by every worker.
pub struct EvalContext {
    pub target: TargetImage,
    pub palette: Palette,
    pub onoff: Option<OnOffMap>,
    /// Worker count, used to slice the picture into mutation regions.
    pub thread_count: usize,
    /// Plateau length after which mutation escalates; 0 disables.
    pub unstuck_after: u64,
}

/// Per-thread candidate evaluator: line emulator, caches and mutation
/// scratch state.
pub struct Evaluator {
    pub(crate) thread_id: usize,
    pub(crate) ctx: Arc<EvalContext>,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) rng: XorShift,
    cache_budget: usize,

    /// Local copy of the best program this worker mutates from.
    pub(crate) best_pic: RasterPicture,
    pub(crate) best_cost: f64,

    arena: Arena,
    seq_cache: SequenceCache,
    line_caches: Vec<LineCache>,
    line_caches_dual: Vec<LineCache>,
    /// Generation of the opposite frame the dual caches were built against.
    dual_gen_seen: u64,

    // Machine state during execution
    reg_a: u8,
    reg_x: u8,
    reg_y: u8,
    pub(crate) mem_regs: [u8; MEM_SLOTS],
    saved_state: RegisterState,
    sprite_shift_pos: [u8; 4],
    sprite_shift_emitted: [u8; 4],
    sprite_start: [u8; 256],

    // Outputs of the most recent execution
    pub(crate) sprites: Vec<SpriteRowBits>,
    pub(crate) painted: Vec<Vec<u8>>,
    pub(crate) painted_targets: Vec<Vec<u8>>,

    // Per-line cache recency
    lru: VecDeque<usize>,
    lru_set: HashSet<usize>,

    // Mutation bookkeeping (see the mutation module)
    pub(crate) mutation_attempts: [u64; MUTATION_COUNT],
    pub(crate) mutation_successes: [u64; MUTATION_COUNT],
    pub(crate) current_mutations: [u64; MUTATION_COUNT],
    pub(crate) cached_weights: [f64; MUTATION_COUNT],
    pub(crate) cached_total_weight: f64,
    pub(crate) weights_valid_until: u64,
    pub(crate) stuck_cached: bool,
    pub(crate) stuck_valid_until: u64,
    pub(crate) last_dual_ok: bool,
    pub(crate) mutated_y: usize,

    // Dual-frame context, present while the coordinator runs
    pub(crate) dual_tables: Option<Arc<DualTables>>,
    pub(crate) dual_other_rows: Option<Arc<Vec<Vec<u8>>>>,
}

impl Evaluator {
    pub fn new(
        thread_id: usize,
        seed: u64,
        cache_budget: usize,
        ctx: Arc<EvalContext>,
        shared: Arc<SharedState>,
    ) -> Evaluator {
        let width = ctx.target.width();
        let height = ctx.target.height();

        Evaluator {
            thread_id,
            ctx,
            shared,
            rng: XorShift::new(seed),
            cache_budget,
            best_pic: RasterPicture::new(height),
            best_cost: f64::MAX,
            arena: Arena::new(),
            seq_cache: SequenceCache::new(),
            line_caches: (0..height).map(|_| LineCache::new()).collect(),
            line_caches_dual: Vec::new(),
            dual_gen_seen: 0,
            reg_a: 0,
            reg_x: 0,
            reg_y: 0,
            mem_regs: [0; MEM_SLOTS],
            saved_state: RegisterState::default(),
            sprite_shift_pos: [0; 4],
            sprite_shift_emitted: [0; 4],
            sprite_start: [0; 256],
            sprites: vec![[[false; 8]; 4]; height],
            painted: vec![vec![0; width]; height],
            painted_targets: vec![vec![0; width]; height],
            lru: VecDeque::new(),
            lru_set: HashSet::new(),
            mutation_attempts: [0; MUTATION_COUNT],
            mutation_successes: [0; MUTATION_COUNT],
            current_mutations: [0; MUTATION_COUNT],
            cached_weights: [0.0; MUTATION_COUNT],
            cached_total_weight: 0.0,
            weights_valid_until: 0,
            stuck_cached: false,
            stuck_valid_until: 0,
            last_dual_ok: false,
            mutated_y: 0,
            dual_tables: None,
            dual_other_rows: None,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.ctx.target.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.ctx.target.height()
    }

    /// Painted colour-index rows of the last execution.
    pub fn painted(&self) -> &[Vec<u8>] {
        &self.painted
    }

    /// Painted register rows of the last execution.
    pub fn painted_targets(&self) -> &[Vec<u8>] {
        &self.painted_targets
    }

    /// Sprite memory of the last execution.
    pub fn sprites(&self) -> &[SpriteRowBits] {
        &self.sprites
    }

    /// Install the dual objective tables on this evaluator.
    pub fn set_dual_tables(&mut self, tables: Arc<DualTables>) {
        self.dual_tables = Some(tables);
    }

    /// Provide the frozen opposite-frame rows for dual-aware mutations.
    pub fn set_dual_other_rows(&mut self, rows: Option<Arc<Vec<Vec<u8>>>>) {
        self.dual_other_rows = rows;
    }

    /// Adopt `pic` as this worker's local best and intern its sequences
    /// against the worker-owned caches.
    pub fn adopt_best(&mut self, pic: &RasterPicture, cost: f64) {
        let mut adopted = pic.clone();
        adopted.uncache_all();
        adopted.recache_all(&mut self.seq_cache);
        self.best_pic = adopted;
        self.best_cost = cost;
    }

    /// Rehash and intern any line of `pic` whose identity was invalidated.
    pub fn recache_picture(&mut self, pic: &mut RasterPicture) {
        pic.recache_dirty(&mut self.seq_cache);
    }

    // ========================================
    // Cache memory policy
    // ========================================

    /// Bytes held by this worker's arena and cache structures.
    pub fn cache_memory(&self) -> usize {
        let mut total = self.arena.size() + self.seq_cache.heap_bytes();
        for c in &self.line_caches {
            total += c.heap_bytes();
        }
        for c in &self.line_caches_dual {
            total += c.heap_bytes();
        }
        total
    }

    /// Apply the memory policy when the budget is exceeded: first evict
    /// the least-recently-used quarter of the per-line caches; if usage
    /// is still above 90% of the budget, clear everything and re-intern
    /// the local best program. Returns true after a full clear.
    pub fn enforce_cache_budget(&mut self, mut candidate: Option<&mut RasterPicture>) -> bool {
        if self.cache_memory() <= self.cache_budget {
            return false;
        }

        // Mass clears are expensive; stagger them across workers. Each
        // worker still only touches its own caches.
        let shared = Arc::clone(&self.shared);
        let _guard = shared.cache_clear.lock().unwrap();
        if self.cache_memory() <= self.cache_budget {
            return false;
        }

        let lines_to_clear = (self.height() / 4).max(1);
        let mut cleared = 0;
        while cleared < lines_to_clear {
            let Some(y) = self.lru.pop_front() else { break };
            self.lru_set.remove(&y);
            self.line_caches[y].clear();
            if y < self.line_caches_dual.len() {
                self.line_caches_dual[y].clear();
            }
            cleared += 1;
        }

        if self.cache_memory() as f64 > self.cache_budget as f64 * 0.9 {
            self.seq_cache.clear();
            for c in &mut self.line_caches {
                c.clear();
            }
            for c in &mut self.line_caches_dual {
                c.clear();
            }
            self.arena.clear();
            self.lru.clear();
            self.lru_set.clear();

            // Every outstanding sequence identity is now stale.
            if let Some(pic) = candidate.as_deref_mut() {
                pic.uncache_all();
            }
            let mut best = std::mem::take(&mut self.best_pic);
            best.uncache_all();
            best.recache_all(&mut self.seq_cache);
            self.best_pic = best;

            // A budget too small even for the re-interned best program:
            // back off briefly rather than spin on clears.
            if self.cache_memory() > self.cache_budget {
                log::warn!(
                    "worker {}: cache budget of {} bytes is below the working set",
                    self.thread_id,
                    self.cache_budget
                );
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            return true;
        }
        false
    }

    /// Drop every cached result and interned sequence, e.g. when the
    /// scoring metric changes between phases.
    pub fn clear_all_caches(&mut self) {
        self.seq_cache.clear();
        for c in &mut self.line_caches {
            c.clear();
        }
        for c in &mut self.line_caches_dual {
            c.clear();
        }
        self.arena.clear();
        self.lru.clear();
        self.lru_set.clear();
        self.best_pic.uncache_all();
    }

    fn touch_lru(&mut self, y: usize) {
        if self.lru_set.contains(&y) {
            if let Some(pos) = self.lru.iter().position(|&v| v == y) {
                self.lru.remove(pos);
            }
        } else {
            self.lru_set.insert(y);
        }
        self.lru.push_back(y);

        let cap = self.height() * 2;
        while self.lru.len() > cap {
            if let Some(old) = self.lru.pop_front() {
                self.lru_set.remove(&old);
            }
        }
    }

    // ========================================
    // Machine state helpers
    // ========================================

    fn capture_state(&self) -> RegisterState {
        let mut rs = RegisterState {
            a: self.reg_a,
            x: self.reg_x,
            y: self.reg_y,
            mem: [0; REG_COUNT],
        };
        rs.mem.copy_from_slice(&self.mem_regs[..REG_COUNT]);
        rs
    }

    fn apply_state(&mut self, rs: &RegisterState) {
        self.reg_a = rs.a;
        self.reg_x = rs.x;
        self.reg_y = rs.y;
        self.mem_regs[..REG_COUNT].copy_from_slice(&rs.mem);
    }

    fn store_line_regs(&mut self) {
        self.saved_state = self.capture_state();
    }

    fn restore_line_regs(&mut self) {
        let saved = self.saved_state;
        self.apply_state(&saved);
    }

    /// Rebuild the per-position sprite trigger mask from the current HPOS
    /// registers.
    fn reset_shift_starts(&mut self) {
        self.sprite_start = [0; 256];
        for sprite in 0..4 {
            let pos = self.mem_regs[Target::Hposp0.index() + sprite] as usize;
            self.sprite_start[pos] |= 1 << sprite;
        }
    }

    /// Latch a sprite's position into its shift register when the beam
    /// reaches it, accounting for pixels already emitted from the old
    /// position.
    fn start_sprite_shift(&mut self, sprite: usize) {
        let pos = self.mem_regs[Target::Hposp0.index() + sprite];
        let overlap = pos.wrapping_sub(self.sprite_shift_pos[sprite]);
        self.sprite_shift_emitted[sprite] = if overlap > 0 && (overlap as i32) < SPRITE_WIDTH {
            overlap
        } else {
            SPRITE_WIDTH as u8
        };
        self.sprite_shift_pos[sprite] = pos;
    }

    /// Retire one instruction at beam position `sprite_check_x`.
    fn execute_instruction(
        &mut self,
        instr: Instruction,
        sprite_check_x: i32,
        y: usize,
        line_error: &mut f64,
    ) {
        let value = match instr.opcode {
            Opcode::Lda => {
                self.reg_a = instr.value;
                return;
            }
            Opcode::Ldx => {
                self.reg_x = instr.value;
                return;
            }
            Opcode::Ldy => {
                self.reg_y = instr.value;
                return;
            }
            Opcode::Nop => return,
            Opcode::Sta => self.reg_a,
            Opcode::Stx => self.reg_x,
            Opcode::Sty => self.reg_y,
        };

        let slot = instr.target.index();
        if instr.target.is_sprite_pos() {
            let sprite = slot - Target::Hposp0.index();
            let old = self.mem_regs[slot] as i32;
            let new = value as i32;
            let visible_left = SPRITE_SCREEN_OFFSET - SPRITE_WIDTH;
            let visible_right = SPRITE_SCREEN_OFFSET + SCREEN_WIDTH as i32 - 1;

            // A position change within 5-6 colour clocks of where the old
            // or new position paints relies on latch behaviour the target
            // platform does not reproduce; penalise both ends.
            if old != new && new >= visible_left && new <= visible_right {
                let any_lit = self.sprites[y][sprite].iter().any(|&b| b);
                if any_lit && old - sprite_check_x <= 6 && old - sprite_check_x > 0 {
                    // too late to stop the display at the old position
                    *line_error += HPOS_HAZARD_PENALTY;
                }
                if any_lit && new - sprite_check_x <= 6 && new - sprite_check_x > 0 {
                    // too late to arm the display at the new position
                    *line_error += HPOS_HAZARD_PENALTY;
                }
            }

            self.sprite_start[self.mem_regs[slot] as usize] &= !(1 << sprite);
            self.mem_regs[slot] = value;
            self.sprite_start[value as usize] |= 1 << sprite;
        } else {
            self.mem_regs[slot] = value;
        }
    }

    /// Rewrite stores hitting registers the on/off map disables into
    /// no-writes, and zero disabled initial registers.
    fn turn_off_registers(&self, pic: &mut RasterPicture) {
        let Some(onoff) = &self.ctx.onoff else {
            return;
        };

        for i in 0..REG_COUNT {
            if !onoff.allows_index(0, i) {
                pic.reg_init[i] = 0;
            }
        }

        for (y, line) in pic.lines.iter_mut().enumerate() {
            for instr in &mut line.instructions {
                let idx = instr.target.index();
                if idx < REG_COUNT && !onoff.allows_index(y, idx) {
                    instr.target = Target::Hitclr;
                }
            }
        }
    }

    // ========================================
    // Pixel selection
    // ========================================

    /// Pick the colour register whose colour is closest to the target at
    /// pixel `x`. Sprites take priority 0..3 over the playfield; a sprite
    /// pixel already lit wins outright. Lights a sprite bit (requesting a
    /// line restart) when a sprite wins a pixel it has not yet claimed.
    fn select_register(
        &mut self,
        y: usize,
        pix_index: usize,
        x: i32,
        restart_line: &mut bool,
    ) -> (usize, f64) {
        let mut best_reg = Target::Colbak.index();
        let mut best_dist = f64::MAX;
        let mut best_sprite_bit = 0usize;
        let mut sprite_covers_colbak = false;

        for sprite in 0..4 {
            let sprite_x = self.sprite_shift_pos[sprite] as i32 - SPRITE_SCREEN_OFFSET;
            let x_offset = x - sprite_x;
            if x_offset >= 0 && x_offset < SPRITE_WIDTH {
                let sprite_bit = (x_offset >> 2) as usize;
                sprite_covers_colbak = true;

                // Pixels of the previous position not yet shifted out
                // combine with the sprite's own memory.
                let mut leftover_pixel = false;
                let leftover = x_offset + self.sprite_shift_emitted[sprite] as i32;
                if leftover < SPRITE_WIDTH {
                    leftover_pixel = self.sprites[y][sprite][(leftover >> 2) as usize];
                }

                let slot = Target::Colpm0.index() + sprite;
                let dist = self.ctx.target.error(self.mem_regs[slot] >> 1, pix_index) as f64;
                if self.sprites[y][sprite][sprite_bit] || leftover_pixel {
                    // Later sprites are hidden below this one.
                    best_sprite_bit = sprite_bit;
                    best_reg = slot;
                    best_dist = dist;
                    break;
                }
                if dist < best_dist {
                    best_sprite_bit = sprite_bit;
                    best_reg = slot;
                    best_dist = dist;
                }
            }
        }

        // COLBAK never shows under a sprite.
        let last = if sprite_covers_colbak {
            Target::Color2.index()
        } else {
            Target::Colbak.index()
        };
        for slot in Target::Color0.index()..=last {
            let dist = self.ctx.target.error(self.mem_regs[slot] >> 1, pix_index) as f64;
            if dist < best_dist {
                best_dist = dist;
                best_reg = slot;
            }
        }

        if (Target::Colpm0.index()..=Target::Colpm3.index()).contains(&best_reg) {
            let sprite = best_reg - Target::Colpm0.index();
            if !self.sprites[y][sprite][best_sprite_bit] {
                // Previously painted background pixels may now be covered.
                *restart_line = true;
                self.sprites[y][sprite][best_sprite_bit] = true;
            }
        }

        (best_reg, best_dist)
    }

    /// Dual-objective register selection: same priority rules, with the
    /// distance replaced by the blended-pair metric against the frozen
    /// opposite frame's pixel.
    fn select_register_dual(
        &mut self,
        tables: &DualTables,
        other_idx: u8,
        y: usize,
        pix_index: usize,
        x: i32,
        restart_line: &mut bool,
    ) -> (usize, f64) {
        let mut best_reg = Target::Colbak.index();
        let mut best_dist = f64::MAX;
        let mut best_sprite_bit = 0usize;
        let mut sprite_covers_colbak = false;

        for sprite in 0..4 {
            let sprite_x = self.sprite_shift_pos[sprite] as i32 - SPRITE_SCREEN_OFFSET;
            let x_offset = x - sprite_x;
            if x_offset >= 0 && x_offset < SPRITE_WIDTH {
                let sprite_bit = (x_offset >> 2) as usize;
                sprite_covers_colbak = true;

                let mut leftover_pixel = false;
                let leftover = x_offset + self.sprite_shift_emitted[sprite] as i32;
                if leftover < SPRITE_WIDTH {
                    leftover_pixel = self.sprites[y][sprite][(leftover >> 2) as usize];
                }

                let slot = Target::Colpm0.index() + sprite;
                let self_idx = self.mem_regs[slot] >> 1;
                let dist = tables.pixel_distance(self_idx, other_idx, pix_index);
                if self.sprites[y][sprite][sprite_bit] || leftover_pixel {
                    best_sprite_bit = sprite_bit;
                    best_reg = slot;
                    best_dist = dist;
                    break;
                }
                if dist < best_dist {
                    best_sprite_bit = sprite_bit;
                    best_reg = slot;
                    best_dist = dist;
                }
            }
        }

        let last = if sprite_covers_colbak {
            Target::Color2.index()
        } else {
            Target::Colbak.index()
        };
        for slot in Target::Color0.index()..=last {
            let self_idx = self.mem_regs[slot] >> 1;
            let dist = tables.pixel_distance(self_idx, other_idx, pix_index);
            if dist < best_dist {
                best_dist = dist;
                best_reg = slot;
            }
        }

        if (Target::Colpm0.index()..=Target::Colpm3.index()).contains(&best_reg) {
            let sprite = best_reg - Target::Colpm0.index();
            if !self.sprites[y][sprite][best_sprite_bit] {
                *restart_line = true;
                self.sprites[y][sprite][best_sprite_bit] = true;
            }
        }

        (best_reg, best_dist)
    }

    // ========================================
    // Whole-frame execution
    // ========================================

    /// Execute `pic` against the single-frame objective, returning the
    /// total frame error. Painted rows, register rows and sprite memory
    /// are left in this evaluator for publication.
    pub fn execute(&mut self, pic: &mut RasterPicture) -> f64 {
        self.execute_inner(pic, None)
    }

    /// Execute `pic` against the dual blended objective. `other_rows`
    /// holds the frozen opposite frame's colour-index rows (an empty row
    /// is treated as all-zero); `mutate_b` states which frame `pic` is,
    /// selecting the generation counter that invalidates the dual caches.
    pub fn execute_dual(
        &mut self,
        pic: &mut RasterPicture,
        tables: &Arc<DualTables>,
        other_rows: &[Vec<u8>],
        mutate_b: bool,
    ) -> f64 {
        if self.line_caches_dual.len() != self.height() {
            self.line_caches_dual = (0..self.height()).map(|_| LineCache::new()).collect();
        }

        // Dual cache entries embed the opposite frame's pixels; a new
        // opposite generation invalidates all of them.
        let other_gen = if mutate_b {
            self.shared.gen_a.load(Ordering::Acquire)
        } else {
            self.shared.gen_b.load(Ordering::Acquire)
        };
        if self.dual_gen_seen != other_gen {
            for c in &mut self.line_caches_dual {
                c.clear();
            }
            self.dual_gen_seen = other_gen;
        }

        self.enforce_cache_budget(Some(pic));
        self.execute_inner(pic, Some((Arc::clone(tables), other_rows)))
    }

    fn execute_inner(
        &mut self,
        pic: &mut RasterPicture,
        dual: Option<(Arc<DualTables>, &[Vec<u8>])>,
    ) -> f64 {
        let width = self.width();
        let height = self.height();
        let use_dual_cache = dual.is_some();
        debug_assert_eq!(pic.height(), height);

        self.reg_a = 0;
        self.reg_x = 0;
        self.reg_y = 0;
        if self.ctx.onoff.is_some() {
            self.turn_off_registers(pic);
        }
        self.sprite_shift_pos = [0; 4];
        self.mem_regs.copy_from_slice(&pic.reg_init);
        for row in &mut self.sprites {
            *row = [[false; 8]; 4];
        }

        let mut restart = false;
        let mut shift_dirty = true;
        let mut total_error = 0f64;
        let mut restarts_this_line = 0u32;

        let mut y = 0usize;
        while y < height {
            if restart {
                self.restore_line_regs();
                shift_dirty = true;
            } else {
                self.store_line_regs();
                restarts_this_line = 0;
            }

            let line = &mut pic.lines[y];
            let seq = match line.cache_key {
                Some(id) => id,
                None => {
                    line.rehash();
                    line.recache(&mut self.seq_cache)
                }
            };
            let key = LineCacheKey {
                entry: self.capture_state(),
                seq,
            };
            let hash = key.hash();

            let cached = if use_dual_cache {
                self.line_caches_dual[y].find(&key, hash).copied()
            } else {
                self.line_caches[y].find(&key, hash).copied()
            };
            if let Some(hit) = cached {
                self.apply_state(&hit.exit);
                self.sprites[y] = hit.sprites;
                self.painted[y].copy_from_slice(self.arena.row(hit.color_row));
                self.painted_targets[y].copy_from_slice(self.arena.row(hit.target_row));
                shift_dirty = true;
                self.touch_lru(y);
                total_error += hit.line_error;
                y += 1;
                continue;
            }

            if shift_dirty {
                shift_dirty = false;
                self.reset_shift_starts();
            }

            let insn_count = pic.lines[y].instructions.len();
            let mut restart_line = false;
            let mut ip = 0usize;
            let mut cycle = 0usize;
            let mut next_offset = if insn_count == 0 {
                OFFSET_END
            } else {
                cycle_offset(0)
            };
            self.sprite_shift_pos = [0; 4];

            let row_index = width * y;
            let mut line_error = 0f64;

            for x in -SPRITE_SCREEN_OFFSET..176 {
                let sprite_check_x = x + SPRITE_SCREEN_OFFSET;
                let mask = self.sprite_start[sprite_check_x as usize];
                if mask != 0 {
                    for sprite in 0..4 {
                        if mask & (1 << sprite) != 0 {
                            self.start_sprite_shift(sprite);
                        }
                    }
                }

                while next_offset < x && ip < insn_count {
                    let instr = pic.lines[y].instructions[ip];
                    ip += 1;
                    self.execute_instruction(instr, sprite_check_x, y, &mut line_error);
                    cycle += instr.cycles() as usize;
                    next_offset = cycle_offset(cycle);
                    if ip >= insn_count {
                        next_offset = OFFSET_END;
                    }
                }

                if x >= 0 && (x as usize) < width {
                    let pix = row_index + x as usize;
                    let (slot, dist) = match &dual {
                        Some((tables, other_rows)) => {
                            let other_row = &other_rows[y];
                            let other_idx = if other_row.is_empty() {
                                0
                            } else {
                                other_row[x as usize]
                            };
                            let tables = Arc::clone(tables);
                            self.select_register_dual(
                                &tables,
                                other_idx,
                                y,
                                pix,
                                x,
                                &mut restart_line,
                            )
                        }
                        None => self.select_register(y, pix, x, &mut restart_line),
                    };
                    line_error += dist;
                    self.painted[y][x as usize] = self.mem_regs[slot] >> 1;
                    self.painted_targets[y][x as usize] = slot as u8;
                }
            }

            if restart_line {
                restart = true;
                restarts_this_line += 1;
                debug_assert!(
                    restarts_this_line <= MAX_LINE_RESTARTS,
                    "line restart exceeded the sprite bit budget"
                );
                continue;
            }

            restart = false;
            total_error += line_error;

            let value = LineCacheValue {
                line_error,
                exit: self.capture_state(),
                color_row: self.arena.alloc(&self.painted[y]),
                target_row: self.arena.alloc(&self.painted_targets[y]),
                sprites: self.sprites[y],
            };
            if use_dual_cache {
                self.line_caches_dual[y].insert(key, hash, value);
            } else {
                self.line_caches[y].insert(key, hash, value);
            }
            self.touch_lru(y);
            y += 1;
        }

        total_error
    }

    /// Plateau check against the shared counters; used by the mutation
    /// engine to escalate.
    pub(crate) fn is_stuck(&self) -> bool {
        let thr = self.ctx.unstuck_after;
        if thr == 0 {
            return false;
        }
        let evals = self.shared.evaluations.load(Ordering::Relaxed);
        let last = self.shared.last_best_evaluation.load(Ordering::Relaxed);
        evals > last && evals - last >= thr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::palette::{DistanceMetric, Rgb};
    use crate::program::{Instruction, Opcode, RasterLine};

    fn context_for(pixels: Vec<Rgb>, width: usize, height: usize) -> Arc<EvalContext> {
        let palette = Palette::grayscale();
        let target = TargetImage::new(width, height, pixels, &palette, DistanceMetric::Euclidean);
        Arc::new(EvalContext {
            target,
            palette,
            onoff: None,
            thread_count: 1,
            unstuck_after: 0,
        })
    }

    fn evaluator_for(ctx: Arc<EvalContext>) -> Evaluator {
        let cfg = OptimizerConfig::default();
        let shared = Arc::new(SharedState::new(&cfg, ctx.target.height(), ctx.target.width()));
        Evaluator::new(0, 42, 16 * 1024 * 1024, ctx, shared)
    }

    fn line_of(insns: &[(Opcode, u8, Target)]) -> RasterLine {
        let mut line = RasterLine::new();
        for &(op, v, t) in insns {
            line.push(Instruction::new(op, v, t));
        }
        line.rehash();
        line
    }

    #[test]
    fn test_store_paints_loaded_color() {
        // One line, four pixels of palette entry 2; program loads register
        // byte 4 (entry 2) into COLOR0 before the visible area.
        let palette = Palette::grayscale();
        let ctx = context_for(vec![palette.color(2); 4], 4, 1);
        let mut ev = evaluator_for(ctx);

        let mut pic = RasterPicture::new(1);
        pic.lines[0] = line_of(&[
            (Opcode::Lda, 0x04, Target::Color0),
            (Opcode::Sta, 0x04, Target::Color0),
        ]);

        let err = ev.execute(&mut pic);
        assert_eq!(err, 0.0);
        assert_eq!(ev.painted()[0], vec![2, 2, 2, 2]);
        assert_eq!(
            ev.painted_targets()[0],
            vec![Target::Color0.index() as u8; 4]
        );
    }

    #[test]
    fn test_empty_line_paints_from_initial_registers() {
        let palette = Palette::grayscale();
        let ctx = context_for(vec![palette.color(0); 4], 4, 1);
        let mut ev = evaluator_for(ctx);

        let mut pic = RasterPicture::new(1);
        // No instructions at all; every register holds zero.
        let err = ev.execute(&mut pic);
        assert_eq!(err, 0.0);
        assert_eq!(ev.painted()[0], vec![0, 0, 0, 0]);
        // All registers tie at distance zero; the scan order makes the
        // first playfield register win the tie.
        assert_eq!(
            ev.painted_targets()[0],
            vec![Target::Color0.index() as u8; 4]
        );
    }

    #[test]
    fn test_cache_hit_reproduces_result() {
        let palette = Palette::grayscale();
        let ctx = context_for(vec![palette.color(9); 8], 8, 1);
        let mut ev = evaluator_for(ctx);

        let mut pic = RasterPicture::new(1);
        pic.lines[0] = line_of(&[
            (Opcode::Lda, 40, Target::Color1),
            (Opcode::Sta, 40, Target::Color1),
        ]);

        let first = ev.execute(&mut pic);
        let painted = ev.painted()[0].clone();
        let targets = ev.painted_targets()[0].clone();

        // Same entry state and sequence identity: the second run must hit
        // the cache and reproduce everything bit for bit.
        let second = ev.execute(&mut pic);
        assert_eq!(first, second);
        assert_eq!(ev.painted()[0], painted);
        assert_eq!(ev.painted_targets()[0], targets);
    }

    #[test]
    fn test_register_state_carries_across_lines() {
        let palette = Palette::grayscale();
        let ctx = context_for(vec![palette.color(30); 8], 4, 2);
        let mut ev = evaluator_for(ctx);

        let mut pic = RasterPicture::new(2);
        // Line 0 sets COLOR0 to entry 30; line 1 is empty and must still
        // paint with the carried-over register.
        pic.lines[0] = line_of(&[
            (Opcode::Lda, 60, Target::Color0),
            (Opcode::Sta, 60, Target::Color0),
        ]);

        let err = ev.execute(&mut pic);
        assert_eq!(err, 0.0);
        assert_eq!(ev.painted()[1], vec![30; 4]);
    }

    #[test]
    fn test_hitclr_store_discards_value() {
        let palette = Palette::grayscale();
        let ctx = context_for(vec![palette.color(0); 4], 4, 1);
        let mut ev = evaluator_for(ctx);

        let mut pic = RasterPicture::new(1);
        pic.lines[0] = line_of(&[
            (Opcode::Lda, 0xFE, Target::Hitclr),
            (Opcode::Sta, 0xFE, Target::Hitclr),
        ]);

        let err = ev.execute(&mut pic);
        // Nothing visible changed; the playfield still paints entry 0.
        assert_eq!(err, 0.0);
        assert_eq!(ev.painted()[0], vec![0; 4]);
    }

    #[test]
    fn test_onoff_map_disables_store() {
        let palette = Palette::grayscale();
        let target = TargetImage::new(
            4,
            1,
            vec![palette.color(0); 4],
            &palette,
            DistanceMetric::Euclidean,
        );
        let onoff = OnOffMap::parse("COLOR0 OFF 0 0\n", 1).unwrap();
        let ctx = Arc::new(EvalContext {
            target,
            palette,
            onoff: Some(onoff),
            thread_count: 1,
            unstuck_after: 0,
        });
        let mut ev = evaluator_for(ctx);

        let mut pic = RasterPicture::new(1);
        pic.lines[0] = line_of(&[
            (Opcode::Lda, 0x10, Target::Color0),
            (Opcode::Sta, 0x10, Target::Color0),
        ]);

        ev.execute(&mut pic);
        // The store was rewritten to the discard slot.
        assert_eq!(pic.lines[0].instructions[1].target, Target::Hitclr);
        assert_eq!(ev.painted()[0], vec![0; 4]);
    }

    #[test]
    fn test_sprite_restart_lights_bits_and_terminates() {
        let palette = Palette::grayscale();
        // Target: bright band where the sprite sits, black elsewhere.
        let mut pixels = vec![palette.color(0); 160];
        for px in pixels.iter_mut().take(84).skip(52) {
            *px = palette.color(127);
        }
        let ctx = context_for(pixels, 160, 1);
        let mut ev = evaluator_for(ctx);

        let mut pic = RasterPicture::new(1);
        // Sprite 0 bright, parked over the band; playfield all dark.
        pic.reg_init[Target::Colpm0.index()] = 254;
        pic.reg_init[Target::Hposp0.index()] = 100;
        pic.lines[0] = line_of(&[(Opcode::Nop, 0, Target::Colbak)]);

        let err = ev.execute(&mut pic);
        // The sprite won its pixels, which required restarting the line
        // to claim them; afterwards every covered quad is lit.
        assert!(ev.sprites()[0][0].iter().any(|&b| b));
        assert_eq!(err, 0.0);
        for x in 52..84 {
            assert_eq!(ev.painted()[0][x], 127);
        }
    }

    #[test]
    fn test_hpos_hazard_penalty_applied_twice() {
        let (old_pos, new_pos) = (126i32, 128i32);

        let palette = Palette::grayscale();
        // Bright band where the sprite sits after the move so the sprite
        // wins pixels there (lighting bits via restart); black elsewhere.
        let band = (new_pos - SPRITE_SCREEN_OFFSET) as usize;
        let mut pixels = vec![palette.color(0); 160];
        for px in pixels
            .iter_mut()
            .take(band + SPRITE_WIDTH as usize)
            .skip(band)
        {
            *px = palette.color(127);
        }
        let ctx = context_for(pixels, 160, 1);

        // Find NOP padding so the move retires with both the old and the
        // new position 1..=6 clocks ahead of the beam.
        let mut padding = None;
        for n in 0..20usize {
            let retire_x = cycle_offset(2 * n + 2) + 1;
            let check = retire_x + SPRITE_SCREEN_OFFSET;
            if old_pos - check > 0
                && old_pos - check <= 6
                && new_pos - check > 0
                && new_pos - check <= 6
            {
                padding = Some(n);
                break;
            }
        }
        let padding = padding.expect("a padding length lands in the hazard window");

        let mut ev = evaluator_for(ctx);
        let mut pic = RasterPicture::new(1);
        pic.reg_init[Target::Colpm0.index()] = 254;
        pic.reg_init[Target::Hposp0.index()] = old_pos as u8;
        let mut insns = vec![(Opcode::Nop, 0u8, Target::Colbak); padding];
        insns.push((Opcode::Lda, new_pos as u8, Target::Hposp0));
        insns.push((Opcode::Sta, new_pos as u8, Target::Hposp0));
        pic.lines[0] = line_of(&insns);

        let err = ev.execute(&mut pic);
        // First pass lights the sprite bits and restarts; the re-run sees
        // a visible sprite moved inside the latch window at both the old
        // and the new position.
        assert_eq!(err, 2.0 * HPOS_HAZARD_PENALTY);
    }

    #[test]
    fn test_evaluations_deterministic_for_same_program() {
        let palette = Palette::grayscale();
        let ctx = context_for(vec![palette.color(64); 160 * 4], 160, 4);

        let mut pic = RasterPicture::new(4);
        for y in 0..4 {
            pic.lines[y] = line_of(&[
                (Opcode::Lda, (y as u8) * 8, Target::Color0),
                (Opcode::Sta, (y as u8) * 8, Target::Color0),
                (Opcode::Ldx, 128, Target::Colbak),
                (Opcode::Stx, 128, Target::Colbak),
            ]);
        }

        let mut ev1 = evaluator_for(Arc::clone(&ctx));
        let mut ev2 = evaluator_for(ctx);
        let mut pic2 = pic.clone();
        assert_eq!(ev1.execute(&mut pic), ev2.execute(&mut pic2));
    }
}
