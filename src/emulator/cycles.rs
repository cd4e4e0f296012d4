// Screen cycle table
//
// ANTIC steals bus cycles from the CPU for display fetches; the remaining
// cycles are where raster instructions can run. The steal pattern for the
// mode in use (normal width, bitmap graphics, PMG and LMS every line) is
// encoded as one character per ANTIC colour clock pair: letters are stolen
// cycles, spaces are CPU cycles. Walking the pattern yields, for each CPU
// cycle of the line, the horizontal pixel offset at which an instruction
// dispatched on that cycle becomes observable.

/// Size of the per-line cycle table.
pub const CYCLES_MAX: usize = 114;

/// ANTIC positions scanned while building the table; the tail past the
/// steal pattern models the horizontal blank before the next line.
const CYCLE_MAP_SIZE: usize = CYCLES_MAX + 9;

/// Sentinel offset meaning "no further instruction retires on this line".
pub const OFFSET_END: i32 = 1000;

const ANTIC_STEAL: &[u8] =
    b"IPPPPAA             G G GRG GRG GRG GRG GRG GRG GRG GRG GRG G G G G G G G G G G G G G G G G G G G G              M";

/// One CPU cycle's mapping onto the raster beam.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenCycle {
    /// Pixel at which the cycle completes; negative means during the
    /// previous line's horizontal blank.
    pub offset: i32,
    /// Pixel span covered until the next available CPU cycle.
    pub length: i32,
}

const fn is_stolen(c: u8) -> bool {
    matches!(c, b'G' | b'R' | b'P' | b'M' | b'I' | b'A')
}

const fn build_table() -> [ScreenCycle; CYCLES_MAX] {
    let mut table = [ScreenCycle {
        offset: 0,
        length: 0,
    }; CYCLES_MAX];

    let mut last_antic = 0usize;
    let mut cpu = 0usize;
    let mut antic = 0usize;
    while antic < CYCLE_MAP_SIZE {
        // Positions past the pattern are plain CPU cycles.
        let stolen = antic < ANTIC_STEAL.len() && is_stolen(ANTIC_STEAL[antic]);
        if !stolen {
            assert!(cpu < CYCLES_MAX);
            table[cpu].offset = (antic as i32 - 24) * 2;
            if cpu > 0 {
                table[cpu - 1].length = (antic as i32 - last_antic as i32) * 2;
            }
            last_antic = antic;
            cpu += 1;
        }
        antic += 1;
    }
    table[cpu - 1].length = (CYCLE_MAP_SIZE as i32 - 24) * 2;

    table
}

/// The per-cycle beam position table.
pub static SCREEN_CYCLES: [ScreenCycle; CYCLES_MAX] = build_table();

/// Offset for `cycle`, with out-of-range cycles mapped past the line end so
/// scheduling simply stops.
#[inline]
pub fn cycle_offset(cycle: usize) -> i32 {
    if cycle >= CYCLES_MAX {
        OFFSET_END
    } else {
        SCREEN_CYCLES[cycle].offset
    }
}

/// Pixel span of `cycle`; zero outside the table.
#[inline]
pub fn cycle_length(cycle: usize) -> i32 {
    if cycle >= CYCLES_MAX {
        0
    } else {
        SCREEN_CYCLES[cycle].length
    }
}
