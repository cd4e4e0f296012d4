// Initial raster picture builders
//
// The optimiser needs somewhere to start. An empty program is the safest
// baseline; the random builder seeds every line with colours sampled from
// the target so the first accepted costs are not absurd; the low-colour
// builder just parks the target's dominant colours in the playfield
// registers.

use crate::palette::PALETTE_SIZE;
use crate::program::{Instruction, Opcode, RasterPicture, Target};
use crate::rng::XorShift;
use crate::target::TargetImage;

/// One NOP per line, all registers zero.
pub fn empty_picture(height: usize) -> RasterPicture {
    let mut pic = RasterPicture::new(height);
    for line in &mut pic.lines {
        line.push(Instruction::new(Opcode::Nop, 0, Target::Colbak));
        line.rehash();
    }
    pic
}

/// Empty program with the playfield registers preloaded with the target's
/// four most frequent colours.
pub fn low_color_picture(target: &TargetImage, height: usize) -> RasterPicture {
    let mut pic = empty_picture(height);

    let mut histogram = [0usize; PALETTE_SIZE];
    for y in 0..target.height() {
        for x in 0..target.width() {
            histogram[target.nearest_index(x, y) as usize] += 1;
        }
    }
    let mut by_count: Vec<(usize, usize)> = histogram
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0)
        .map(|(idx, &count)| (count, idx))
        .collect();
    by_count.sort_unstable_by(|a, b| b.cmp(a));

    for (slot, (_, idx)) in by_count.iter().take(4).enumerate() {
        pic.reg_init[Target::Color0.index() + slot] = (*idx as u8) * 2;
    }
    pic
}

/// Random program: sprites parked over sampled target columns and every
/// line loading sampled target colours into the playfield registers.
pub fn random_picture(target: &TargetImage, rng: &mut XorShift) -> RasterPicture {
    use crate::program::SPRITE_SCREEN_OFFSET;

    let height = target.height();
    let width = target.width();
    let mut pic = RasterPicture::new(height);

    for sprite in 0..4 {
        let x = rng.rand(width);
        pic.reg_init[Target::Colpm0.index() + sprite] = target.nearest_reg_value(x, 0);
        pic.reg_init[Target::Hposp0.index() + sprite] =
            (x as i32 + SPRITE_SCREEN_OFFSET) as u8;
    }

    let playfield = [
        (Opcode::Lda, Opcode::Sta, Target::Color0),
        (Opcode::Ldx, Opcode::Stx, Target::Color1),
        (Opcode::Ldy, Opcode::Sty, Target::Color2),
        (Opcode::Lda, Opcode::Sta, Target::Colbak),
    ];

    for y in 0..height {
        let line = &mut pic.lines[y];
        for &(load, store, reg) in &playfield {
            let x = rng.rand(width);
            line.push(Instruction::new(load, target.nearest_reg_value(x, y), reg));
            line.push(Instruction::new(
                store,
                (rng.rand(128) * 2) as u8,
                reg,
            ));
        }
        line.rehash();
    }
    pic
}
