// End-to-end scenario tests
//
// Small literal programs driven through the public evaluator surface:
// exact painted rows for simple programs, cache behaviour under repeated
// evaluation, and the save/reload score round trip.

mod common;

use common::{context_for_pixels, evaluator_for, line_of, uniform_context};
use raster_rs::emulator::Evaluator;
use raster_rs::output;
use raster_rs::palette::Palette;
use raster_rs::program::{Opcode, RasterPicture, Target};

#[test]
fn single_store_paints_the_whole_line() {
    // One line, four pixels of palette entry 2; the program loads the
    // register byte 4 (entry 2) into COLOR0 during horizontal blank.
    let palette = Palette::grayscale();
    let ctx = context_for_pixels(vec![palette.color(2); 4], 4, 1);
    let mut ev = evaluator_for(&ctx);

    let mut pic = RasterPicture::new(1);
    pic.lines[0] = line_of(&[
        (Opcode::Lda, 0x04, Target::Color0),
        (Opcode::Sta, 0x04, Target::Color0),
    ]);

    let err = ev.execute(&mut pic);
    assert_eq!(err, 0.0);
    assert_eq!(ev.painted()[0], vec![2; 4]);
    assert_eq!(ev.painted_targets()[0], vec![Target::Color0.index() as u8; 4]);
}

#[test]
fn empty_program_paints_background_zero() {
    let palette = Palette::grayscale();
    let ctx = context_for_pixels(vec![palette.color(0); 4], 4, 1);
    let mut ev = evaluator_for(&ctx);

    let mut pic = RasterPicture::new(1);
    let err = ev.execute(&mut pic);
    assert_eq!(err, 0.0);
    assert_eq!(ev.painted()[0], vec![0; 4]);
}

#[test]
fn repeat_evaluation_hits_the_cache_with_identical_rows() {
    let palette = Palette::grayscale();
    let ctx = uniform_context(palette.color(33), 160, 8);
    let mut ev = evaluator_for(&ctx);

    let mut pic = RasterPicture::new(8);
    for y in 0..8 {
        pic.lines[y] = line_of(&[
            (Opcode::Lda, 66, Target::Color0),
            (Opcode::Sta, 66, Target::Color0),
            (Opcode::Ldx, 40, Target::Colbak),
            (Opcode::Stx, 40, Target::Colbak),
        ]);
    }

    let first = ev.execute(&mut pic);
    let painted: Vec<Vec<u8>> = ev.painted().to_vec();
    let second = ev.execute(&mut pic);
    assert_eq!(first, second);
    assert_eq!(ev.painted(), painted.as_slice());
}

#[test]
fn unchanged_program_scores_identically_across_evaluators() {
    // A no-op "mutation": byte-identical instruction lists must evaluate
    // to the same total even on a cold evaluator.
    let palette = Palette::grayscale();
    let ctx = uniform_context(palette.color(90), 160, 6);

    let mut pic = RasterPicture::new(6);
    for y in 0..6 {
        pic.lines[y] = line_of(&[
            (Opcode::Lda, (y as u8) * 4, Target::Color1),
            (Opcode::Sta, (y as u8) * 4, Target::Color1),
        ]);
    }
    let mut clone = pic.clone();

    let mut warm = evaluator_for(&ctx);
    let mut cold = evaluator_for(&ctx);
    let a = warm.execute(&mut pic);
    let b = warm.execute(&mut pic);
    let c = cold.execute(&mut clone);
    assert_eq!(a, b);
    assert_eq!(a, c);
}

#[test]
fn saved_program_reloads_to_the_same_score() {
    let palette = Palette::grayscale();
    let ctx = uniform_context(palette.color(50), 160, 4);
    let mut ev = evaluator_for(&ctx);

    let mut pic = RasterPicture::new(4);
    pic.reg_init[Target::Color1.index()] = 100;
    pic.reg_init[Target::Colpm0.index()] = 88;
    pic.reg_init[Target::Hposp0.index()] = 120;
    for y in 0..4 {
        pic.lines[y] = line_of(&[
            (Opcode::Lda, 100, Target::Color0),
            (Opcode::Sta, 100, Target::Color0),
            (Opcode::Nop, 0, Target::Colbak),
            (Opcode::Ldy, 32, Target::Color2),
            (Opcode::Sty, 32, Target::Color2),
        ]);
    }
    let score = ev.execute(&mut pic);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("saved.rp");
    let header = output::ProgramHeader {
        input_file: "x.png".into(),
        evaluations: 1,
        score: 0.0,
        seed: 0,
    };
    output::save_raster_program(&path, &pic, &header).expect("save");

    let text = std::fs::read_to_string(&path).expect("read");
    let mut reloaded = output::parse_raster_program(&text).expect("parse");
    let ini = std::fs::read_to_string(dir.path().join("saved.rp.ini")).expect("read ini");
    output::parse_reg_inits(&ini, &mut reloaded).expect("parse ini");

    let mut fresh: Evaluator = evaluator_for(&ctx);
    let reloaded_score = fresh.execute(&mut reloaded);
    assert_eq!(score, reloaded_score);
}
