// Output module - serialisation of finished solutions
//
// Writes the artefacts a conversion run leaves behind: the raster program
// as an assembler listing (plus its register-init companion), the sprite
// memory as PMG data, packed screen data, the statistics CSV and a PNG
// preview of the painted result. The listing parser exists so a saved run
// can be reloaded and re-scored.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::cache::line::SpriteRowBits;
use crate::palette::{Palette, Rgb};
use crate::program::{Instruction, Opcode, RasterPicture, RasterLine, Target, FREE_CYCLES, REG_COUNT};
use crate::stats::{normalize_score, StatPoint};
use crate::target::MAX_HEIGHT;

/// Errors that can occur while writing or reading output files.
#[derive(Debug)]
pub enum OutputError {
    /// I/O error
    Io(io::Error),

    /// PNG encoding error
    PngEncoding(png::EncodingError),

    /// Listing parse failure: line number and content
    Parse(usize, String),
}

impl std::fmt::Display for OutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputError::Io(e) => write!(f, "I/O error: {}", e),
            OutputError::PngEncoding(e) => write!(f, "PNG encoding error: {}", e),
            OutputError::Parse(n, line) => write!(f, "listing line {}: cannot parse '{}'", n, line),
        }
    }
}

impl std::error::Error for OutputError {}

impl From<io::Error> for OutputError {
    fn from(e: io::Error) -> Self {
        OutputError::Io(e)
    }
}

impl From<png::EncodingError> for OutputError {
    fn from(e: png::EncodingError) -> Self {
        OutputError::PngEncoding(e)
    }
}

/// Provenance recorded in listing headers.
pub struct ProgramHeader {
    pub input_file: String,
    pub evaluations: u64,
    pub score: f64,
    pub seed: u64,
}

const BANNER: &str = "; ---------------------------------- \n";

/// Write the raster program listing to `path` and the register-init
/// companion to `path` + ".ini".
pub fn save_raster_program(
    path: impl AsRef<Path>,
    pic: &RasterPicture,
    header: &ProgramHeader,
) -> Result<(), OutputError> {
    let path = path.as_ref();

    // Companion file: initial register values.
    let mut ini_path = path.as_os_str().to_owned();
    ini_path.push(".ini");
    let mut ini = BufWriter::new(fs::File::create(ini_path)?);
    write!(ini, "{}", BANNER)?;
    writeln!(ini, "; raster-rs")?;
    write!(ini, "{}", BANNER)?;
    writeln!(ini, "\n; Initial values ")?;
    for slot in 0..REG_COUNT {
        writeln!(ini, "\tlda #${:02X}", pic.reg_init[slot])?;
        writeln!(ini, "\tsta {}", Target::from_index(slot).name())?;
    }
    writeln!(ini, "\tlda #$0")?;
    writeln!(ini, "\ttax")?;
    writeln!(ini, "\ttay")?;
    writeln!(ini, "\n; Set proper count of wsyncs ")?;
    writeln!(ini, "\n\t:2 sta wsync")?;
    writeln!(ini, "\n; Set proper picture height")?;
    writeln!(ini, "\n\nPIC_HEIGHT = {}", pic.height())?;
    ini.flush()?;

    // Main listing.
    let mut out = BufWriter::new(fs::File::create(path)?);
    write!(out, "{}", BANNER)?;
    writeln!(out, "; raster-rs")?;
    writeln!(out, "; InputName: {}", header.input_file)?;
    writeln!(out, "; Created: {}", chrono::Local::now().to_rfc3339())?;
    writeln!(out, "; Evaluations: {}", header.evaluations)?;
    writeln!(out, "; Score: {}", header.score)?;
    writeln!(out, "; Seed: {}", header.seed)?;
    write!(out, "{}", BANNER)?;

    writeln!(out, "; Proper offset ")?;
    for _ in 0..4 {
        writeln!(out, "\tnop")?;
    }
    writeln!(out, "\tcmp byt2;")?;

    for (y, line) in pic.lines.iter().enumerate() {
        writeln!(out, "line{}", y)?;
        for instr in &line.instructions {
            write_instruction(&mut out, instr)?;
        }
        // Pad to the cycle budget so every line takes the same time.
        let mut cycle = line.cycles;
        while cycle < FREE_CYCLES {
            writeln!(out, "\tnop ; filler")?;
            cycle += 2;
        }
        writeln!(out, "\tcmp byt2; on zero page so 3 cycles")?;
    }
    write!(out, "{}", BANNER)?;
    out.flush()?;
    Ok(())
}

fn write_instruction(out: &mut impl Write, instr: &Instruction) -> Result<(), OutputError> {
    if instr.opcode.is_store() {
        writeln!(out, "\t{} {}", instr.opcode.mnemonic(), instr.target.name())?;
    } else if instr.opcode == Opcode::Nop {
        writeln!(out, "\tnop ")?;
    } else {
        writeln!(
            out,
            "\t{} #${:02X} ; {} (spr={})",
            instr.opcode.mnemonic(),
            instr.value,
            instr.value,
            instr.value as i32 - 48
        )?;
    }
    Ok(())
}

/// Parse a raster program listing produced by [`save_raster_program`].
/// Filler padding and scaffolding are skipped; the instruction sequences
/// and their order come back exactly as saved.
pub fn parse_raster_program(text: &str) -> Result<RasterPicture, OutputError> {
    let mut lines: Vec<RasterLine> = Vec::new();
    let mut current: Option<RasterLine> = None;

    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("line") {
            if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
                if let Some(done) = current.take() {
                    lines.push(done);
                }
                current = Some(RasterLine::new());
                continue;
            }
        }

        // Scaffolding around the per-line code; filler NOPs only pad the
        // cycle budget and are not part of the program.
        if line.starts_with("cmp") || line.contains("filler") {
            continue;
        }

        let Some(target_line) = current.as_mut() else {
            continue;
        };

        let mut parts = line.splitn(2, |c: char| c.is_whitespace());
        let mnemonic = parts.next().unwrap_or("");
        let operand = parts.next().unwrap_or("").trim();
        let operand = operand.split(';').next().unwrap_or("").trim();

        let instr = match mnemonic {
            "nop" => Instruction::new(Opcode::Nop, 0, Target::Colbak),
            "lda" | "ldx" | "ldy" => {
                let opcode = match mnemonic {
                    "lda" => Opcode::Lda,
                    "ldx" => Opcode::Ldx,
                    _ => Opcode::Ldy,
                };
                let value = operand
                    .strip_prefix("#$")
                    .and_then(|v| u8::from_str_radix(v, 16).ok())
                    .ok_or_else(|| OutputError::Parse(n + 1, raw.to_string()))?;
                Instruction::new(opcode, value, Target::Colbak)
            }
            "sta" | "stx" | "sty" => {
                let opcode = match mnemonic {
                    "sta" => Opcode::Sta,
                    "stx" => Opcode::Stx,
                    _ => Opcode::Sty,
                };
                let target = Target::from_name(operand)
                    .ok_or_else(|| OutputError::Parse(n + 1, raw.to_string()))?;
                Instruction::new(opcode, 0, target)
            }
            _ => return Err(OutputError::Parse(n + 1, raw.to_string())),
        };
        target_line.push(instr);
    }
    if let Some(done) = current.take() {
        lines.push(done);
    }

    let mut pic = RasterPicture::new(0);
    pic.lines = lines;
    for line in &mut pic.lines {
        line.rehash();
    }
    Ok(pic)
}

/// Parse the register-init companion written by [`save_raster_program`]
/// into `pic.reg_init`.
pub fn parse_reg_inits(text: &str, pic: &mut RasterPicture) -> Result<(), OutputError> {
    let mut pending: Option<u8> = None;
    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if let Some(value) = line.strip_prefix("lda #$") {
            pending = Some(
                u8::from_str_radix(value, 16)
                    .map_err(|_| OutputError::Parse(n + 1, raw.to_string()))?,
            );
        } else if let Some(name) = line.strip_prefix("sta ") {
            if let (Some(value), Some(target)) = (pending, Target::from_name(name.trim())) {
                if target != Target::Hitclr {
                    pic.reg_init[target.index()] = value;
                }
            }
        }
    }
    Ok(())
}

/// Write sprite memory as PMG data. Rows beyond the picture height come
/// out blank so the block always covers the full player height.
pub fn save_pmg(path: impl AsRef<Path>, sprites: &[SpriteRowBits]) -> Result<(), OutputError> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    write!(out, "{}", BANNER)?;
    writeln!(out, "; raster-rs")?;
    write!(out, "{}", BANNER)?;
    writeln!(out, "missiles")?;
    writeln!(out, "\t.ds $100")?;

    for sprite in 0..4 {
        writeln!(out, "player{}", sprite)?;
        write!(out, "\t.he 00 00 00 00 00 00 00 00")?;
        for y in 0..MAX_HEIGHT {
            let mut byte = 0u8;
            if let Some(row) = sprites.get(y) {
                for (bit, &lit) in row[sprite].iter().enumerate() {
                    if lit {
                        byte |= 1 << (7 - bit);
                    }
                }
            }
            write!(out, " {:02X}", byte)?;
            if y % 16 == 7 {
                write!(out, "\n\t.he")?;
            }
        }
        writeln!(out, " 00 00 00 00 00 00 00 00")?;
    }
    out.flush()?;
    Ok(())
}

/// Playfield code of a painted register row entry: COLBAK 0, COLOR0..2
/// 1..3, sprites fold to 0.
fn playfield_code(target_index: u8) -> u8 {
    match Target::from_index(target_index as usize) {
        Target::Color0 => 1,
        Target::Color1 => 2,
        Target::Color2 => 3,
        _ => 0,
    }
}

/// Pack the painted register rows four pixels per byte.
pub fn save_screen_data(
    path: impl AsRef<Path>,
    painted_targets: &[Vec<u8>],
) -> Result<(), OutputError> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for row in painted_targets {
        for quad in row.chunks(4) {
            let mut byte = 0u8;
            for (i, &t) in quad.iter().enumerate() {
                byte |= playfield_code(t) << (6 - 2 * i);
            }
            out.write_all(&[byte])?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Write the statistics stream as CSV with normalised scores.
pub fn save_statistics(
    path: impl AsRef<Path>,
    statistics: &[StatPoint],
    width: usize,
    height: usize,
) -> Result<(), OutputError> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    writeln!(out, "evaluations,seconds,distance")?;
    for point in statistics {
        writeln!(
            out,
            "{},{},{:.6}",
            point.evaluations,
            point.seconds,
            normalize_score(point.distance, width, height)
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Convert painted colour-index rows to RGB through the palette.
pub fn painted_to_rgb(painted: &[Vec<u8>], palette: &Palette) -> Vec<Vec<Rgb>> {
    painted
        .iter()
        .map(|row| row.iter().map(|&c| palette.color(c)).collect())
        .collect()
}

/// Save RGB rows as a PNG, doubling the width so the pixel aspect matches
/// the display hardware.
pub fn save_png(path: impl AsRef<Path>, rows: &[Vec<Rgb>]) -> Result<(), OutputError> {
    let height = rows.len();
    let width = rows.first().map(|r| r.len()).unwrap_or(0);

    let mut data = Vec::with_capacity(width * 2 * height * 3);
    for row in rows {
        for px in row {
            for _ in 0..2 {
                data.extend_from_slice(&[px.r, px.g, px.b]);
            }
        }
    }

    let file = fs::File::create(path)?;
    let w = BufWriter::new(file);
    let mut encoder = png::Encoder::new(w, (width * 2) as u32, height as u32);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&data)?;
    Ok(())
}
