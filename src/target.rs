// Target module - the image being approximated and its precomputed tables
//
// The optimiser never touches raw RGB during evaluation. Everything it
// needs is precomputed here once: per-pixel distance to every palette
// entry, the nearest palette index per pixel (feeding mutations), and the
// per-line sets of colours that actually occur (feeding value sampling).

use std::fs;
use std::io;
use std::path::Path;

use crate::palette::{DistanceMetric, Palette, Rgb, PALETTE_SIZE};
use crate::program::{Target, MEM_SLOTS};

/// Fixed playfield width of the display mode.
pub const SCREEN_WIDTH: usize = 160;

/// Maximum scanline count the sprite memory covers.
pub const MAX_HEIGHT: usize = 240;

/// The target picture with every table candidate scoring reads.
pub struct TargetImage {
    width: usize,
    height: usize,
    pixels: Vec<Rgb>,
    /// `errors[c][y * width + x]` = distance from pixel to palette entry `c`.
    errors: Vec<Vec<f32>>,
    /// Closest palette index per pixel under the active metric.
    nearest: Vec<u8>,
    /// Per line: register bytes (index << 1) of colours present on the line.
    possible_colors: Vec<Vec<u8>>,
    metric: DistanceMetric,
}

impl TargetImage {
    /// Precompute all scoring tables for `pixels` (row-major, `width *
    /// height` entries).
    pub fn new(
        width: usize,
        height: usize,
        pixels: Vec<Rgb>,
        palette: &Palette,
        metric: DistanceMetric,
    ) -> TargetImage {
        assert_eq!(pixels.len(), width * height, "pixel count mismatch");

        let mut errors: Vec<Vec<f32>> = Vec::with_capacity(PALETTE_SIZE);
        for c in 0..PALETTE_SIZE {
            let entry = palette.color(c as u8);
            errors.push(
                pixels
                    .iter()
                    .map(|p| metric.distance(*p, entry) as f32)
                    .collect(),
            );
        }

        let mut nearest = Vec::with_capacity(pixels.len());
        for pix in 0..pixels.len() {
            let mut best = 0u8;
            let mut best_dist = f32::MAX;
            for (c, table) in errors.iter().enumerate() {
                if table[pix] < best_dist {
                    best_dist = table[pix];
                    best = c as u8;
                }
            }
            nearest.push(best);
        }

        let mut possible_colors = Vec::with_capacity(height);
        for y in 0..height {
            let mut regs: Vec<u8> = nearest[y * width..(y + 1) * width]
                .iter()
                .map(|&c| c * 2)
                .collect();
            regs.sort_unstable();
            regs.dedup();
            possible_colors.push(regs);
        }

        TargetImage {
            width,
            height,
            pixels,
            errors,
            nearest,
            possible_colors,
            metric,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> Rgb {
        self.pixels[y * self.width + x]
    }

    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    /// Distance from the pixel at flat index `pix` to palette entry `c`.
    #[inline]
    pub fn error(&self, c: u8, pix: usize) -> f32 {
        self.errors[(c as usize) & (PALETTE_SIZE - 1)][pix]
    }

    /// Closest palette index for pixel `(x, y)`.
    #[inline]
    pub fn nearest_index(&self, x: usize, y: usize) -> u8 {
        self.nearest[y * self.width + x]
    }

    /// Register byte (`index << 1`) of the closest palette entry.
    #[inline]
    pub fn nearest_reg_value(&self, x: usize, y: usize) -> u8 {
        self.nearest_index(x, y) * 2
    }

    /// Register bytes of the colours that occur on line `y`.
    pub fn possible_colors(&self, y: usize) -> &[u8] {
        &self.possible_colors[y]
    }
}

/// Errors raised while loading an on/off map.
#[derive(Debug)]
pub enum OnOffError {
    /// I/O error
    Io(io::Error),

    /// Parse failure: line number and content
    Parse(usize, String),

    /// Line range exceeds the picture height
    RangeOutOfBounds(usize, String),
}

impl std::fmt::Display for OnOffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnOffError::Io(e) => write!(f, "I/O error: {}", e),
            OnOffError::Parse(n, line) => write!(f, "on/off file line {}: cannot parse '{}'", n, line),
            OnOffError::RangeOutOfBounds(n, line) => {
                write!(f, "on/off file line {}: range out of bounds in '{}'", n, line)
            }
        }
    }
}

impl std::error::Error for OnOffError {}

impl From<io::Error> for OnOffError {
    fn from(e: io::Error) -> Self {
        OnOffError::Io(e)
    }
}

/// Per-line register write enables. A `false` entry silently turns stores
/// to that register on that line into no-writes.
#[derive(Debug, Clone)]
pub struct OnOffMap {
    rows: Vec<[bool; MEM_SLOTS]>,
}

impl OnOffMap {
    /// All registers enabled on every line.
    pub fn all_on(height: usize) -> OnOffMap {
        OnOffMap {
            rows: vec![[true; MEM_SLOTS]; height],
        }
    }

    /// Load the text format: one directive per line,
    /// `REGISTER ON|OFF FROM TO` (inclusive line range).
    pub fn load(path: impl AsRef<Path>, height: usize) -> Result<OnOffMap, OnOffError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, height)
    }

    /// Parse on/off directives from `text` for a picture of `height` lines.
    pub fn parse(text: &str, height: usize) -> Result<OnOffMap, OnOffError> {
        let mut map = Self::all_on(height);

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let reg = parts.next();
            let value = parts.next();
            let from = parts.next().and_then(|v| v.parse::<usize>().ok());
            let to = parts.next().and_then(|v| v.parse::<usize>().ok());

            let (reg, value, from, to) = match (reg, value, from, to) {
                (Some(r), Some(v), Some(f), Some(t)) => (r, v, f, t),
                _ => return Err(OnOffError::Parse(n + 1, raw.to_string())),
            };

            let target = Target::from_name(reg)
                .filter(|t| *t != Target::Hitclr)
                .ok_or_else(|| OnOffError::Parse(n + 1, raw.to_string()))?;

            let on = match value.to_ascii_uppercase().as_str() {
                "ON" => true,
                "OFF" => false,
                _ => return Err(OnOffError::Parse(n + 1, raw.to_string())),
            };

            if from > to || to >= height || to >= MAX_HEIGHT {
                return Err(OnOffError::RangeOutOfBounds(n + 1, raw.to_string()));
            }

            for row in &mut map.rows[from..=to] {
                row[target.index()] = on;
            }
        }

        Ok(map)
    }

    /// Is writing `target` allowed on line `y`?
    #[inline]
    pub fn allows(&self, y: usize, target: Target) -> bool {
        self.rows[y][target.index()]
    }

    /// Is writing register slot `index` allowed on line `y`?
    #[inline]
    pub fn allows_index(&self, y: usize, index: usize) -> bool {
        self.rows[y][index]
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_image(color: Rgb, width: usize, height: usize) -> TargetImage {
        TargetImage::new(
            width,
            height,
            vec![color; width * height],
            &Palette::grayscale(),
            DistanceMetric::Euclidean,
        )
    }

    #[test]
    fn test_error_table_zero_on_exact_palette_color() {
        let palette = Palette::grayscale();
        let img = uniform_image(palette.color(17), 8, 2);
        for pix in 0..16 {
            assert_eq!(img.error(17, pix), 0.0);
        }
        assert!(img.error(16, 0) > 0.0);
    }

    #[test]
    fn test_nearest_index_matches_error_table() {
        let palette = Palette::grayscale();
        let img = uniform_image(palette.color(40), 4, 1);
        assert_eq!(img.nearest_index(0, 0), 40);
        assert_eq!(img.nearest_reg_value(3, 0), 80);
    }

    #[test]
    fn test_possible_colors_deduplicated() {
        let palette = Palette::grayscale();
        let mut pixels = vec![palette.color(3); 8];
        pixels[4] = palette.color(9);
        let img = TargetImage::new(8, 1, pixels, &palette, DistanceMetric::Euclidean);
        assert_eq!(img.possible_colors(0), &[6, 18]);
    }

    #[test]
    fn test_onoff_parse_basic() {
        let map = OnOffMap::parse("COLBAK OFF 0 4\nhposp0 off 2 2\n", 8).unwrap();
        assert!(!map.allows(0, Target::Colbak));
        assert!(!map.allows(4, Target::Colbak));
        assert!(map.allows(5, Target::Colbak));
        assert!(!map.allows(2, Target::Hposp0));
        assert!(map.allows(2, Target::Color0));
    }

    #[test]
    fn test_onoff_rejects_bad_register() {
        assert!(matches!(
            OnOffMap::parse("COLXX OFF 0 1\n", 8),
            Err(OnOffError::Parse(1, _))
        ));
    }

    #[test]
    fn test_onoff_rejects_out_of_range() {
        assert!(matches!(
            OnOffMap::parse("COLBAK OFF 0 9\n", 8),
            Err(OnOffError::RangeOutOfBounds(1, _))
        ));
    }

    #[test]
    fn test_onoff_skips_blank_lines() {
        let map = OnOffMap::parse("\n\nCOLOR0 OFF 1 1\n\n", 4).unwrap();
        assert!(!map.allows(1, Target::Color0));
    }
}
