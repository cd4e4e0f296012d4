// Palette module - the 128-colour hardware palette and colour distance
//
// The display hardware addresses 128 colours; a register holds the palette
// index shifted left by one (the luma/chroma byte). Candidate scoring needs
// a scalar distance between any target pixel and any palette entry, under
// one of four metrics chosen at start-up.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Number of palette entries the hardware can address.
pub const PALETTE_SIZE: usize = 128;

/// Worst possible squared RGB distance, used to normalise scores.
pub const MAX_COLOR_DISTANCE: f64 = 255.0 * 255.0 * 3.0;

/// 8-bit RGB colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Rgb {
        Rgb { r, g, b }
    }
}

/// Colour distance metric, selected at init and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Squared distance in sRGB space.
    Euclidean,
    /// Squared distance in YUV space; tracks perceived luma errors better.
    Yuv,
    /// CIE94 delta-E squared.
    Cie94,
    /// CIEDE2000 delta-E squared.
    Ciede2000,
}

impl DistanceMetric {
    /// Parse a metric name as used on the command line.
    pub fn from_name(name: &str) -> Option<DistanceMetric> {
        match name.to_ascii_lowercase().as_str() {
            "euclid" | "euclidean" | "rgb" => Some(DistanceMetric::Euclidean),
            "yuv" => Some(DistanceMetric::Yuv),
            "cie94" => Some(DistanceMetric::Cie94),
            "ciede" | "ciede2000" => Some(DistanceMetric::Ciede2000),
            _ => None,
        }
    }

    /// Distance between two colours under this metric.
    pub fn distance(self, a: Rgb, b: Rgb) -> f64 {
        match self {
            DistanceMetric::Euclidean => euclidean_distance(a, b),
            DistanceMetric::Yuv => yuv_distance(a, b),
            DistanceMetric::Cie94 => cie94_distance(a, b),
            DistanceMetric::Ciede2000 => ciede2000_distance(a, b),
        }
    }
}

/// Convert sRGB bytes to YUV (BT.601 weights).
#[inline]
pub fn rgb_to_yuv(c: Rgb) -> (f64, f64, f64) {
    let (r, g, b) = (c.r as f64, c.g as f64, c.b as f64);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = (b - y) * 0.565;
    let v = (r - y) * 0.713;
    (y, u, v)
}

fn euclidean_distance(a: Rgb, b: Rgb) -> f64 {
    let dr = a.r as f64 - b.r as f64;
    let dg = a.g as f64 - b.g as f64;
    let db = a.b as f64 - b.b as f64;
    dr * dr + dg * dg + db * db
}

fn yuv_distance(a: Rgb, b: Rgb) -> f64 {
    let (y1, u1, v1) = rgb_to_yuv(a);
    let (y2, u2, v2) = rgb_to_yuv(b);
    (y2 - y1) * (y2 - y1) + (u2 - u1) * (u2 - u1) + (v2 - v1) * (v2 - v1)
}

/// Convert sRGB bytes to CIE L*a*b* (D65 reference white).
fn rgb_to_lab(c: Rgb) -> (f64, f64, f64) {
    fn srgb_to_linear(v: u8) -> f64 {
        let v = v as f64 / 255.0;
        if v <= 0.04045 {
            v / 12.92
        } else {
            ((v + 0.055) / 1.055).powf(2.4)
        }
    }

    let r = srgb_to_linear(c.r);
    let g = srgb_to_linear(c.g);
    let b = srgb_to_linear(c.b);

    // sRGB -> XYZ, scaled to the D65 white point
    let x = (0.4124 * r + 0.3576 * g + 0.1805 * b) / 0.95047;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = (0.0193 * r + 0.1192 * g + 0.9505 * b) / 1.08883;

    fn f(t: f64) -> f64 {
        const EPS: f64 = 216.0 / 24389.0;
        const KAPPA: f64 = 24389.0 / 27.0;
        if t > EPS {
            t.cbrt()
        } else {
            (KAPPA * t + 16.0) / 116.0
        }
    }

    let (fx, fy, fz) = (f(x), f(y), f(z));
    (116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz))
}

fn cie94_distance(c1: Rgb, c2: Rgb) -> f64 {
    let (l1, a1, b1) = rgb_to_lab(c1);
    let (l2, a2, b2) = rgb_to_lab(c2);

    let dl = l1 - l2;
    let chroma1 = (a1 * a1 + b1 * b1).sqrt();
    let chroma2 = (a2 * a2 + b2 * b2).sqrt();
    let dc = chroma1 - chroma2;
    let da = a1 - a2;
    let db = b1 - b2;
    let dh2 = (da * da + db * db - dc * dc).max(0.0);

    // Graphic-arts parametric factors: kL = 1, K1 = 0.045, K2 = 0.015
    let sc = 1.0 + 0.045 * chroma1;
    let sh = 1.0 + 0.015 * chroma1;

    let term_c = dc / sc;
    let term_h2 = dh2 / (sh * sh);
    dl * dl + term_c * term_c + term_h2
}

fn ciede2000_distance(c1: Rgb, c2: Rgb) -> f64 {
    let (l1, a1, b1) = rgb_to_lab(c1);
    let (l2, a2, b2) = rgb_to_lab(c2);

    let chroma1 = (a1 * a1 + b1 * b1).sqrt();
    let chroma2 = (a2 * a2 + b2 * b2).sqrt();
    let c_bar = (chroma1 + chroma2) / 2.0;
    let c_bar7 = c_bar.powi(7);
    let g = 0.5 * (1.0 - (c_bar7 / (c_bar7 + 25.0f64.powi(7))).sqrt());

    let a1p = (1.0 + g) * a1;
    let a2p = (1.0 + g) * a2;
    let c1p = (a1p * a1p + b1 * b1).sqrt();
    let c2p = (a2p * a2p + b2 * b2).sqrt();

    fn hue(a: f64, b: f64) -> f64 {
        if a == 0.0 && b == 0.0 {
            0.0
        } else {
            let h = b.atan2(a).to_degrees();
            if h < 0.0 {
                h + 360.0
            } else {
                h
            }
        }
    }
    let h1p = hue(a1p, b1);
    let h2p = hue(a2p, b2);

    let dlp = l2 - l1;
    let dcp = c2p - c1p;

    let dhp = if c1p * c2p == 0.0 {
        0.0
    } else {
        let mut dh = h2p - h1p;
        if dh > 180.0 {
            dh -= 360.0;
        } else if dh < -180.0 {
            dh += 360.0;
        }
        dh
    };
    let dhp_term = 2.0 * (c1p * c2p).sqrt() * (dhp.to_radians() / 2.0).sin();

    let lp_bar = (l1 + l2) / 2.0;
    let cp_bar = (c1p + c2p) / 2.0;

    let hp_bar = if c1p * c2p == 0.0 {
        h1p + h2p
    } else {
        let sum = h1p + h2p;
        let diff = (h1p - h2p).abs();
        if diff <= 180.0 {
            sum / 2.0
        } else if sum < 360.0 {
            (sum + 360.0) / 2.0
        } else {
            (sum - 360.0) / 2.0
        }
    };

    let t = 1.0 - 0.17 * (hp_bar - 30.0).to_radians().cos()
        + 0.24 * (2.0 * hp_bar).to_radians().cos()
        + 0.32 * (3.0 * hp_bar + 6.0).to_radians().cos()
        - 0.20 * (4.0 * hp_bar - 63.0).to_radians().cos();

    let dtheta = 30.0 * (-((hp_bar - 275.0) / 25.0).powi(2)).exp();
    let cp_bar7 = cp_bar.powi(7);
    let rc = 2.0 * (cp_bar7 / (cp_bar7 + 25.0f64.powi(7))).sqrt();
    let lp_off = (lp_bar - 50.0).powi(2);
    let sl = 1.0 + 0.015 * lp_off / (20.0 + lp_off).sqrt();
    let sc = 1.0 + 0.045 * cp_bar;
    let sh = 1.0 + 0.015 * cp_bar * t;
    let rt = -(2.0 * dtheta).to_radians().sin() * rc;

    let tl = dlp / sl;
    let tc = dcp / sc;
    let th = dhp_term / sh;
    tl * tl + tc * tc + th * th + rt * tc * th
}

/// Errors raised while loading a palette file.
#[derive(Debug)]
pub enum PaletteError {
    /// I/O error
    Io(io::Error),

    /// File is not 128 RGB triples
    BadSize(usize),
}

impl std::fmt::Display for PaletteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaletteError::Io(e) => write!(f, "I/O error: {}", e),
            PaletteError::BadSize(n) => {
                write!(f, "palette file must be 384 bytes (128 RGB triples), got {}", n)
            }
        }
    }
}

impl std::error::Error for PaletteError {}

impl From<io::Error> for PaletteError {
    fn from(e: io::Error) -> Self {
        PaletteError::Io(e)
    }
}

/// The 128-entry hardware palette.
#[derive(Debug, Clone)]
pub struct Palette {
    entries: [Rgb; PALETTE_SIZE],
}

impl Palette {
    /// Build a palette from exactly 128 entries.
    pub fn new(entries: [Rgb; PALETTE_SIZE]) -> Palette {
        Palette { entries }
    }

    /// Load a `.act`-style palette: 128 consecutive RGB byte triples.
    pub fn load(path: impl AsRef<Path>) -> Result<Palette, PaletteError> {
        let bytes = fs::read(path)?;
        Self::from_act_bytes(&bytes)
    }

    /// Decode 128 RGB triples from raw bytes.
    pub fn from_act_bytes(bytes: &[u8]) -> Result<Palette, PaletteError> {
        if bytes.len() < PALETTE_SIZE * 3 {
            return Err(PaletteError::BadSize(bytes.len()));
        }
        let mut entries = [Rgb::default(); PALETTE_SIZE];
        for (i, entry) in entries.iter_mut().enumerate() {
            *entry = Rgb::new(bytes[i * 3], bytes[i * 3 + 1], bytes[i * 3 + 2]);
        }
        Ok(Palette { entries })
    }

    /// Synthetic grey-ramp palette, handy for tests and as a fallback.
    pub fn grayscale() -> Palette {
        let mut entries = [Rgb::default(); PALETTE_SIZE];
        for (i, entry) in entries.iter_mut().enumerate() {
            let v = (i * 2) as u8;
            *entry = Rgb::new(v, v, v);
        }
        Palette { entries }
    }

    /// Palette entry by index.
    #[inline]
    pub fn color(&self, index: u8) -> Rgb {
        self.entries[(index as usize) & (PALETTE_SIZE - 1)]
    }

    /// Palette entry addressed by a register byte (index shifted left one).
    #[inline]
    pub fn color_for_reg(&self, reg_value: u8) -> Rgb {
        self.color(reg_value >> 1)
    }

    pub fn entries(&self) -> &[Rgb; PALETTE_SIZE] {
        &self.entries
    }

    /// Index of the palette entry closest to `color` under `metric`.
    pub fn nearest_index(&self, color: Rgb, metric: DistanceMetric) -> u8 {
        let mut best = 0u8;
        let mut best_dist = f64::MAX;
        for (i, entry) in self.entries.iter().enumerate() {
            let d = metric.distance(color, *entry);
            if d < best_dist {
                best_dist = d;
                best = i as u8;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_zero_for_identical_colors() {
        let c = Rgb::new(120, 40, 200);
        for metric in [
            DistanceMetric::Euclidean,
            DistanceMetric::Yuv,
            DistanceMetric::Cie94,
            DistanceMetric::Ciede2000,
        ] {
            assert_eq!(metric.distance(c, c), 0.0, "{:?}", metric);
        }
    }

    #[test]
    fn test_metric_symmetry_euclid_yuv() {
        let a = Rgb::new(10, 20, 30);
        let b = Rgb::new(200, 100, 50);
        assert_eq!(
            DistanceMetric::Euclidean.distance(a, b),
            DistanceMetric::Euclidean.distance(b, a)
        );
        assert_eq!(
            DistanceMetric::Yuv.distance(a, b),
            DistanceMetric::Yuv.distance(b, a)
        );
    }

    #[test]
    fn test_euclidean_max_matches_constant() {
        let black = Rgb::new(0, 0, 0);
        let white = Rgb::new(255, 255, 255);
        assert_eq!(
            DistanceMetric::Euclidean.distance(black, white),
            MAX_COLOR_DISTANCE
        );
    }

    #[test]
    fn test_ciede2000_known_pair_is_positive_and_finite() {
        let a = Rgb::new(255, 0, 0);
        let b = Rgb::new(0, 0, 255);
        let d = DistanceMetric::Ciede2000.distance(a, b);
        assert!(d.is_finite());
        assert!(d > 0.0);
    }

    #[test]
    fn test_nearest_index_exact_match() {
        let palette = Palette::grayscale();
        for i in [0u8, 17, 64, 127] {
            let c = palette.color(i);
            assert_eq!(palette.nearest_index(c, DistanceMetric::Euclidean), i);
        }
    }

    #[test]
    fn test_color_for_reg_shifts() {
        let palette = Palette::grayscale();
        assert_eq!(palette.color_for_reg(0x04), palette.color(2));
        assert_eq!(palette.color_for_reg(0xFE), palette.color(127));
    }

    #[test]
    fn test_act_round_trip() {
        let mut bytes = Vec::with_capacity(PALETTE_SIZE * 3);
        for i in 0..PALETTE_SIZE {
            bytes.extend_from_slice(&[i as u8, (i * 2) as u8, 255 - i as u8]);
        }
        let palette = Palette::from_act_bytes(&bytes).unwrap();
        assert_eq!(palette.color(5), Rgb::new(5, 10, 250));
    }

    #[test]
    fn test_act_too_short_rejected() {
        assert!(matches!(
            Palette::from_act_bytes(&[0u8; 100]),
            Err(PaletteError::BadSize(100))
        ));
    }
}
