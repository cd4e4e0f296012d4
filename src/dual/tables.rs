// Dual-frame lookup tables
//
// Two frames shown on alternate fields blend in the eye; scoring a pair of
// palette indices against a target pixel therefore needs the blended YUV of
// every index pair plus the magnitude of the temporal component difference
// (perceived flicker). Both are precomputed over all 128x128 pairs, along
// with 8-bit quantised variants that turn the hot path into table walks.

use crate::palette::{rgb_to_yuv, Palette, Rgb, PALETTE_SIZE};

/// Quantisation shifts moving U/V into unsigned byte range. Y is already
/// 0..255; the Atari palette's U spans roughly ±144 and V roughly ±182.
const U_OFFSET: f32 = 160.0;
const V_OFFSET: f32 = 200.0;

/// Default penalty weight for luma flicker at tolerance 0.
pub const LUMA_WEIGHT_BASELINE: f64 = 1.0;

/// Default penalty weight for chroma flicker at tolerance 0.
pub const CHROMA_WEIGHT_BASELINE: f64 = 0.2;

#[inline]
fn quantize(v: f32, offset: f32) -> u8 {
    let t = v + offset;
    t.clamp(0.0, 255.0).round() as u8
}

/// Precomputed pair/target tables for the blended-frame objective.
pub struct DualTables {
    pub palette_y: [f32; PALETTE_SIZE],
    pub palette_u: [f32; PALETTE_SIZE],
    pub palette_v: [f32; PALETTE_SIZE],

    /// Blended components, `pair = (a << 7) | b`.
    pub pair_y_sum: Vec<f32>,
    pub pair_u_sum: Vec<f32>,
    pub pair_v_sum: Vec<f32>,
    /// Temporal component differences per pair.
    pub pair_y_diff: Vec<f32>,
    pub pair_u_diff: Vec<f32>,
    pub pair_v_diff: Vec<f32>,

    /// 8-bit quantised variants for the fast path.
    pub pair_y_sum8: Vec<u8>,
    pub pair_u_sum8: Vec<u8>,
    pub pair_v_sum8: Vec<u8>,
    pub pair_y_diff8: Vec<u8>,
    pub pair_u_diff8: Vec<u8>,
    pub pair_v_diff8: Vec<u8>,

    /// Target YUV per pixel, float and quantised.
    pub target_y: Vec<f32>,
    pub target_u: Vec<f32>,
    pub target_v: Vec<f32>,
    pub target_y8: Vec<u8>,
    pub target_u8: Vec<u8>,
    pub target_v8: Vec<u8>,

    /// Blended sRGB per pair, for previews and saved pictures.
    pub pair_srgb: Vec<[u8; 3]>,

    /// Squared-difference lookup for byte deltas.
    pub sq_lut: [u16; 256],

    /// Temporal penalty weights derived from operator tolerances.
    pub lambda_luma: f64,
    pub lambda_chroma: f64,
}

impl DualTables {
    /// Build every table for `palette` and the target `pixels`
    /// (row-major). Tolerances are in `[0, 1]`: 0 keeps the full flicker
    /// penalty, 1 disables it.
    pub fn new(palette: &Palette, pixels: &[Rgb], luma_tol: f64, chroma_tol: f64) -> DualTables {
        let mut palette_y = [0f32; PALETTE_SIZE];
        let mut palette_u = [0f32; PALETTE_SIZE];
        let mut palette_v = [0f32; PALETTE_SIZE];
        for i in 0..PALETTE_SIZE {
            let (y, u, v) = rgb_to_yuv(palette.color(i as u8));
            palette_y[i] = y as f32;
            palette_u[i] = u as f32;
            palette_v[i] = v as f32;
        }

        let pairs = PALETTE_SIZE * PALETTE_SIZE;
        let mut pair_y_sum = vec![0f32; pairs];
        let mut pair_u_sum = vec![0f32; pairs];
        let mut pair_v_sum = vec![0f32; pairs];
        let mut pair_y_diff = vec![0f32; pairs];
        let mut pair_u_diff = vec![0f32; pairs];
        let mut pair_v_diff = vec![0f32; pairs];
        let mut pair_y_sum8 = vec![0u8; pairs];
        let mut pair_u_sum8 = vec![0u8; pairs];
        let mut pair_v_sum8 = vec![0u8; pairs];
        let mut pair_y_diff8 = vec![0u8; pairs];
        let mut pair_u_diff8 = vec![0u8; pairs];
        let mut pair_v_diff8 = vec![0u8; pairs];
        let mut pair_srgb = vec![[0u8; 3]; pairs];

        for a in 0..PALETTE_SIZE {
            for b in 0..PALETTE_SIZE {
                let p = (a << 7) | b;
                pair_y_sum[p] = 0.5 * (palette_y[a] + palette_y[b]);
                pair_u_sum[p] = 0.5 * (palette_u[a] + palette_u[b]);
                pair_v_sum[p] = 0.5 * (palette_v[a] + palette_v[b]);
                pair_y_diff[p] = (palette_y[a] - palette_y[b]).abs();
                pair_u_diff[p] = (palette_u[a] - palette_u[b]).abs();
                pair_v_diff[p] = (palette_v[a] - palette_v[b]).abs();

                pair_y_sum8[p] = quantize(pair_y_sum[p], 0.0);
                pair_u_sum8[p] = quantize(pair_u_sum[p], U_OFFSET);
                pair_v_sum8[p] = quantize(pair_v_sum[p], V_OFFSET);
                pair_y_diff8[p] = quantize(pair_y_diff[p], 0.0);
                pair_u_diff8[p] = quantize(pair_u_diff[p], 0.0);
                pair_v_diff8[p] = quantize(pair_v_diff[p], 0.0);

                // Blend in YUV, convert back with the simple inverse.
                let yf = pair_y_sum[p];
                let uf = pair_u_sum[p];
                let vf = pair_v_sum[p];
                let r = yf + 1.403 * vf;
                let b_ = yf + 1.773 * uf;
                let g = (yf - 0.299 * r - 0.114 * b_) / 0.587;
                pair_srgb[p] = [
                    r.clamp(0.0, 255.0).round() as u8,
                    g.clamp(0.0, 255.0).round() as u8,
                    b_.clamp(0.0, 255.0).round() as u8,
                ];
            }
        }

        let mut target_y = Vec::with_capacity(pixels.len());
        let mut target_u = Vec::with_capacity(pixels.len());
        let mut target_v = Vec::with_capacity(pixels.len());
        let mut target_y8 = Vec::with_capacity(pixels.len());
        let mut target_u8 = Vec::with_capacity(pixels.len());
        let mut target_v8 = Vec::with_capacity(pixels.len());
        for px in pixels {
            let (y, u, v) = rgb_to_yuv(*px);
            target_y.push(y as f32);
            target_u.push(u as f32);
            target_v.push(v as f32);
            target_y8.push(quantize(y as f32, 0.0));
            target_u8.push(quantize(u as f32, U_OFFSET));
            target_v8.push(quantize(v as f32, V_OFFSET));
        }

        let mut sq_lut = [0u16; 256];
        for (i, slot) in sq_lut.iter_mut().enumerate() {
            *slot = (i * i) as u16;
        }

        DualTables {
            palette_y,
            palette_u,
            palette_v,
            pair_y_sum,
            pair_u_sum,
            pair_v_sum,
            pair_y_diff,
            pair_u_diff,
            pair_v_diff,
            pair_y_sum8,
            pair_u_sum8,
            pair_v_sum8,
            pair_y_diff8,
            pair_u_diff8,
            pair_v_diff8,
            target_y,
            target_u,
            target_v,
            target_y8,
            target_u8,
            target_v8,
            pair_srgb,
            sq_lut,
            lambda_luma: (1.0 - luma_tol.clamp(0.0, 1.0)) * LUMA_WEIGHT_BASELINE,
            lambda_chroma: (1.0 - chroma_tol.clamp(0.0, 1.0)) * CHROMA_WEIGHT_BASELINE,
        }
    }

    /// Blended distance of palette pair (`self_idx`, `other_idx`) against
    /// target pixel `pix`, through the quantised fast path.
    #[inline]
    pub fn pixel_distance(&self, self_idx: u8, other_idx: u8, pix: usize) -> f64 {
        let pair = ((self_idx as usize & 0x7F) << 7) | (other_idx as usize & 0x7F);
        let sq = &self.sq_lut;

        let dy = self.pair_y_sum8[pair].abs_diff(self.target_y8[pix]) as usize;
        let du = self.pair_u_sum8[pair].abs_diff(self.target_u8[pix]) as usize;
        let dv = self.pair_v_sum8[pair].abs_diff(self.target_v8[pix]) as usize;
        let mut sum = sq[dy] as u32 + sq[du] as u32 + sq[dv] as u32;

        let dyt = self.pair_y_diff8[pair] as usize;
        let dut = self.pair_u_diff8[pair] as usize;
        let dvt = self.pair_v_diff8[pair] as usize;
        let penalty = self.lambda_luma * sq[dyt] as f64
            + self.lambda_chroma * (sq[dut] as f64 + sq[dvt] as f64);
        sum += penalty as u32;

        sum as f64
    }

    /// Self index `0..128` minimising the blended distance for a fixed
    /// opposite index at target pixel `pix`.
    pub fn best_self_index(&self, other_idx: u8, pix: usize) -> u8 {
        let mut best = 0u8;
        let mut best_score = f64::MAX;
        for s in 0..PALETTE_SIZE as u8 {
            let d = self.pixel_distance(s, other_idx, pix);
            if d < best_score {
                best_score = d;
                best = s;
            }
        }
        best
    }

    /// Blended sRGB of a palette index pair.
    #[inline]
    pub fn blended_rgb(&self, a: u8, b: u8) -> Rgb {
        let [r, g, b] = self.pair_srgb[((a as usize & 0x7F) << 7) | (b as usize & 0x7F)];
        Rgb::new(r, g, b)
    }
}
