// ============================================================
// Layer 4 — Epoch Resampling
// ============================================================
// Converts one epoch of native-rate samples to exactly
// `target_len` canonical samples. Rules, in order:
//
//   same length          → copy
//   integer multiple     → block average (anti-aliased decimation,
//                          e.g. ISRUC 200 Hz → 100 Hz)
//   anything else        → centre-aligned linear interpolation
//
// Resampling is done per epoch so an epoch boundary in the
// source is an epoch boundary in the output and no sample
// leaks across labels. Every rule is a pure function of its
// input, so canonicalizing twice is byte-identical.

/// Resample one epoch to `target_len` samples.
pub fn resample_epoch(input: &[f32], target_len: usize) -> Vec<f32> {
    let n = input.len();
    if target_len == 0 || n == 0 {
        return vec![0.0; target_len];
    }
    if n == target_len {
        return input.to_vec();
    }
    if n > target_len && n % target_len == 0 {
        return block_average(input, n / target_len);
    }
    linear(input, target_len)
}

fn block_average(input: &[f32], factor: usize) -> Vec<f32> {
    input
        .chunks_exact(factor)
        .map(|block| {
            let sum: f64 = block.iter().map(|&v| v as f64).sum();
            (sum / factor as f64) as f32
        })
        .collect()
}

/// Output sample j sits at the centre of its cell:
/// x = (j + 0.5) · n / target − 0.5, clamped to the input range.
fn linear(input: &[f32], target_len: usize) -> Vec<f32> {
    let n     = input.len();
    let scale = n as f64 / target_len as f64;
    let last  = (n - 1) as f64;

    (0..target_len)
        .map(|j| {
            let x  = ((j as f64 + 0.5) * scale - 0.5).clamp(0.0, last);
            let i0 = x.floor() as usize;
            let i1 = (i0 + 1).min(n - 1);
            let t  = x - i0 as f64;
            (input[i0] as f64 * (1.0 - t) + input[i1] as f64 * t) as f32
        })
        .collect()
}
