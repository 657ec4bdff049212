//! Sliding-window inference over volumes larger than the network's
//! training patch.
//!
//! The window grid follows the usual dense-patch scheme: along each axis the
//! stride is `max(1, floor(roi * (1 - overlap)))`, window starts are
//! `i * stride` clipped to `size - roi`, and duplicate starts are dropped.
//! Volumes smaller than the window are zero-padded at the end, predictions
//! are summed into a full-size buffer, divided by the per-voxel window count
//! and cropped back.

#[cfg(feature = "tch-backend")]
use tch::{Kind, Tensor};

#[cfg(feature = "tch-backend")]
use crate::error::{TrainError, TrainResult};

/// Window starts along one axis of length `size` (after padding to at least
/// `roi`).
pub fn window_starts(size: usize, roi: usize, overlap: f64) -> Vec<usize> {
    let roi = roi.max(1);
    let size = size.max(roi);
    if size == roi {
        return vec![0];
    }
    let stride = ((roi as f64 * (1.0 - overlap)).floor() as usize).max(1);
    let n = size.div_ceil(stride);
    let mut starts: Vec<usize> = (0..n).map(|i| (i * stride).min(size - roi)).collect();
    starts.dedup();
    starts
}

/// All window origins `[d, h, w]` for a volume, D-major order.
pub fn window_grid(spatial: [usize; 3], roi: [usize; 3], overlap: f64) -> Vec<[usize; 3]> {
    let sd = window_starts(spatial[0], roi[0], overlap);
    let sh = window_starts(spatial[1], roi[1], overlap);
    let sw = window_starts(spatial[2], roi[2], overlap);
    let mut out = Vec::with_capacity(sd.len() * sh.len() * sw.len());
    for &d in &sd {
        for &h in &sh {
            for &w in &sw {
                out.push([d, h, w]);
            }
        }
    }
    out
}

/// Run `predictor` over `roi`-sized windows of `input` (`[N, C, D, H, W]`)
/// and stitch the outputs into a `[N, C_out, D, H, W]` prediction,
/// averaging where windows overlap.
///
/// Windows are forwarded `sw_batch_size` at a time. The caller is expected
/// to run this under `tch::no_grad`.
#[cfg(feature = "tch-backend")]
pub fn sliding_window_inference<F>(
    input: &Tensor,
    roi: [usize; 3],
    sw_batch_size: usize,
    overlap: f64,
    mut predictor: F,
) -> TrainResult<Tensor>
where
    F: FnMut(&Tensor) -> TrainResult<Tensor>,
{
    let size = input.size();
    if size.len() != 5 {
        return Err(TrainError::shape_mismatch(
            vec![0; 5],
            size.iter().map(|&s| s as usize).collect(),
        ));
    }
    let spatial = [size[2] as usize, size[3] as usize, size[4] as usize];
    let padded: [usize; 3] = [
        spatial[0].max(roi[0]),
        spatial[1].max(roi[1]),
        spatial[2].max(roi[2]),
    ];
    let pad = [
        0,
        (padded[2] - spatial[2]) as i64,
        0,
        (padded[1] - spatial[1]) as i64,
        0,
        (padded[0] - spatial[0]) as i64,
    ];
    let x = if pad.iter().any(|&p| p > 0) { input.constant_pad_nd(pad) } else { input.shallow_clone() };

    let origins = window_grid(padded, roi, overlap);
    let [rd, rh, rw] = roi.map(|r| r as i64);
    let device = input.device();

    let mut outputs = Vec::with_capacity(size[0] as usize);
    for n in 0..size[0] {
        let sample = x.narrow(0, n, 1);
        let count = Tensor::zeros(
            [1, 1, padded[0] as i64, padded[1] as i64, padded[2] as i64],
            (Kind::Float, device),
        );
        let mut acc: Option<Tensor> = None;

        for chunk in origins.chunks(sw_batch_size.max(1)) {
            let windows: Vec<Tensor> = chunk
                .iter()
                .map(|&[d, h, w]| {
                    sample
                        .narrow(2, d as i64, rd)
                        .narrow(3, h as i64, rh)
                        .narrow(4, w as i64, rw)
                })
                .collect();
            let pred = predictor(&Tensor::cat(&windows, 0))?;
            let pred_size = pred.size();
            if pred_size.len() != 5 || pred_size[0] != chunk.len() as i64 || pred_size[2..] != [rd, rh, rw] {
                return Err(TrainError::shape_mismatch(
                    vec![chunk.len(), 0, roi[0], roi[1], roi[2]],
                    pred_size.iter().map(|&s| s as usize).collect(),
                ));
            }
            let acc = acc.get_or_insert_with(|| {
                Tensor::zeros(
                    [1, pred_size[1], padded[0] as i64, padded[1] as i64, padded[2] as i64],
                    (Kind::Float, device),
                )
            });
            for (j, &[d, h, w]) in chunk.iter().enumerate() {
                let mut region = acc
                    .narrow(2, d as i64, rd)
                    .narrow(3, h as i64, rh)
                    .narrow(4, w as i64, rw);
                let _ = region.f_add_(&pred.narrow(0, j as i64, 1).to_kind(Kind::Float))?;
                let mut hits = count
                    .narrow(2, d as i64, rd)
                    .narrow(3, h as i64, rh)
                    .narrow(4, w as i64, rw);
                let _ = hits.f_add_scalar_(1.0)?;
            }
        }

        let acc = acc.ok_or_else(|| TrainError::training_step("sliding window produced no windows"))?;
        outputs.push(acc / count);
    }

    let stitched = Tensor::cat(&outputs, 0);
    Ok(stitched
        .narrow(2, 0, spatial[0] as i64)
        .narrow(3, 0, spatial[1] as i64)
        .narrow(4, 0, spatial[2] as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(size: usize, roi: usize, overlap: f64) -> bool {
        let starts = window_starts(size, roi, overlap);
        (0..size).all(|v| starts.iter().any(|&s| v >= s && v < s + roi))
    }

    #[test]
    fn single_window_when_volume_fits() {
        assert_eq!(window_starts(96, 96, 0.25), vec![0]);
        assert_eq!(window_starts(40, 96, 0.25), vec![0]);
    }

    #[test]
    fn last_window_is_clipped_to_the_edge() {
        let starts = window_starts(200, 96, 0.25);
        assert_eq!(starts, vec![0, 72, 104]);
    }

    #[test]
    fn starts_cover_every_voxel() {
        for size in [1, 7, 33, 96, 97, 150, 301] {
            for overlap in [0.0, 0.25, 0.5, 0.9] {
                assert!(covers(size, 32, overlap), "size={size} overlap={overlap}");
            }
        }
    }

    #[test]
    fn grid_is_cartesian_product() {
        let grid = window_grid([100, 96, 50], [96, 96, 32], 0.5);
        // d: [0, 4], h: [0], w: [0, 16, 18]
        assert_eq!(grid.len(), 2 * 3);
        assert_eq!(grid[0], [0, 0, 0]);
        assert_eq!(*grid.last().unwrap(), [4, 0, 18]);
    }
}
