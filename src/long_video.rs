//! Chunk arithmetic and overlap cross-fading for long videos.
//!
//! A long video is produced as a sequence of chunks of at most `chunk_frames`
//! frames. Consecutive chunks share `overlap_frames` frames: the next chunk is
//! conditioned on the tail of what has been produced so far, and the shared
//! frames are cross-faded so no seam is visible.

use candle_core::{Device, Result, Tensor};
use tracing::warn;

/// One pipeline call of a long-video run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: usize,
    /// Position of the chunk's first frame in the final video
    pub start_frame: usize,
    pub num_frames: usize,
    /// Frames shared with the previous chunk; 0 for the first one
    pub overlap: usize,
    /// Only the final chunk is conditioned on the requested end image
    pub is_final: bool,
}

/// Chunks needed for `total_frames`.
///
/// Every chunk but the last has `chunk_frames` frames. The last is trimmed to
/// what remains and rounded down to `k * temporal_ratio + 1` frames so its
/// latents decode cleanly. A final chunk that would add no new frames ends
/// the plan early.
pub fn plan_chunks(
    total_frames: usize,
    chunk_frames: usize,
    overlap_frames: usize,
    temporal_ratio: usize,
) -> Vec<ChunkPlan> {
    let ratio = temporal_ratio.max(1);
    let mut plans = Vec::new();
    if chunk_frames <= overlap_frames {
        return plans;
    }

    let mut init = 0usize;
    let mut last = chunk_frames;
    while init < total_frames {
        let is_final = last >= total_frames;
        let num_frames = if is_final {
            let remaining = total_frames - init;
            ((remaining - 1) / ratio) * ratio + 1
        } else {
            chunk_frames
        };

        let overlap = if plans.is_empty() { 0 } else { overlap_frames };
        if num_frames <= overlap {
            warn!(
                start_frame = init,
                num_frames,
                overlap,
                "Final chunk adds no new frames; stopping early"
            );
            break;
        }

        plans.push(ChunkPlan {
            index: plans.len(),
            start_frame: init,
            num_frames,
            overlap,
            is_final,
        });
        if is_final {
            break;
        }
        init += num_frames - overlap_frames;
        last = init + num_frames;
    }
    plans
}

/// Frames a plan produces once overlaps are merged
pub fn planned_frames(plans: &[ChunkPlan]) -> usize {
    plans.iter().map(|p| p.num_frames - p.overlap).sum()
}

/// Linear mix weights `i / overlap` for `i` in `0..overlap`
pub fn mix_weights(overlap: usize) -> Vec<f32> {
    (0..overlap).map(|i| i as f32 / overlap as f32).collect()
}

/// Append `chunk` to `previous`, cross-fading the `overlap` shared frames.
///
/// Both tensors are `[B, C, F, H, W]`. At overlap position `i` the result is
/// `previous * (1 - i / overlap) + chunk * (i / overlap)`.
pub fn blend_overlap(previous: &Tensor, chunk: &Tensor, overlap: usize) -> Result<Tensor> {
    let prev_frames = previous.dim(2)?;
    let chunk_frames = chunk.dim(2)?;
    if overlap == 0 {
        return Tensor::cat(&[previous, chunk], 2);
    }
    if overlap > prev_frames || overlap > chunk_frames {
        candle_core::bail!(
            "overlap {overlap} exceeds previous ({prev_frames}) or chunk ({chunk_frames}) length"
        );
    }

    let mix = mix_tensor(overlap, previous.device())?.to_dtype(previous.dtype())?;
    let tail = previous.narrow(2, prev_frames - overlap, overlap)?;
    let head = chunk.narrow(2, 0, overlap)?.to_dtype(previous.dtype())?;
    let blended = (tail.broadcast_mul(&(1.0 - &mix)?)? + head.broadcast_mul(&mix)?)?;

    let mut parts = Vec::with_capacity(3);
    if prev_frames > overlap {
        parts.push(previous.narrow(2, 0, prev_frames - overlap)?);
    }
    parts.push(blended);
    if chunk_frames > overlap {
        parts.push(chunk.narrow(2, overlap, chunk_frames - overlap)?.to_dtype(previous.dtype())?);
    }
    Tensor::cat(&parts, 2)
}

/// `[1, 1, V, 1, 1]` mix weights, broadcastable over `[B, C, V, H, W]`
fn mix_tensor(overlap: usize, device: &Device) -> Result<Tensor> {
    Tensor::from_vec(mix_weights(overlap), overlap, device)?
        .reshape((1, 1, overlap, 1, 1))
}

/// The last `count` frames along the frame axis
pub fn tail_frames(video: &Tensor, count: usize) -> Result<Tensor> {
    let frames = video.dim(2)?;
    let count = count.min(frames);
    video.narrow(2, frames - count, count)
}

/// Sanity check used after each chunk: `[B, C, F, H, W]` with the expected frame count
pub fn check_chunk(chunk: &Tensor, expected_frames: usize) -> Result<()> {
    let (_, _, frames, _, _) = chunk.dims5()?;
    if frames != expected_frames {
        candle_core::bail!("pipeline returned {frames} frames, expected {expected_frames}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, IndexOp};

    #[test]
    fn test_single_chunk_when_budget_covers_total() {
        let plans = plan_chunks(21, 25, 4, 4);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].num_frames, 21);
        assert!(plans[0].is_final);
        assert_eq!(planned_frames(&plans), 21);
    }

    #[test]
    fn test_reachable_totals_are_exact() {
        // Cursor advances by P - V = 21; the final remainder 47 - 42 = 5 is 1 mod 4
        let plans = plan_chunks(47, 25, 4, 4);
        let lengths: Vec<_> = plans.iter().map(|p| p.num_frames).collect();
        assert_eq!(lengths, vec![25, 25, 5]);
        assert_eq!(
            plans.iter().map(|p| p.start_frame).collect::<Vec<_>>(),
            vec![0, 21, 42]
        );
        assert_eq!(planned_frames(&plans), 47);
        assert!(plans[2].is_final && !plans[1].is_final);

        for (total, chunk, overlap, ratio) in [(49, 49, 4, 4), (95, 49, 4, 4), (72, 25, 4, 4), (30, 10, 2, 1)] {
            let plans = plan_chunks(total, chunk, overlap, ratio);
            assert_eq!(planned_frames(&plans), total, "L={total} P={chunk} V={overlap}");
        }
    }

    #[test]
    fn test_unreachable_total_rounds_down() {
        // 49 - 42 = 7 rounds to 5: two frames short
        let plans = plan_chunks(49, 25, 4, 4);
        assert_eq!(plans.last().unwrap().num_frames, 5);
        assert_eq!(planned_frames(&plans), 47);
    }

    #[test]
    fn test_final_chunk_within_overlap_stops() {
        // 3 remaining frames round to 1, which is inside the 2 overlapped frames
        let plans = plan_chunks(11, 10, 2, 4);
        assert_eq!(plans.len(), 1);
        assert_eq!(planned_frames(&plans), 10);
    }

    #[test]
    fn test_degenerate_overlap_plans_nothing() {
        assert!(plan_chunks(49, 4, 4, 4).is_empty());
    }

    #[test]
    fn test_blend_boundary_weights() -> Result<()> {
        let previous = Tensor::zeros((1, 1, 6, 1, 1), DType::F32, &Device::Cpu)?;
        let chunk = Tensor::ones((1, 1, 5, 1, 1), DType::F32, &Device::Cpu)?;
        let out = blend_overlap(&previous, &chunk, 4)?;
        assert_eq!(out.dims(), &[1, 1, 7, 1, 1]);

        let values = out.flatten_all()?.to_vec1::<f32>()?;
        // First overlapped frame is untouched, later ones move towards the chunk
        assert_eq!(values, vec![0.0, 0.0, 0.0, 0.25, 0.5, 0.75, 1.0]);
        Ok(())
    }

    #[test]
    fn test_blend_keeps_previous_prefix() -> Result<()> {
        let previous = Tensor::arange(0f32, 5., &Device::Cpu)?.reshape((1, 1, 5, 1, 1))?;
        let chunk = Tensor::full(10f32, (1, 1, 3, 1, 1), &Device::Cpu)?;
        let out = blend_overlap(&previous, &chunk, 2)?;
        assert_eq!(out.i((0, 0, ..3, 0, 0))?.to_vec1::<f32>()?, vec![0., 1., 2.]);
        assert_eq!(out.i((0, 0, 3, 0, 0))?.to_scalar::<f32>()?, 3.0);
        assert_eq!(out.i((0, 0, 4, 0, 0))?.to_scalar::<f32>()?, 4.0 * 0.5 + 10.0 * 0.5);
        assert_eq!(out.dim(2)?, 6);
        Ok(())
    }

    #[test]
    fn test_tail_frames() -> Result<()> {
        let video = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((1, 1, 6, 1, 1))?;
        assert_eq!(tail_frames(&video, 4)?.flatten_all()?.to_vec1::<f32>()?, vec![2., 3., 4., 5.]);
        Ok(())
    }
}
