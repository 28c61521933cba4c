//! Conversion of user-supplied media into conditioning payloads, and of
//! frame tensors back into 8-bit images.

use candle_core::{DType, Device, IndexOp, Tensor};
use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::{Result, StudioError};
use crate::pipeline::{ConditioningPayload, MASK_GENERATE, MASK_KEEP};

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

pub fn load_image(path: impl AsRef<Path>) -> Result<RgbImage> {
    Ok(image::open(path.as_ref())?.to_rgb8())
}

/// Width and height, read from the header
pub fn probe_image_size(path: impl AsRef<Path>) -> Result<(u32, u32)> {
    Ok(image::image_dimensions(path.as_ref())?)
}

/// Frames of a reference video: an animated GIF, or a directory of images
/// taken in file-name order.
pub fn read_video_frames(path: impl AsRef<Path>) -> Result<Vec<RgbImage>> {
    let path = path.as_ref();
    let frames = if path.is_dir() {
        frame_files(path)?
            .into_iter()
            .map(load_image)
            .collect::<Result<Vec<_>>>()?
    } else {
        let decoder = GifDecoder::new(BufReader::new(File::open(path)?))?;
        decoder
            .into_frames()
            .collect_frames()?
            .into_iter()
            .map(|frame| DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8())
            .collect()
    };

    if frames.is_empty() {
        return Err(StudioError::validation(format!(
            "Reference video {} has no frames.",
            path.display()
        )));
    }
    Ok(frames)
}

/// Size of the first frame of a reference video
pub fn probe_video_size(path: impl AsRef<Path>) -> Result<(u32, u32)> {
    let path = path.as_ref();
    if path.is_dir() {
        let first = frame_files(path)?.into_iter().next().ok_or_else(|| {
            StudioError::validation(format!("Reference video {} has no frames.", path.display()))
        })?;
        return probe_image_size(first);
    }
    let frames = read_video_frames(path)?;
    Ok(frames[0].dimensions())
}

fn frame_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn fit(image: &RgbImage, width: usize, height: usize) -> RgbImage {
    if image.dimensions() == (width as u32, height as u32) {
        return image.clone();
    }
    image::imageops::resize(image, width as u32, height as u32, FilterType::Lanczos3)
}

/// `[1, 3, F, H, W]` in `[0, 1]`; every frame must already be `width x height`
pub fn frames_to_tensor(frames: &[RgbImage], device: &Device) -> Result<Tensor> {
    let Some(first) = frames.first() else {
        return Err(StudioError::validation("No frames to convert."));
    };
    let (w, h) = first.dimensions();
    let (w, h) = (w as usize, h as usize);

    let mut data = Vec::with_capacity(frames.len() * h * w * 3);
    for frame in frames {
        data.extend_from_slice(frame.as_raw());
    }
    let tensor = Tensor::from_vec(data, (frames.len(), h, w, 3), device)?
        .permute((3, 0, 1, 2))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?
        .unsqueeze(0)?
        .contiguous()?;
    Ok(tensor)
}

/// `[1, 3, F, H, W]` in `[0, 1]` to 8-bit frames
pub fn tensor_to_frames(video: &Tensor) -> Result<Vec<RgbImage>> {
    let (_, channels, num_frames, height, width) = video.dims5()?;
    if channels != 3 {
        return Err(StudioError::Generation(format!(
            "Expected 3 colour channels, got {channels}"
        )));
    }

    let bytes = (video.i(0)?.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.0)?
        .round()?
        .to_dtype(DType::U8)?;
    let mut frames = Vec::with_capacity(num_frames);
    for f in 0..num_frames {
        let raw: Vec<u8> = bytes.i((.., f))?.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;
        let frame = RgbImage::from_raw(width as u32, height as u32, raw)
            .ok_or_else(|| StudioError::Generation("Frame buffer has the wrong size".into()))?;
        frames.push(frame);
    }
    Ok(frames)
}

/// Start (and optional end) frames placed into a `num_frames` video.
///
/// Frames not supplied are copies of the first start frame and are marked for
/// generation in the mask. End frames occupy the tail. Strength is 1.
pub fn image_to_video_conditioning(
    start: &[RgbImage],
    end: Option<&[RgbImage]>,
    num_frames: usize,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<ConditioningPayload> {
    let Some(first) = start.first() else {
        return Err(StudioError::validation("A start image is required."));
    };
    let first = fit(first, width, height);

    let mut frames = vec![first.clone(); num_frames];
    let mut mask = vec![MASK_GENERATE; num_frames];

    for (slot, image) in start.iter().take(num_frames).enumerate() {
        frames[slot] = fit(image, width, height);
        mask[slot] = MASK_KEEP;
    }
    if let Some(end) = end {
        let tail = end.len().min(num_frames);
        let offset = num_frames - tail;
        for (i, image) in end.iter().skip(end.len() - tail).enumerate() {
            frames[offset + i] = fit(image, width, height);
            mask[offset + i] = MASK_KEEP;
        }
    }

    Ok(ConditioningPayload {
        video: frames_to_tensor(&frames, device)?,
        mask: mask_tensor(&mask, width, height, device)?,
        clip_image: Some(first),
        strength: 1.0,
    })
}

/// Reference frames resized to the output size and fitted to `num_frames`
/// (truncated, or padded by repeating the last frame). Every frame is
/// regenerated; `strength` sets how much of the trajectory is re-run.
pub fn video_to_video_conditioning(
    frames: &[RgbImage],
    num_frames: usize,
    width: usize,
    height: usize,
    strength: f64,
    device: &Device,
) -> Result<ConditioningPayload> {
    let Some(last) = frames.iter().take(num_frames).last() else {
        return Err(StudioError::validation("The reference video has no frames."));
    };
    let last = fit(last, width, height);

    let mut fitted: Vec<RgbImage> = frames
        .iter()
        .take(num_frames)
        .map(|f| fit(f, width, height))
        .collect();
    fitted.resize(num_frames, last);

    Ok(ConditioningPayload {
        video: frames_to_tensor(&fitted, device)?,
        mask: mask_tensor(&vec![MASK_GENERATE; num_frames], width, height, device)?,
        clip_image: None,
        strength,
    })
}

fn mask_tensor(per_frame: &[f32], width: usize, height: usize, device: &Device) -> Result<Tensor> {
    let mask = Tensor::from_slice(per_frame, (1, 1, per_frame.len(), 1, 1), device)?
        .broadcast_as((1, 1, per_frame.len(), height, width))?
        .contiguous()?;
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb([value, value, value]))
    }

    fn mask_values(payload: &ConditioningPayload) -> Vec<f32> {
        payload
            .mask
            .i((0, 0, .., 0, 0))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn test_start_image_only() {
        let payload =
            image_to_video_conditioning(&[solid(8, 8, 255)], None, 5, 16, 16, &Device::Cpu).unwrap();
        assert_eq!(payload.video.dims(), &[1, 3, 5, 16, 16]);
        assert_eq!(mask_values(&payload), vec![0., 255., 255., 255., 255.]);
        assert_eq!(payload.strength, 1.0);
        assert_eq!(payload.clip_image.as_ref().unwrap().dimensions(), (16, 16));
    }

    #[test]
    fn test_start_and_end_images() {
        let end = [solid(16, 16, 0)];
        let payload =
            image_to_video_conditioning(&[solid(16, 16, 255)], Some(&end), 5, 16, 16, &Device::Cpu)
                .unwrap();
        assert_eq!(mask_values(&payload), vec![0., 255., 255., 255., 0.]);
        let last = payload.video.i((0, .., 4)).unwrap().max_all().unwrap();
        assert_eq!(last.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_multiple_start_frames() {
        let start = vec![solid(16, 16, 10), solid(16, 16, 20), solid(16, 16, 30)];
        let payload = image_to_video_conditioning(&start, None, 6, 16, 16, &Device::Cpu).unwrap();
        assert_eq!(mask_values(&payload), vec![0., 0., 0., 255., 255., 255.]);
    }

    #[test]
    fn test_video_to_video_pads_and_truncates() {
        let frames = vec![solid(32, 32, 0), solid(32, 32, 255)];
        let padded = video_to_video_conditioning(&frames, 4, 16, 16, 0.7, &Device::Cpu).unwrap();
        assert_eq!(padded.video.dims(), &[1, 3, 4, 16, 16]);
        assert!(mask_values(&padded).iter().all(|&m| m == 255.0));
        assert_eq!(padded.strength, 0.7);
        assert!(padded.clip_image.is_none());

        let truncated = video_to_video_conditioning(&frames, 1, 16, 16, 0.7, &Device::Cpu).unwrap();
        assert_eq!(truncated.video.dims(), &[1, 3, 1, 16, 16]);
    }

    #[test]
    fn test_tensor_frames_round_trip() {
        let frames = vec![solid(4, 2, 0), solid(4, 2, 128), solid(4, 2, 255)];
        let tensor = frames_to_tensor(&frames, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 3, 2, 4]);
        let back = tensor_to_frames(&tensor).unwrap();
        assert_eq!(back, frames);
    }

    #[test]
    fn test_frames_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        solid(24, 12, 1).save(dir.path().join("0002.png")).unwrap();
        solid(24, 12, 2).save(dir.path().join("0001.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let frames = read_video_frames(dir.path()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get_pixel(0, 0).0, [2, 2, 2]);
        assert_eq!(probe_video_size(dir.path()).unwrap(), (24, 12));
    }
}
