//! Aspect-ratio buckets for deriving the output size from a reference.

/// `(height / width, [height, width])` at a 512 base resolution
pub const ASPECT_RATIO_512: [(f64, [usize; 2]); 40] = [
    (0.25, [256, 1024]),
    (0.26, [256, 992]),
    (0.27, [256, 960]),
    (0.28, [256, 928]),
    (0.32, [288, 896]),
    (0.33, [288, 864]),
    (0.35, [288, 832]),
    (0.4, [320, 800]),
    (0.42, [320, 768]),
    (0.48, [352, 736]),
    (0.5, [352, 704]),
    (0.52, [352, 672]),
    (0.57, [384, 672]),
    (0.6, [384, 640]),
    (0.68, [416, 608]),
    (0.72, [416, 576]),
    (0.78, [448, 576]),
    (0.82, [448, 544]),
    (0.88, [480, 544]),
    (0.94, [480, 512]),
    (1.0, [512, 512]),
    (1.07, [512, 480]),
    (1.13, [544, 480]),
    (1.21, [544, 448]),
    (1.29, [576, 448]),
    (1.38, [576, 416]),
    (1.46, [608, 416]),
    (1.67, [640, 384]),
    (1.75, [672, 384]),
    (2.0, [704, 352]),
    (2.09, [736, 352]),
    (2.4, [768, 320]),
    (2.5, [800, 320]),
    (2.89, [832, 288]),
    (3.0, [864, 288]),
    (3.11, [896, 288]),
    (3.62, [928, 256]),
    (3.75, [960, 256]),
    (3.88, [992, 256]),
    (4.0, [1024, 256]),
];

const TABLE_BASE: usize = 512;
const STRIDE: usize = 16;

/// Bucket whose `height / width` is closest; the first one wins ties
pub fn closest_bucket(height: usize, width: usize) -> [usize; 2] {
    let ratio = height as f64 / width.max(1) as f64;
    let mut best = ASPECT_RATIO_512[0];
    for entry in ASPECT_RATIO_512 {
        if (entry.0 - ratio).abs() < (best.0 - ratio).abs() {
            best = entry;
        }
    }
    best.1
}

/// Output `(width, height)` for a reference of `ref_width x ref_height`,
/// scaled to `base_resolution` and floored to multiples of 16.
pub fn size_from_reference(ref_width: u32, ref_height: u32, base_resolution: usize) -> (usize, usize) {
    let [h, w] = closest_bucket(ref_height as usize, ref_width as usize);
    let scale = |side: usize| {
        let scaled = side as f64 / TABLE_BASE as f64 * base_resolution as f64;
        (scaled / STRIDE as f64) as usize * STRIDE
    };
    (scale(w), scale(h))
}
