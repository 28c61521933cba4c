use candle_core::{Device, Result, Tensor};

/// PCG32 (XSH-RR) generator seeded from a generation request.
///
/// The same seed always yields the same noise, on every device, so a
/// request can be replayed exactly.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Stream selector shared by every generator built from a request seed
const DEFAULT_STREAM: u64 = 1442695040888963407;

impl Pcg32 {
    pub fn new(seed: u64, inc: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (inc << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn from_seed(seed: u64) -> Self {
        Self::new(seed, DEFAULT_STREAM)
    }

    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    pub fn next_u64(&mut self) -> u64 {
        ((self.next_u32() as u64) << 32) | self.next_u32() as u64
    }

    /// Uniform in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        // 2^-24
        (self.next_u32() >> 8) as f32 * 5.960_464_5e-8
    }

    /// Two standard normal samples (Box-Muller)
    pub fn next_gaussian(&mut self) -> (f32, f32) {
        let u1 = loop {
            let x = self.next_f32();
            if x > 1e-7 {
                break x;
            }
        };
        let u2 = self.next_f32();

        let mag = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f32::consts::PI * u2;
        (mag * angle.cos(), mag * angle.sin())
    }

    pub fn randn(&mut self, shape: impl Into<candle_core::Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let elem_count = shape.elem_count();
        let mut data = Vec::with_capacity(elem_count + 1);
        while data.len() < elem_count {
            let (z0, z1) = self.next_gaussian();
            data.push(z0);
            data.push(z1);
        }
        data.truncate(elem_count);
        Tensor::from_vec(data, shape, device)
    }

    pub fn rand(&mut self, shape: impl Into<candle_core::Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| self.next_f32()).collect();
        Tensor::from_vec(data, shape, device)
    }
}

/// Seed for requests that asked for a random one.
///
/// Kept below 2^63 so it round-trips through signed seed fields.
pub fn entropy_seed() -> u64 {
    rand::random::<u64>() >> 1
}
