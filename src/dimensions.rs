use serde::Serialize;

/// Every generated dimension is a multiple of this.
pub const BLOCK_SIZE: u32 = 8;

/// Pixel floor for a generation: 512x320.
pub const MIN_GENERATION_PIXELS: u64 = 512 * 320;

/// Temporal stride of the video model: frame counts must be `4k + 1`.
pub const FRAME_STRIDE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationDimensions {
    pub width: u32,
    pub height: u32,
}

impl GenerationDimensions {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Grow a `BLOCK_SIZE` square one block at a time towards the target aspect
/// ratio until it covers `MIN_GENERATION_PIXELS`.
///
/// Whichever side is behind the target ratio grows. Both sides stay multiples
/// of the block size at every step and the result overshoots the floor by at
/// most one growth step.
pub fn normalize(target_width: u32, target_height: u32) -> GenerationDimensions {
    let target_ratio = f64::from(target_width) / f64::from(target_height);
    let mut width = BLOCK_SIZE;
    let mut height = BLOCK_SIZE;

    while u64::from(width) * u64::from(height) < MIN_GENERATION_PIXELS {
        let current_ratio = f64::from(width) / f64::from(height);
        if current_ratio < target_ratio {
            width += BLOCK_SIZE;
        } else {
            height += BLOCK_SIZE;
        }
    }

    GenerationDimensions { width, height }
}

/// Snap a frame count up to the next value of the form `4k + 1`. `None` when
/// that value does not fit in a `u32`.
pub fn validate_frames(num_frames: u32) -> Option<u32> {
    if num_frames <= 1 {
        return Some(1);
    }
    match (num_frames - 1) % FRAME_STRIDE {
        0 => Some(num_frames),
        rem => num_frames.checked_add(FRAME_STRIDE - rem),
    }
}
