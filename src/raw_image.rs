//! [RawImageBuffer] is the uncompressed pixel data that moves through every tier of the pipeline.
//!
//! Buffers are created by a decode or a cache read and consumed by the uploader or kept as a low-resolution fallback.
//! They are never shared mutably; copies are explicit via `Clone`.
use crate::ImageError;

/// Pixels in row-major order, `components` bytes per pixel.
#[derive(Clone, PartialEq, Eq)]
pub struct RawImageBuffer {
    width: u32,
    height: u32,
    components: u8,
    data: Vec<u8>,
}

/// Auxiliary channel data (for example a separate alpha or sculpt map) delivered alongside the main image.
pub type AuxRawImageBuffer = RawImageBuffer;

impl RawImageBuffer {
    pub const MAX_COMPONENTS: u8 = 4;

    /// Wrap existing pixel bytes, checking that they describe a valid image.
    pub fn new(
        width: u32,
        height: u32,
        components: u8,
        data: Vec<u8>,
    ) -> Result<RawImageBuffer, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::ZeroDimension { width, height });
        }
        if components == 0 || components > Self::MAX_COMPONENTS {
            return Err(ImageError::BadComponents(components));
        }
        let expected = width as usize * height as usize * components as usize;
        if data.len() != expected {
            return Err(ImageError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(RawImageBuffer {
            width,
            height,
            components,
            data,
        })
    }

    /// A zero-filled image.
    pub fn blank(width: u32, height: u32, components: u8) -> Result<RawImageBuffer, ImageError> {
        let len = width as usize * height as usize * components as usize;
        RawImageBuffer::new(width, height, components, vec![0; len])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn components(&self) -> u8 {
        self.components
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Halve the resolution `levels` times with a 2x2 box filter.
    ///
    /// Dimensions never drop below 1, so odd or already tiny images keep a single row or column.
    pub fn downsample(&self, levels: u32) -> RawImageBuffer {
        let mut current = self.clone();
        for _ in 0..levels {
            if current.width == 1 && current.height == 1 {
                break;
            }
            current = current.half();
        }
        current
    }

    fn half(&self) -> RawImageBuffer {
        let new_w = (self.width / 2).max(1);
        let new_h = (self.height / 2).max(1);
        let comps = self.components as usize;
        let mut out = Vec::with_capacity(new_w as usize * new_h as usize * comps);

        for y in 0..new_h {
            let y0 = (y * 2).min(self.height - 1);
            let y1 = (y * 2 + 1).min(self.height - 1);
            for x in 0..new_w {
                let x0 = (x * 2).min(self.width - 1);
                let x1 = (x * 2 + 1).min(self.width - 1);
                for c in 0..comps {
                    let sum = self.sample(x0, y0, c)
                        + self.sample(x1, y0, c)
                        + self.sample(x0, y1, c)
                        + self.sample(x1, y1, c);
                    out.push(((sum + 2) / 4) as u8);
                }
            }
        }

        RawImageBuffer {
            width: new_w,
            height: new_h,
            components: self.components,
            data: out,
        }
    }

    fn sample(&self, x: u32, y: u32, c: usize) -> u32 {
        let idx = (y as usize * self.width as usize + x as usize) * self.components as usize + c;
        self.data[idx] as u32
    }
}

// The pixel data is usually megabytes, so keep it out of debug output.
impl std::fmt::Debug for RawImageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImageBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("components", &self.components)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_construction() {
        assert!(RawImageBuffer::new(2, 2, 4, vec![0; 16]).is_ok());
        assert!(matches!(
            RawImageBuffer::new(0, 2, 4, vec![]),
            Err(ImageError::ZeroDimension { .. })
        ));
        assert!(matches!(
            RawImageBuffer::new(2, 2, 5, vec![0; 20]),
            Err(ImageError::BadComponents(5))
        ));
        assert!(matches!(
            RawImageBuffer::new(2, 2, 3, vec![0; 11]),
            Err(ImageError::LengthMismatch {
                expected: 12,
                actual: 11
            })
        ));
    }

    #[test]
    fn downsample_averages() {
        let img = RawImageBuffer::new(2, 2, 1, vec![0, 100, 100, 200]).unwrap();
        let half = img.downsample(1);
        assert_eq!((half.width(), half.height()), (1, 1));
        assert_eq!(half.data(), &[100]);
    }

    #[test]
    fn downsample_stops_at_one_pixel() {
        let img = RawImageBuffer::blank(8, 2, 3).unwrap();
        let small = img.downsample(10);
        assert_eq!((small.width(), small.height()), (1, 1));
        assert_eq!(small.byte_len(), 3);

        let tall = RawImageBuffer::blank(4, 16, 2).unwrap().downsample(2);
        assert_eq!((tall.width(), tall.height()), (1, 4));
    }
}
