//! Tiled pixel buffers the codec reads from and decodes into.
//!
//! Buffers are stored at tile-aligned resolution and addressed tile-major:
//! pixel `tile_id * 64 + shift` where shift is the in-tile bit position.
//! On decode a buffer is re-initialized (resize and clear) only when its
//! dimensions differ from the incoming frame; otherwise decoded pixels
//! overwrite in place so successive deltas refine the same image.

/// RGBA pixel as the renderer hands it over.
pub type RenderColor = [f32; 4];

/// Allocation failure while shaping a pixel buffer.
#[derive(Debug, thiserror::Error)]
#[error("pixel buffer allocation failed ({items} items)")]
pub struct AllocError {
    items: usize,
}

/// Fixed-layout tiled buffer of `T` per pixel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TiledBuffer<T> {
    width: u32,
    height: u32,
    data: Vec<T>,
}

impl<T: Copy + Default> TiledBuffer<T> {
    pub fn new(width: u32, height: u32) -> Self {
        let mut b = Self {
            width: 0,
            height: 0,
            data: Vec::new(),
        };
        b.init(width, height).expect("allocation");
        b
    }

    /// Shape to `width x height` (tile-aligned dims expected) and clear.
    pub fn init(&mut self, width: u32, height: u32) -> Result<(), AllocError> {
        let items = (width as usize) * (height as usize);
        self.data.clear();
        if self.data.capacity() < items {
            self.data
                .try_reserve_exact(items - self.data.capacity())
                .map_err(|_| AllocError { items })?;
        }
        self.data.resize(items, T::default());
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.fill(T::default());
    }

    /// Re-initialize only when the dimensions changed; returns whether a
    /// re-initialization happened.
    pub fn ensure_shape(&mut self, width: u32, height: u32) -> Result<bool, AllocError> {
        if self.width != width || self.height != height {
            self.init(width, height)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

pub type FloatBuffer = TiledBuffer<f32>;
pub type RenderBuffer = TiledBuffer<RenderColor>;
pub type NumSampleBuffer = TiledBuffer<u32>;

/// Channel layout of a variable-format AOV buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarFormat {
    Float1,
    Float2,
    Float3,
    Float4,
}

impl VarFormat {
    pub fn channels(self) -> u32 {
        match self {
            Self::Float1 => 1,
            Self::Float2 => 2,
            Self::Float3 => 3,
            Self::Float4 => 4,
        }
    }
}

/// Tagged variable-format pixel buffer (scalar and vector AOVs).
#[derive(Clone, Debug, PartialEq)]
pub enum VarBuffer {
    Float1(TiledBuffer<f32>),
    Float2(TiledBuffer<[f32; 2]>),
    Float3(TiledBuffer<[f32; 3]>),
    Float4(TiledBuffer<[f32; 4]>),
}

impl VarBuffer {
    pub fn new(format: VarFormat, width: u32, height: u32) -> Self {
        match format {
            VarFormat::Float1 => Self::Float1(TiledBuffer::new(width, height)),
            VarFormat::Float2 => Self::Float2(TiledBuffer::new(width, height)),
            VarFormat::Float3 => Self::Float3(TiledBuffer::new(width, height)),
            VarFormat::Float4 => Self::Float4(TiledBuffer::new(width, height)),
        }
    }

    pub fn format(&self) -> VarFormat {
        match self {
            Self::Float1(_) => VarFormat::Float1,
            Self::Float2(_) => VarFormat::Float2,
            Self::Float3(_) => VarFormat::Float3,
            Self::Float4(_) => VarFormat::Float4,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            Self::Float1(b) => b.width(),
            Self::Float2(b) => b.width(),
            Self::Float3(b) => b.width(),
            Self::Float4(b) => b.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Float1(b) => b.height(),
            Self::Float2(b) => b.height(),
            Self::Float3(b) => b.height(),
            Self::Float4(b) => b.height(),
        }
    }

    /// Re-shape to the given format and dimensions, keeping contents when
    /// nothing changed.
    pub fn ensure(
        &mut self,
        format: VarFormat,
        width: u32,
        height: u32,
    ) -> Result<bool, AllocError> {
        let switched = self.format() != format;
        if switched {
            // Swap in an empty buffer of the right format first so a failed
            // allocation leaves a well-formed value behind.
            *self = Self::new(format, 0, 0);
        }
        let reshaped = match self {
            Self::Float1(b) => b.ensure_shape(width, height)?,
            Self::Float2(b) => b.ensure_shape(width, height)?,
            Self::Float3(b) => b.ensure_shape(width, height)?,
            Self::Float4(b) => b.ensure_shape(width, height)?,
        };
        Ok(switched || reshaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_shape_preserves_when_unchanged() {
        let mut b: FloatBuffer = TiledBuffer::new(16, 8);
        b.data_mut()[5] = 1.5;
        assert!(!b.ensure_shape(16, 8).unwrap());
        assert_eq!(b.data()[5], 1.5);
        assert!(b.ensure_shape(24, 8).unwrap());
        assert_eq!(b.data()[5], 0.0);
        assert_eq!(b.data().len(), 24 * 8);
    }

    #[test]
    fn var_buffer_format_switch_reallocates() {
        let mut v = VarBuffer::new(VarFormat::Float1, 8, 8);
        assert_eq!(v.format().channels(), 1);
        assert!(v.ensure(VarFormat::Float3, 8, 8).unwrap());
        assert_eq!(v.format(), VarFormat::Float3);
        assert!(!v.ensure(VarFormat::Float3, 8, 8).unwrap());
    }
}
