//! 8-bit quantization for the low-precision pixel path.
//!
//! Color channels go through a gamma-2.2 transfer curve (sRGB when the
//! `srgb8` feature is enabled). Alpha and scalar channels use plain linear
//! quantization. Both directions treat 0.0 and 1.0 as exact fixpoints:
//! 255 decodes to exactly 1.0 and 1.0 encodes to exactly 255, which is why
//! the scale is 255 steps rather than 256.

#[cfg(not(feature = "srgb8"))]
#[inline]
fn transfer_encode(v: f32) -> f32 {
    v.powf(1.0 / 2.2)
}

#[cfg(not(feature = "srgb8"))]
#[inline]
fn transfer_decode(v: f32) -> f32 {
    v.powf(2.2)
}

#[cfg(feature = "srgb8")]
#[inline]
fn transfer_encode(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        12.92 * v
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

#[cfg(feature = "srgb8")]
#[inline]
fn transfer_decode(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

/// Color channel to one byte through the transfer curve.
#[inline]
pub fn color_to_byte(v: f32) -> u8 {
    if v <= 0.0 {
        return 0;
    }
    if v >= 1.0 {
        return 255;
    }
    (transfer_encode(v) * 255.0 + 0.5) as u8
}

/// Inverse of [`color_to_byte`].
#[inline]
pub fn byte_to_color(b: u8) -> f32 {
    if b == 0 {
        0.0
    } else if b == 255 {
        1.0
    } else {
        transfer_decode(b as f32 / 255.0)
    }
}

/// Linear channel (alpha, weights, scalar AOVs) to one byte. Truncating,
/// so 1.0 maps to exactly 255.
#[inline]
pub fn linear_to_byte(v: f32) -> u8 {
    if v < 0.0 {
        return 0;
    }
    let i = (v * 255.0) as i32;
    if i > 255 {
        255
    } else {
        i as u8
    }
}

/// Inverse of [`linear_to_byte`].
#[inline]
pub fn byte_to_linear(b: u8) -> f32 {
    b as f32 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixpoints_are_exact() {
        assert_eq!(color_to_byte(0.0), 0);
        assert_eq!(color_to_byte(1.0), 255);
        assert_eq!(byte_to_color(0), 0.0);
        assert_eq!(byte_to_color(255), 1.0);

        assert_eq!(linear_to_byte(0.0), 0);
        assert_eq!(linear_to_byte(1.0), 255);
        assert_eq!(byte_to_linear(255), 1.0);
    }

    #[test]
    fn out_of_range_clamps() {
        assert_eq!(color_to_byte(-0.5), 0);
        assert_eq!(color_to_byte(17.0), 255);
        assert_eq!(linear_to_byte(-3.0), 0);
        assert_eq!(linear_to_byte(2.0), 255);
    }

    #[test]
    fn linear_round_trip_bound() {
        for i in 0..=10_000 {
            let v = i as f32 / 10_000.0;
            let back = byte_to_linear(linear_to_byte(v));
            assert!((back - v).abs() <= 1.0 / 255.0, "v={v} back={back}");
        }
    }

    #[test]
    fn color_round_trip_bound() {
        // The transfer curve compresses highlights, so the linear-domain
        // error can exceed one step slightly near 1.0; bound at 1.5 steps.
        for i in 0..=10_000 {
            let v = i as f32 / 10_000.0;
            let back = byte_to_color(color_to_byte(v));
            assert!((back - v).abs() <= 1.5 / 255.0, "v={v} back={back}");
        }
    }

    #[cfg(not(feature = "srgb8"))]
    #[test]
    fn known_gamma_values() {
        // 0.5^(1/2.2) * 255 ~= 186.07
        assert_eq!(color_to_byte(0.5), 186);
        assert_eq!(color_to_byte(0.25), 136);
    }
}
