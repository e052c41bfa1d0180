//! Linear fixed-point quantisation for packed CAN payloads.

/// Largest code representable in `bits` bits.
pub fn max_code(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Map `x` in `[min, max]` onto `[0, 2^bits - 1]`.
///
/// Out-of-range inputs clamp to the ends; the scaled value is truncated, so `min` and `max`
/// land exactly on `0` and the top code.
pub fn encode_uint(x: f32, min: f32, max: f32, bits: u8) -> u32 {
    let span = max - min;
    if !(span > 0.0) || x.is_nan() {
        return 0;
    }
    let top = max_code(bits);
    let clamped = x.clamp(min, max);
    let scaled = ((clamped - min) * top as f32 / span) as u32;
    scaled.min(top)
}

/// Inverse of [`encode_uint`].
pub fn decode_uint(code: u32, min: f32, max: f32, bits: u8) -> f32 {
    let top = max_code(bits);
    let code = code.min(top);
    code as f32 * (max - min) / top as f32 + min
}

/// One quantisation step for a range and width.
pub fn step(min: f32, max: f32, bits: u8) -> f32 {
    (max - min) / max_code(bits) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_scale_and_ends() {
        assert_eq!(encode_uint(0.0, -12.5, 12.5, 16), 32767);
        assert_eq!(encode_uint(12.5, -12.5, 12.5, 16), 65535);
        assert_eq!(encode_uint(-12.5, -12.5, 12.5, 16), 0);
        assert_eq!(encode_uint(50.0, 0.0, 50.0, 12), 4095);
        assert_eq!(encode_uint(0.0, 0.0, 5.0, 12), 0);
    }

    #[test]
    fn out_of_range_clamps() {
        assert_eq!(encode_uint(100.0, -12.5, 12.5, 16), 65535);
        assert_eq!(encode_uint(-100.0, -12.5, 12.5, 16), 0);
        assert_eq!(encode_uint(f32::NAN, -1.0, 1.0, 12), 0);
        assert_eq!(encode_uint(1.0, 1.0, 1.0, 12), 0);
    }

    #[test]
    fn round_trip_is_within_one_step() {
        let ranges = [(-12.5f32, 12.5f32), (-30.0, 30.0), (-10.0, 10.0), (0.0, 50.0), (0.0, 5.0)];
        for bits in [12u8, 16] {
            for (min, max) in ranges {
                let tolerance = step(min, max, bits) * 1.001;
                for i in 0..=1000 {
                    let x = min + (max - min) * i as f32 / 1000.0;
                    let back = decode_uint(encode_uint(x, min, max, bits), min, max, bits);
                    assert!(
                        (back - x).abs() <= tolerance,
                        "bits={bits} range=({min},{max}) x={x} back={back}"
                    );
                }
            }
        }
    }

    #[test]
    fn decode_ends() {
        assert_eq!(decode_uint(0, -12.5, 12.5, 16), -12.5);
        assert!((decode_uint(65535, -12.5, 12.5, 16) - 12.5).abs() < 1e-5);
        assert!((decode_uint(9999, -1.0, 1.0, 12) - 1.0).abs() < 1e-6);
    }
}
