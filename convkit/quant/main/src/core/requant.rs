//! Calibrated activation quantization and accumulator requantization.
//!
//! Activations use externally calibrated `(scale, zero_point)` pairs; nothing
//! here inspects data to pick a range. Conversions to integers round to
//! nearest (ties to even) and saturate rather than wrap.

use convkit_core::{QuantParams, SamplingKind};

use crate::api::error::{QuantError, QuantResult};

/// Only offline-calibrated parameters are accepted.
pub fn validate_calibration(kind: SamplingKind) -> QuantResult<()> {
    match kind {
        SamplingKind::Calibrated => Ok(()),
        other => Err(QuantError::Calibration(format!(
            "int8 execution needs calibrated scales, got {:?} sampling",
            other
        ))),
    }
}

fn validate_params(what: &str, params: QuantParams) -> QuantResult<()> {
    if !params.scale.is_finite() || params.scale <= 0.0 {
        return Err(QuantError::InvalidScale(format!(
            "{} scale must be finite and positive, got {}",
            what, params.scale
        )));
    }
    if !params.zero_point.is_finite() {
        return Err(QuantError::InvalidScale(format!(
            "{} zero point must be finite, got {}",
            what, params.zero_point
        )));
    }
    Ok(())
}

#[inline]
fn saturate(x: f32, lo: f32, hi: f32) -> f32 {
    x.round_ties_even().clamp(lo, hi)
}

/// `q = sat_u8(round(x / scale + zero_point))`
#[inline]
pub fn quantize_u8(x: f32, params: QuantParams) -> u8 {
    saturate(x / params.scale + params.zero_point, 0.0, 255.0) as u8
}

/// `x = scale * (q - zero_point)`
#[inline]
pub fn dequantize_u8(q: u8, params: QuantParams) -> f32 {
    params.scale * (q as f32 - params.zero_point)
}

/// Real value of an i32 accumulator:
/// `(acc - z_src * factor) * s_src * s_w`.
///
/// `factor` is the row-sum of the quantized weights feeding `acc`, so
/// `z_src * factor` removes the contribution of the input zero point.
#[inline]
pub fn dequantize_accumulator(acc: i32, factor: i32, src: QuantParams, w_scale: f32) -> f32 {
    (acc as f32 - src.zero_point * factor as f32) * src.scale * w_scale
}

/// Maps real values onto an output's integer grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Requantizer {
    inv_scale: f32,
    zero_point: f32,
}

impl Requantizer {
    pub fn new(params: QuantParams) -> QuantResult<Self> {
        validate_params("output", params)?;
        Ok(Self {
            inv_scale: 1.0 / params.scale,
            zero_point: params.zero_point,
        })
    }

    /// Check u8 input parameters. On top of the output-side rules the zero
    /// point must be a u8 value: spatial padding is filled with it, and the
    /// `z * factor` correction only cancels padded taps when the two agree.
    pub fn validate_input(params: QuantParams) -> QuantResult<()> {
        validate_params("input", params)?;
        let z = params.zero_point;
        if z.fract() != 0.0 || !(0.0..=255.0).contains(&z) {
            return Err(QuantError::InvalidScale(format!(
                "input zero point must be a whole number in [0, 255], got {}",
                z
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn to_u8(&self, x: f32) -> u8 {
        saturate(x * self.inv_scale + self.zero_point, 0.0, 255.0) as u8
    }

    #[inline]
    pub fn to_i8(&self, x: f32) -> i8 {
        saturate(x * self.inv_scale + self.zero_point, -128.0, 127.0) as i8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(scale: f32, zero_point: f32) -> QuantParams {
        QuantParams { scale, zero_point }
    }

    #[test]
    fn test_calibration_required() {
        assert!(validate_calibration(SamplingKind::Calibrated).is_ok());
        assert!(matches!(validate_calibration(SamplingKind::Coarse), Err(QuantError::Calibration(_))));
        assert!(matches!(validate_calibration(SamplingKind::Fine), Err(QuantError::Calibration(_))));
    }

    #[test]
    fn test_invalid_scales() {
        assert!(Requantizer::new(params(0.0, 0.0)).is_err());
        assert!(Requantizer::new(params(-1.0, 0.0)).is_err());
        assert!(Requantizer::new(params(f32::NAN, 0.0)).is_err());
        assert!(Requantizer::validate_input(params(0.5, f32::INFINITY)).is_err());
    }

    #[test]
    fn test_input_zero_point_on_u8_grid() {
        assert!(Requantizer::validate_input(params(0.02, 0.0)).is_ok());
        assert!(Requantizer::validate_input(params(0.02, 128.0)).is_ok());
        assert!(Requantizer::validate_input(params(0.02, 255.0)).is_ok());
        for z in [127.5, 0.25, -1.0, 256.0, 300.0] {
            assert!(
                matches!(Requantizer::validate_input(params(0.02, z)), Err(QuantError::InvalidScale(_))),
                "zero point {} accepted",
                z
            );
        }
        // output zero points only shift the rounding grid
        assert!(Requantizer::new(params(0.02, 127.5)).is_ok());
    }

    #[test]
    fn test_saturation_not_wrapping() {
        let rq = Requantizer::new(params(0.5, 10.0)).unwrap();
        assert_eq!(rq.to_u8(1000.0), 255);
        assert_eq!(rq.to_u8(-1000.0), 0);
        assert_eq!(rq.to_i8(1000.0), 127);
        assert_eq!(rq.to_i8(-1000.0), -128);
        assert_eq!(rq.to_u8(1.0), 12);
    }

    #[test]
    fn test_round_ties_even() {
        let rq = Requantizer::new(params(1.0, 0.0)).unwrap();
        assert_eq!(rq.to_u8(2.5), 2);
        assert_eq!(rq.to_u8(3.5), 4);
        assert_eq!(rq.to_i8(-2.5), -2);
    }

    #[test]
    fn test_activation_roundtrip_within_half_step() {
        let p = params(0.05, 128.0);
        for i in -100..100 {
            let x = i as f32 * 0.031;
            let back = dequantize_u8(quantize_u8(x, p), p);
            assert!((back - x).abs() <= 0.5 * p.scale + 1e-5, "x={} back={}", x, back);
        }
    }

    #[test]
    fn test_dequantize_accumulator_zero_point() {
        // inputs sitting at the zero point contribute nothing
        let src = params(0.1, 3.0);
        let factor = 7;
        let acc = 3 * factor;
        assert_eq!(dequantize_accumulator(acc, factor, src, 0.25), 0.0);
        let acc = 3 * factor + 40;
        assert!((dequantize_accumulator(acc, factor, src, 0.25) - 1.0).abs() < 1e-6);
    }
}
