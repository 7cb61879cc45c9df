//! Contrast sensitivity function.
//!
//! Sensitivity is the reciprocal of the contrast threshold for a sinusoidal
//! grating of `cpd` cycles per degree seen at an adapting luminance `L`
//! (cd/m²). The fit is calibrated against a reference luminance of 100.

/// Adapting luminance the band thresholds are evaluated at.
pub const REFERENCE_LUMINANCE: f32 = 100.0;

/// Spatial frequency of peak sensitivity at the reference luminance.
pub const PEAK_CPD: f32 = 3.248;

/// Contrast sensitivity at `cpd` cycles per degree and adapting luminance
/// `luminance`. Defined for `cpd >= 0` and `luminance > 0`.
pub fn csf(cpd: f32, luminance: f32) -> f32 {
    debug_assert!(luminance > 0.0, "csf luminance must be positive");
    let a = 440.0 * (1.0 + 0.7 / luminance).powf(-0.2);
    let b = 0.3 * (1.0 + 100.0 / luminance).powf(0.15);

    // exp(-b·cpd) form: finite for every cpd, tends to zero as cpd grows.
    let decay = (-b * cpd).exp();

    a * cpd * (decay * decay + 0.06 * decay).sqrt()
}

/// Peak sensitivity used to normalise band sensitivities into thresholds.
pub fn csf_max() -> f32 {
    csf(PEAK_CPD, REFERENCE_LUMINANCE)
}
