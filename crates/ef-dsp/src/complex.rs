//! Complex-vector math with runtime SIMD dispatch
//!
//! Element-wise kernels used by every frequency-domain convolution path:
//! - `complex_mul` / `complex_mul_accum` - interleaved RI layout
//! - `planar_complex_mul_accum` - separate re/im arrays, the layout the
//!   partitioned MAC loops run over
//! - `complex_div` - interleaved RI layout
//!
//! # Design
//! - Detection happens once at startup
//! - Dispatch tables are static function pointers
//! - AVX2+FMA processes 8 complex pairs per iteration, NEON 4, else scalar
//! - Results match the scalar forms exactly up to float32 rounding:
//!   `acc_r += a_r*b_r - a_i*b_i`, `acc_i += a_r*b_i + a_i*b_r`

use ef_core::Sample;
use std::sync::OnceLock;

// ============ SIMD Level Detection ============

/// Detected SIMD capability level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SimdLevel {
    /// No SIMD, scalar fallback
    Scalar = 0,
    /// AVX2 + FMA (256-bit, 8 f32s)
    Avx2Fma = 1,
    /// ARM NEON (128-bit, 4 f32s)
    Neon = 2,
}

impl SimdLevel {
    /// SIMD width in f32 elements
    pub const fn width(self) -> usize {
        match self {
            SimdLevel::Scalar => 1,
            SimdLevel::Avx2Fma => 8,
            SimdLevel::Neon => 4,
        }
    }

    /// Human-readable name
    pub const fn name(self) -> &'static str {
        match self {
            SimdLevel::Scalar => "Scalar",
            SimdLevel::Avx2Fma => "AVX2+FMA",
            SimdLevel::Neon => "NEON",
        }
    }
}

/// Global SIMD level detection (computed once)
static DETECTED_SIMD_LEVEL: OnceLock<SimdLevel> = OnceLock::new();

/// Detect the best available SIMD level
pub fn detect_simd_level() -> SimdLevel {
    *DETECTED_SIMD_LEVEL.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return SimdLevel::Avx2Fma;
            }
            SimdLevel::Scalar
        }

        #[cfg(target_arch = "aarch64")]
        {
            // NEON is always available on aarch64
            SimdLevel::Neon
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            SimdLevel::Scalar
        }
    })
}

/// Current SIMD level (cached)
#[inline]
pub fn simd_level() -> SimdLevel {
    detect_simd_level()
}

// ============ Dispatch Function Types ============

/// `out = a * b`, interleaved RI, slices of `2 * pairs` floats
pub type ComplexMulFn = fn(&[Sample], &[Sample], &mut [Sample]);

/// `acc += a * b`, interleaved RI
pub type ComplexMacFn = fn(&[Sample], &[Sample], &mut [Sample]);

/// `acc += a * b`, planar: (a_re, a_im, b_re, b_im, acc_re, acc_im)
pub type PlanarMacFn = fn(&[Sample], &[Sample], &[Sample], &[Sample], &mut [Sample], &mut [Sample]);

// ============ Dispatch Table ============

/// Dispatch table for the complex kernels
pub struct MathDispatch {
    pub complex_mul: ComplexMulFn,
    pub complex_mul_accum: ComplexMacFn,
    pub planar_complex_mul_accum: PlanarMacFn,
    /// SIMD level used
    pub level: SimdLevel,
}

impl MathDispatch {
    /// Get the global dispatch table
    pub fn get() -> &'static Self {
        static DISPATCH: OnceLock<MathDispatch> = OnceLock::new();
        DISPATCH.get_or_init(|| Self::new(detect_simd_level()))
    }

    /// Create a dispatch table for a specific SIMD level
    pub fn new(level: SimdLevel) -> Self {
        match level {
            SimdLevel::Avx2Fma => Self {
                complex_mul: complex_mul_avx2,
                complex_mul_accum: complex_mul_accum_avx2,
                planar_complex_mul_accum: planar_mac_avx2,
                level,
            },
            SimdLevel::Neon => Self {
                complex_mul: complex_mul_neon,
                complex_mul_accum: complex_mul_accum_neon,
                planar_complex_mul_accum: planar_mac_neon,
                level,
            },
            SimdLevel::Scalar => Self {
                complex_mul: complex_mul_scalar,
                complex_mul_accum: complex_mul_accum_scalar,
                planar_complex_mul_accum: planar_mac_scalar,
                level,
            },
        }
    }
}

// ============ Scalar Implementations (Fallback) ============

pub fn complex_mul_scalar(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
    let pairs = (a.len().min(b.len()).min(out.len())) / 2;
    for i in 0..pairs {
        let (ar, ai) = (a[2 * i], a[2 * i + 1]);
        let (br, bi) = (b[2 * i], b[2 * i + 1]);
        out[2 * i] = ar * br - ai * bi;
        out[2 * i + 1] = ar * bi + ai * br;
    }
}

pub fn complex_mul_accum_scalar(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
    let pairs = (a.len().min(b.len()).min(acc.len())) / 2;
    for i in 0..pairs {
        let (ar, ai) = (a[2 * i], a[2 * i + 1]);
        let (br, bi) = (b[2 * i], b[2 * i + 1]);
        acc[2 * i] += ar * br - ai * bi;
        acc[2 * i + 1] += ar * bi + ai * br;
    }
}

pub fn planar_mac_scalar(
    a_re: &[Sample],
    a_im: &[Sample],
    b_re: &[Sample],
    b_im: &[Sample],
    acc_re: &mut [Sample],
    acc_im: &mut [Sample],
) {
    let n = a_re
        .len()
        .min(a_im.len())
        .min(b_re.len())
        .min(b_im.len())
        .min(acc_re.len())
        .min(acc_im.len());
    for i in 0..n {
        acc_re[i] += a_re[i] * b_re[i] - a_im[i] * b_im[i];
        acc_im[i] += a_re[i] * b_im[i] + a_im[i] * b_re[i];
    }
}

// ============ x86_64 SIMD Implementations ============

#[cfg(target_arch = "x86_64")]
mod x86_impl {
    use super::*;
    use std::arch::x86_64::*;

    /// One 256-bit lane of interleaved complex product:
    /// `[ar*br - ai*bi, ar*bi + ai*br]` per pair.
    #[inline]
    #[target_feature(enable = "avx2", enable = "fma")]
    unsafe fn mul_lane(va: __m256, vb: __m256) -> __m256 {
        let ar = _mm256_moveldup_ps(va);
        let ai = _mm256_movehdup_ps(va);
        let bswap = _mm256_permute_ps::<0xB1>(vb);
        let t = _mm256_mul_ps(ai, bswap);
        _mm256_fmaddsub_ps(ar, vb, t)
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn complex_mul_impl(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
        let len = a.len().min(b.len()).min(out.len()) & !1;
        // 8 complex pairs (16 floats) per iteration, two 256-bit lanes
        let simd_len = len - (len % 16);
        let pa = a.as_ptr();
        let pb = b.as_ptr();
        let po = out.as_mut_ptr();

        for i in (0..simd_len).step_by(16) {
            let a0 = _mm256_loadu_ps(pa.add(i));
            let b0 = _mm256_loadu_ps(pb.add(i));
            let a1 = _mm256_loadu_ps(pa.add(i + 8));
            let b1 = _mm256_loadu_ps(pb.add(i + 8));
            _mm256_storeu_ps(po.add(i), mul_lane(a0, b0));
            _mm256_storeu_ps(po.add(i + 8), mul_lane(a1, b1));
        }

        debug_assert!(simd_len <= len, "AVX2 remainder loop bounds check failed");
        complex_mul_scalar(&a[simd_len..len], &b[simd_len..len], &mut out[simd_len..len]);
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn complex_mul_accum_impl(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
        let len = a.len().min(b.len()).min(acc.len()) & !1;
        let simd_len = len - (len % 16);
        let pa = a.as_ptr();
        let pb = b.as_ptr();
        let pc = acc.as_mut_ptr();

        for i in (0..simd_len).step_by(16) {
            let a0 = _mm256_loadu_ps(pa.add(i));
            let b0 = _mm256_loadu_ps(pb.add(i));
            let c0 = _mm256_loadu_ps(pc.add(i));
            let a1 = _mm256_loadu_ps(pa.add(i + 8));
            let b1 = _mm256_loadu_ps(pb.add(i + 8));
            let c1 = _mm256_loadu_ps(pc.add(i + 8));
            _mm256_storeu_ps(pc.add(i), _mm256_add_ps(c0, mul_lane(a0, b0)));
            _mm256_storeu_ps(pc.add(i + 8), _mm256_add_ps(c1, mul_lane(a1, b1)));
        }

        debug_assert!(simd_len <= len, "AVX2 remainder loop bounds check failed");
        complex_mul_accum_scalar(&a[simd_len..len], &b[simd_len..len], &mut acc[simd_len..len]);
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn planar_mac_impl(
        a_re: &[Sample],
        a_im: &[Sample],
        b_re: &[Sample],
        b_im: &[Sample],
        acc_re: &mut [Sample],
        acc_im: &mut [Sample],
    ) {
        let n = a_re
            .len()
            .min(a_im.len())
            .min(b_re.len())
            .min(b_im.len())
            .min(acc_re.len())
            .min(acc_im.len());
        // 8 complex values per iteration (one f32x8 per plane)
        let simd_len = n - (n % 8);

        for i in (0..simd_len).step_by(8) {
            let ar = _mm256_loadu_ps(a_re.as_ptr().add(i));
            let ai = _mm256_loadu_ps(a_im.as_ptr().add(i));
            let br = _mm256_loadu_ps(b_re.as_ptr().add(i));
            let bi = _mm256_loadu_ps(b_im.as_ptr().add(i));

            let mut cr = _mm256_loadu_ps(acc_re.as_ptr().add(i));
            cr = _mm256_fmadd_ps(ar, br, cr);
            cr = _mm256_fnmadd_ps(ai, bi, cr);
            _mm256_storeu_ps(acc_re.as_mut_ptr().add(i), cr);

            let mut ci = _mm256_loadu_ps(acc_im.as_ptr().add(i));
            ci = _mm256_fmadd_ps(ar, bi, ci);
            ci = _mm256_fmadd_ps(ai, br, ci);
            _mm256_storeu_ps(acc_im.as_mut_ptr().add(i), ci);
        }

        debug_assert!(simd_len <= n, "AVX2 planar remainder bounds check failed");
        planar_mac_scalar(
            &a_re[simd_len..n],
            &a_im[simd_len..n],
            &b_re[simd_len..n],
            &b_im[simd_len..n],
            &mut acc_re[simd_len..n],
            &mut acc_im[simd_len..n],
        );
    }
}

// ============ ARM NEON Implementations ============

#[cfg(target_arch = "aarch64")]
mod arm_impl {
    use super::*;
    use std::arch::aarch64::*;

    pub unsafe fn complex_mul_impl(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
        unsafe {
            let len = a.len().min(b.len()).min(out.len()) & !1;
            // 4 complex pairs (8 floats) per iteration via deinterleaving loads
            let simd_len = len - (len % 8);

            for i in (0..simd_len).step_by(8) {
                let va = vld2q_f32(a.as_ptr().add(i));
                let vb = vld2q_f32(b.as_ptr().add(i));
                let re = vfmsq_f32(vmulq_f32(va.0, vb.0), va.1, vb.1);
                let im = vfmaq_f32(vmulq_f32(va.0, vb.1), va.1, vb.0);
                vst2q_f32(out.as_mut_ptr().add(i), float32x4x2_t(re, im));
            }

            debug_assert!(simd_len <= len, "NEON remainder loop bounds check failed");
            complex_mul_scalar(&a[simd_len..len], &b[simd_len..len], &mut out[simd_len..len]);
        }
    }

    pub unsafe fn complex_mul_accum_impl(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
        unsafe {
            let len = a.len().min(b.len()).min(acc.len()) & !1;
            let simd_len = len - (len % 8);

            for i in (0..simd_len).step_by(8) {
                let va = vld2q_f32(a.as_ptr().add(i));
                let vb = vld2q_f32(b.as_ptr().add(i));
                let vc = vld2q_f32(acc.as_ptr().add(i));
                let re = vfmsq_f32(vfmaq_f32(vc.0, va.0, vb.0), va.1, vb.1);
                let im = vfmaq_f32(vfmaq_f32(vc.1, va.0, vb.1), va.1, vb.0);
                vst2q_f32(acc.as_mut_ptr().add(i), float32x4x2_t(re, im));
            }

            debug_assert!(simd_len <= len, "NEON remainder loop bounds check failed");
            complex_mul_accum_scalar(&a[simd_len..len], &b[simd_len..len], &mut acc[simd_len..len]);
        }
    }

    pub unsafe fn planar_mac_impl(
        a_re: &[Sample],
        a_im: &[Sample],
        b_re: &[Sample],
        b_im: &[Sample],
        acc_re: &mut [Sample],
        acc_im: &mut [Sample],
    ) {
        unsafe {
            let n = a_re
                .len()
                .min(a_im.len())
                .min(b_re.len())
                .min(b_im.len())
                .min(acc_re.len())
                .min(acc_im.len());
            let simd_len = n - (n % 4);

            for i in (0..simd_len).step_by(4) {
                let ar = vld1q_f32(a_re.as_ptr().add(i));
                let ai = vld1q_f32(a_im.as_ptr().add(i));
                let br = vld1q_f32(b_re.as_ptr().add(i));
                let bi = vld1q_f32(b_im.as_ptr().add(i));

                let cr = vld1q_f32(acc_re.as_ptr().add(i));
                vst1q_f32(
                    acc_re.as_mut_ptr().add(i),
                    vfmsq_f32(vfmaq_f32(cr, ar, br), ai, bi),
                );

                let ci = vld1q_f32(acc_im.as_ptr().add(i));
                vst1q_f32(
                    acc_im.as_mut_ptr().add(i),
                    vfmaq_f32(vfmaq_f32(ci, ar, bi), ai, br),
                );
            }

            debug_assert!(simd_len <= n, "NEON planar remainder bounds check failed");
            planar_mac_scalar(
                &a_re[simd_len..n],
                &a_im[simd_len..n],
                &b_re[simd_len..n],
                &b_im[simd_len..n],
                &mut acc_re[simd_len..n],
                &mut acc_im[simd_len..n],
            );
        }
    }
}

// ============ Safe Wrapper Functions ============

#[cfg(target_arch = "x86_64")]
fn complex_mul_avx2(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
    unsafe { x86_impl::complex_mul_impl(a, b, out) }
}

#[cfg(target_arch = "x86_64")]
fn complex_mul_accum_avx2(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
    unsafe { x86_impl::complex_mul_accum_impl(a, b, acc) }
}

#[cfg(target_arch = "x86_64")]
fn planar_mac_avx2(
    a_re: &[Sample],
    a_im: &[Sample],
    b_re: &[Sample],
    b_im: &[Sample],
    acc_re: &mut [Sample],
    acc_im: &mut [Sample],
) {
    unsafe { x86_impl::planar_mac_impl(a_re, a_im, b_re, b_im, acc_re, acc_im) }
}

#[cfg(target_arch = "aarch64")]
fn complex_mul_neon(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
    unsafe { arm_impl::complex_mul_impl(a, b, out) }
}

#[cfg(target_arch = "aarch64")]
fn complex_mul_accum_neon(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
    unsafe { arm_impl::complex_mul_accum_impl(a, b, acc) }
}

#[cfg(target_arch = "aarch64")]
fn planar_mac_neon(
    a_re: &[Sample],
    a_im: &[Sample],
    b_re: &[Sample],
    b_im: &[Sample],
    acc_re: &mut [Sample],
    acc_im: &mut [Sample],
) {
    unsafe { arm_impl::planar_mac_impl(a_re, a_im, b_re, b_im, acc_re, acc_im) }
}

// Fallback stubs for non-matching architectures
#[cfg(not(target_arch = "x86_64"))]
fn complex_mul_avx2(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
    complex_mul_scalar(a, b, out)
}
#[cfg(not(target_arch = "x86_64"))]
fn complex_mul_accum_avx2(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
    complex_mul_accum_scalar(a, b, acc)
}
#[cfg(not(target_arch = "x86_64"))]
fn planar_mac_avx2(
    a_re: &[Sample],
    a_im: &[Sample],
    b_re: &[Sample],
    b_im: &[Sample],
    acc_re: &mut [Sample],
    acc_im: &mut [Sample],
) {
    planar_mac_scalar(a_re, a_im, b_re, b_im, acc_re, acc_im)
}

#[cfg(not(target_arch = "aarch64"))]
fn complex_mul_neon(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
    complex_mul_scalar(a, b, out)
}
#[cfg(not(target_arch = "aarch64"))]
fn complex_mul_accum_neon(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
    complex_mul_accum_scalar(a, b, acc)
}
#[cfg(not(target_arch = "aarch64"))]
fn planar_mac_neon(
    a_re: &[Sample],
    a_im: &[Sample],
    b_re: &[Sample],
    b_im: &[Sample],
    acc_re: &mut [Sample],
    acc_im: &mut [Sample],
) {
    planar_mac_scalar(a_re, a_im, b_re, b_im, acc_re, acc_im)
}

// ============ Convenience Functions ============

/// `out = a * b`, interleaved RI, using the best available SIMD
#[inline]
pub fn complex_mul(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
    (MathDispatch::get().complex_mul)(a, b, out)
}

/// `acc += a * b`, interleaved RI, using the best available SIMD
#[inline]
pub fn complex_mul_accum(a: &[Sample], b: &[Sample], acc: &mut [Sample]) {
    (MathDispatch::get().complex_mul_accum)(a, b, acc)
}

/// `acc += a * b`, planar layout, using the best available SIMD
#[inline]
pub fn planar_complex_mul_accum(
    a_re: &[Sample],
    a_im: &[Sample],
    b_re: &[Sample],
    b_im: &[Sample],
    acc_re: &mut [Sample],
    acc_im: &mut [Sample],
) {
    (MathDispatch::get().planar_complex_mul_accum)(a_re, a_im, b_re, b_im, acc_re, acc_im)
}

/// `out = a / b`, interleaved RI.
///
/// Not on the per-block path; the deconvolution/EQ callers tolerate scalar.
pub fn complex_div(a: &[Sample], b: &[Sample], out: &mut [Sample]) {
    let pairs = (a.len().min(b.len()).min(out.len())) / 2;
    for i in 0..pairs {
        let (ar, ai) = (a[2 * i], a[2 * i + 1]);
        let (br, bi) = (b[2 * i], b[2 * i + 1]);
        let d = br * br + bi * bi;
        out[2 * i] = (ar * br + ai * bi) / d;
        out[2 * i + 1] = (ai * br - ar * bi) / d;
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;

    fn ri_buf(n_pairs: usize, seed: Sample) -> Vec<Sample> {
        (0..2 * n_pairs)
            .map(|i| ((i as Sample) * 0.37 + seed).sin())
            .collect()
    }

    #[test]
    fn test_simd_detection() {
        let level = detect_simd_level();
        assert!(level.width() >= 1);
        assert!(!level.name().is_empty());
    }

    #[test]
    fn test_complex_mul_matches_scalar() {
        // 37 pairs exercises both the SIMD body and the remainder loop
        let a = ri_buf(37, 0.1);
        let b = ri_buf(37, 1.7);
        let mut got = vec![0.0; 74];
        let mut want = vec![0.0; 74];

        complex_mul(&a, &b, &mut got);
        complex_mul_scalar(&a, &b, &mut want);

        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-5, "{g} != {w}");
        }
    }

    #[test]
    fn test_complex_mul_random_buffers() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(42);
        let a: Vec<Sample> = (0..202).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect();
        let b: Vec<Sample> = (0..202).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect();
        let mut got = vec![0.0; 202];
        let mut want = vec![0.0; 202];

        complex_mul(&a, &b, &mut got);
        complex_mul_scalar(&a, &b, &mut want);
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-5);
        }
    }

    #[test]
    fn test_complex_mul_accum_matches_scalar() {
        let a = ri_buf(41, 0.3);
        let b = ri_buf(41, 2.9);
        let mut got = ri_buf(41, 5.0);
        let mut want = got.clone();

        complex_mul_accum(&a, &b, &mut got);
        complex_mul_accum_scalar(&a, &b, &mut want);

        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-4, "{g} != {w}");
        }
    }

    #[test]
    fn test_planar_mac_matches_scalar() {
        let n = 53;
        let a_re: Vec<Sample> = (0..n).map(|i| (i as Sample * 0.11).cos()).collect();
        let a_im: Vec<Sample> = (0..n).map(|i| (i as Sample * 0.23).sin()).collect();
        let b_re: Vec<Sample> = (0..n).map(|i| (i as Sample * 0.31).cos()).collect();
        let b_im: Vec<Sample> = (0..n).map(|i| (i as Sample * 0.41).sin()).collect();
        let mut got_re = vec![0.5; n];
        let mut got_im = vec![-0.5; n];
        let mut want_re = got_re.clone();
        let mut want_im = got_im.clone();

        planar_complex_mul_accum(&a_re, &a_im, &b_re, &b_im, &mut got_re, &mut got_im);
        planar_mac_scalar(&a_re, &a_im, &b_re, &b_im, &mut want_re, &mut want_im);

        for i in 0..n {
            assert!((got_re[i] - want_re[i]).abs() < 1e-5);
            assert!((got_im[i] - want_im[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mul_identity() {
        // (1 + 0i) * z == z
        let ones: Vec<Sample> = (0..16).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let z = ri_buf(8, 0.9);
        let mut out = vec![0.0; 16];
        complex_mul(&ones, &z, &mut out);
        for (o, w) in out.iter().zip(z.iter()) {
            assert!((o - w).abs() < 1e-6);
        }
    }

    #[test]
    fn test_div_inverts_mul() {
        let a = ri_buf(19, 0.2);
        let b: Vec<Sample> = ri_buf(19, 3.1).iter().map(|x| x + 2.0).collect();
        let mut prod = vec![0.0; 38];
        let mut back = vec![0.0; 38];

        complex_mul_scalar(&a, &b, &mut prod);
        complex_div(&prod, &b, &mut back);

        for (g, w) in back.iter().zip(a.iter()) {
            assert!((g - w).abs() < 1e-4, "{g} != {w}");
        }
    }
}
