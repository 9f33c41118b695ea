//! ef-dsp: Transform and complex-vector primitives for EchoForge
//!
//! The two low-level engines everything else is built on:
//! - `fft` - forward/inverse real & complex transforms, power-of-two sizes,
//!   batched over channels, plus Hartley and planar layouts
//! - `complex` - element-wise complex multiply / multiply-accumulate / divide
//!   with runtime SIMD dispatch (AVX2+FMA, NEON, scalar)

pub mod complex;
pub mod fft;

pub use complex::{
    MathDispatch, SimdLevel, complex_div, complex_mul, complex_mul_accum,
    planar_complex_mul_accum, simd_level,
};
pub use fft::{FftEngine, MAX_LOG2_FFT, MIN_LOG2_FFT};
