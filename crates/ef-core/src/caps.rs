//! CPU capability detection
//!
//! Detection happens once at startup; the flags ride through engine contexts
//! at construction so components never consult process-wide globals mid-run.

use std::sync::OnceLock;

/// CPU feature flags relevant to the DSP kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCapabilities {
    /// AVX2 + FMA available (x86_64)
    pub avx2_fma: bool,
    /// NEON available (aarch64)
    pub neon: bool,
}

impl CpuCapabilities {
    /// Detect once and cache.
    pub fn detect() -> Self {
        static DETECTED: OnceLock<CpuCapabilities> = OnceLock::new();
        *DETECTED.get_or_init(|| {
            #[cfg(target_arch = "x86_64")]
            let caps = CpuCapabilities {
                avx2_fma: is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
                neon: false,
            };

            // NEON is always available on aarch64
            #[cfg(target_arch = "aarch64")]
            let caps = CpuCapabilities {
                avx2_fma: false,
                neon: true,
            };

            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            let caps = CpuCapabilities {
                avx2_fma: false,
                neon: false,
            };

            log::debug!("detected CPU capabilities: {caps:?}");
            caps
        })
    }

    /// Scalar-only capabilities, for forcing the fallback paths in tests.
    pub const fn scalar() -> Self {
        Self {
            avx2_fma: false,
            neon: false,
        }
    }

    /// Any vector unit available?
    #[inline]
    pub fn has_simd(&self) -> bool {
        self.avx2_fma || self.neon
    }
}

impl Default for CpuCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_stable() {
        let a = CpuCapabilities::detect();
        let b = CpuCapabilities::detect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scalar() {
        assert!(!CpuCapabilities::scalar().has_simd());
    }
}
