//! ef-core: Shared types, errors, and utilities for EchoForge
//!
//! This crate provides the foundational types used across all EchoForge crates.

mod caps;
pub mod convert;
mod error;
mod sample;

pub use caps::*;
pub use error::*;
pub use sample::*;

/// Standard sample rate options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SampleRate {
    Hz44100 = 44100,
    Hz48000 = 48000,
    Hz88200 = 88200,
    Hz96000 = 96000,
    Hz176400 = 176400,
    Hz192000 = 192000,
}

impl SampleRate {
    #[inline]
    pub fn as_f32(self) -> f32 {
        self as u32 as f32
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz48000
    }
}
