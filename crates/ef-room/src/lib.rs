//! ef-room: Room impulse responses and channel mixing for EchoForge
//!
//! The collaborators around the convolution core:
//! - `generator` - shoebox image-source room responses to feed the engine
//! - `mixer` - gain-summing of the core's per-channel outputs

pub mod generator;
pub mod mixer;

pub use generator::{Room, RoomGenerator, Vec3};
pub use mixer::Mixer;
