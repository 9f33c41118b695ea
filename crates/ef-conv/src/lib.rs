//! ef-conv: Real-time multi-channel FIR convolution for EchoForge
//!
//! The core engine: streaming audio blocks convolved against long impulse
//! responses, with click-free IR hot-swap.
//!
//! ## Modules
//! - `config` - method selection, geometry, the non-uniform cost model
//! - `ir_store` - triple-buffered (version, channel) filter slots
//! - `time_domain` / `overlap_add` / `uniform` / `non_uniform` - the
//!   algorithm variants
//! - `engine` - the `Convolution` API and update/process coordinator
//! - `worker` - the background IR transform thread
//!
//! ## Hard constraints
//! - every block of input yields a block of output before the next arrives
//! - IRs may be replaced at any time; the engine cross-fades old to new
//!   over one block window without artifacts
//! - filter slots are addressed by (version, channel) and rotate through
//!   current / previous / update roles

pub mod config;
pub mod engine;
pub mod event;
pub mod ir_store;
pub mod non_uniform;
pub mod overlap_add;
pub mod pass;
pub mod time_domain;
pub mod uniform;
pub mod worker;

pub use config::{
    ChannelFlags, ConvLayout, ConvolutionConfig, ConvolutionMethod, N_VERSIONS, UpdateOptions,
    best_nu_multiple,
};
pub use engine::{Convolution, process_direct};
pub use ir_store::{IrSlot, IrStore, SlotIndices, TransformedIr};
pub use pass::{CrossfadePhase, PassStage, ProcessPass};
