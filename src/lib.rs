//! Instance memory management for NVIDIA GPUs from Curie through Maxwell.
//!
//! [`Instmem`] owns the pinned, GPU-visible memory that holds hardware objects
//! (RAMHT, RAMFC, page tables, channel contexts) and hands it out as RAII
//! [`InstanceObject`]s. Hardware is reached through the traits in [`device`];
//! [`device::sim`] implements them on the host for tests and demos.

pub mod device;
pub mod error;
pub mod instmem;
pub mod mm;
pub mod utils;

pub use error::{InstmemError, InstmemResult};
pub use instmem::{InstFlags, InstanceObject, Instmem, InstmemState, MemDescriptor, Strategy};
