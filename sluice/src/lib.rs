#[cfg(feature = "sluice-base")]
pub use sluice_base as base;

#[cfg(feature = "sluice-engine")]
pub use sluice_engine as engine;
