//! Device-backed resources

pub mod buffer;

pub use buffer::{align_up, GpuBuffer};
