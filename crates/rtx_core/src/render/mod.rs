//! Rendering backends and frame dispatch

pub mod backends;
