// Backend error kinds callers need to tell apart
//
// Everything else is an anyhow chain with context attached at the call site.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// No adapter offers the required extensions, a graphics family, a
    /// present family for the surface, and at least one format and present mode.
    #[error("no suitable GPU found (checked {checked} adapter(s))")]
    NoSuitableDevice { checked: usize },

    /// Shader file is empty or its length is not a whole number of 32-bit words.
    #[error("shader blob {path:?} has invalid size {len} (must be a non-zero multiple of 4)")]
    InvalidShaderBlob { path: PathBuf, len: usize },

    /// The presentation surface is gone; nothing short of a new surface helps.
    #[error("presentation surface lost: {0}")]
    SurfaceLost(vk::Result),
}
