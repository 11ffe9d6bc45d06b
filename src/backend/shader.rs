// Shader module loading
//
// The pipeline consumes precompiled SPIR-V blobs by path. Modules only live
// long enough to build the pipeline.

use super::error::BackendError;
use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

/// Read a compiled shader and split it into 32-bit words.
///
/// Size is the only thing checked; the words go to the driver verbatim.
pub fn load_shader_blob(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader blob {:?}", path))?;

    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(BackendError::InvalidShaderBlob {
            path: path.to_path_buf(),
            len: bytes.len(),
        }
        .into());
    }

    // Copy into u32s rather than casting: a Vec<u8> has no 4-byte alignment guarantee
    let words = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    log::debug!("Loaded shader blob {:?} ({} bytes)", path, bytes.len());
    Ok(words)
}

/// Shader module destroyed on drop
pub struct ShaderModule<'a> {
    pub handle: vk::ShaderModule,
    device: &'a VulkanDevice,
}

impl<'a> ShaderModule<'a> {
    pub fn from_file(device: &'a VulkanDevice, path: &Path) -> Result<Self> {
        let code = load_shader_blob(path)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module from {:?}", path))?;

        Ok(Self { handle, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn blob(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn loads_whole_words() {
        let magic = 0x0723_0203u32.to_ne_bytes();
        let file = blob(&[magic, [1, 0, 0, 0]].concat());

        let words = load_shader_blob(file.path()).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], 0x0723_0203);
        assert_eq!(words[1], u32::from_ne_bytes([1, 0, 0, 0]));
    }

    #[test]
    fn words_are_passed_through_unswapped() {
        // Magic number in the opposite byte order stays as written
        let swapped = 0x0723_0203u32.swap_bytes().to_ne_bytes();
        let file = blob(&[swapped, [0xAA, 0xBB, 0xCC, 0xDD]].concat());

        let words = load_shader_blob(file.path()).unwrap();
        assert_eq!(words[0], 0x0723_0203u32.swap_bytes());
        assert_eq!(words[1], u32::from_ne_bytes([0xAA, 0xBB, 0xCC, 0xDD]));
    }

    #[test]
    fn rejects_partial_words() {
        let file = blob(&[1, 2, 3, 4, 5, 6]);
        let err = load_shader_blob(file.path()).unwrap_err();
        match err.downcast_ref::<BackendError>() {
            Some(BackendError::InvalidShaderBlob { len, .. }) => assert_eq!(*len, 6),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn rejects_empty_blob() {
        let file = blob(&[]);
        let err = load_shader_blob(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::InvalidShaderBlob { len: 0, .. })
        ));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_shader_blob(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("exist.spv"));
    }
}
