//! Loading compiled SPIR-V from disk.
//!
//! Shaders are compiled ahead of time (`glslc foo.vert -o build/foo.vert.spv`)
//! and looked up as `<dir>/<name>.<stage>.spv`.

use crate::error::{GpuError, Result};
use ash::vk;
use std::io;
use std::path::{Path, PathBuf};

/// Pipeline stage a shader file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// File name infix, as produced by `glslc`.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Compute => "comp",
        }
    }

    pub fn vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Path of the compiled shader `name` for `stage` inside `dir`.
pub fn shader_path(dir: &Path, name: &str, stage: ShaderStage) -> PathBuf {
    dir.join(format!("{name}.{}.spv", stage.extension()))
}

/// Read the SPIR-V bytes of shader `name` for `stage` from `dir`.
///
/// A missing file and an unreadable one are reported as different errors.
pub fn load_shader_file(dir: impl AsRef<Path>, name: &str, stage: ShaderStage) -> Result<Vec<u8>> {
    let path = shader_path(dir.as_ref(), name, stage);
    match std::fs::read(&path) {
        Ok(bytes) => {
            tracing::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
            Ok(bytes)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(GpuError::ShaderNotFound(path)),
        Err(source) => Err(GpuError::ShaderUnreadable { path, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "hurdygurdy-shader-file-{}-{test}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn path_follows_stage_convention() {
        let dir = Path::new("build");
        assert_eq!(
            shader_path(dir, "triangle", ShaderStage::Vertex),
            Path::new("build/triangle.vert.spv")
        );
        assert_eq!(
            shader_path(dir, "triangle", ShaderStage::Fragment),
            Path::new("build/triangle.frag.spv")
        );
        assert_eq!(
            shader_path(dir, "blur", ShaderStage::Compute),
            Path::new("build/blur.comp.spv")
        );
    }

    #[test]
    fn loads_existing_file() {
        let dir = scratch_dir("existing");
        let bytes = 0x0723_0203u32.to_le_bytes();
        std::fs::write(dir.join("mesh.frag.spv"), bytes).unwrap();

        let loaded = load_shader_file(&dir, "mesh", ShaderStage::Fragment).unwrap();
        assert_eq!(loaded, bytes);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = scratch_dir("missing");
        let err = load_shader_file(&dir, "nope", ShaderStage::Vertex).unwrap_err();
        assert!(matches!(err, GpuError::ShaderNotFound(ref path) if path.ends_with("nope.vert.spv")));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn directory_in_place_of_file_is_unreadable() {
        let dir = scratch_dir("unreadable");
        std::fs::create_dir_all(dir.join("odd.comp.spv")).unwrap();

        let err = load_shader_file(&dir, "odd", ShaderStage::Compute).unwrap_err();
        assert!(matches!(err, GpuError::ShaderUnreadable { .. }));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
