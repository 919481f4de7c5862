//! Witness directory archiving with tar + zstd.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;

const ZSTD_LEVEL: i32 = 3;

/// Pack the contents of `dir` into `archive_path` (`.tar.zst`), skipping the
/// archive file itself and the engine's own record file.
pub fn pack(dir: &Path, archive_path: &Path, skip: &[&str]) -> Result<()> {
    let file = File::create(archive_path)
        .with_context(|| format!("Failed to create {}", archive_path.display()))?;
    let encoder = zstd::stream::write::Encoder::new(file, ZSTD_LEVEL)
        .context("Failed to start zstd encoder")?
        .auto_finish();
    let mut builder = tar::Builder::new(encoder);

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if skip.iter().any(|s| *s == name_str) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            builder.append_dir_all(name_str.as_ref(), &path)?;
        } else {
            builder.append_path_with_name(&path, name_str.as_ref())?;
        }
    }

    builder.finish().context("Failed to finalize archive")?;
    Ok(())
}

/// Unpack a `.tar.zst` archive into `dir`.
pub fn unpack(archive_path: &Path, dir: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let decoder = zstd::stream::read::Decoder::new(file).context("Failed to start zstd decoder")?;
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dir)
        .with_context(|| format!("Failed to unpack into {}", dir.display()))?;
    Ok(())
}
