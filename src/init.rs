use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

const AUDIO_DIR: &str = "audio";

/// Creates the output directory and its `audio/` subdirectory.
pub async fn ensure_directories(output_dir: &Path) -> Result<()> {
    for dir in [output_dir.to_path_buf(), audio_dir(output_dir)] {
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            tracing::info!("Created directory: {}", dir.display());
        }
    }
    Ok(())
}

pub fn audio_dir(output_dir: &Path) -> PathBuf {
    output_dir.join(AUDIO_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_nested_output_tree() {
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("renders");
        ensure_directories(&out).await.unwrap();
        assert!(audio_dir(&out).is_dir());
        // second call is a no-op
        ensure_directories(&out).await.unwrap();
    }
}
