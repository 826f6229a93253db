//! Label document storage.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plp_gateway::LabelArtifact;
use plp_types::BatchId;

/// Where downloaded labels are kept.
pub trait LabelArchive {
    /// Persist `artifact` and return a reference to it for the item record.
    fn store(&self, batch_id: BatchId, order_ref: &str, artifact: &LabelArtifact) -> Result<String>;
}

/// Labels as files under `<root>/<batch_id>/`.
#[derive(Debug, Clone)]
pub struct FsLabelArchive {
    root: PathBuf,
}

impl FsLabelArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute path of a reference returned by [`LabelArchive::store`].
    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }
}

impl LabelArchive for FsLabelArchive {
    fn store(&self, batch_id: BatchId, order_ref: &str, artifact: &LabelArtifact) -> Result<String> {
        let file_name = format!(
            "{}-{}",
            sanitize(order_ref),
            sanitize(&artifact.file_name)
        );
        let reference = format!("{batch_id}/{file_name}");
        let path = self.resolve(&reference);
        write_atomic(&path, &artifact.bytes)?;
        Ok(reference)
    }
}

/// Keep file names to a portable character set.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "label".to_string()
    } else {
        cleaned.to_string()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create label dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("part");
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move label into place at {}", path.display()))?;
    Ok(())
}
