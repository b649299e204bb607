use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Resolves script-relative asset references (avatars, images, sound effects)
/// and keeps every resolved path inside the script directory.
#[derive(Debug, Clone)]
pub struct AssetSandbox {
    root: PathBuf,
}

impl AssetSandbox {
    pub fn new(script_dir: &Path) -> Result<Self> {
        let root = fs::canonicalize(script_dir)
            .with_context(|| format!("asset root {} is not readable", script_dir.display()))?;
        Ok(Self { root })
    }

    /// Canonical path of `reference`, which must be a file under the root.
    /// Symlinks are followed before the containment check.
    pub fn resolve(&self, reference: impl AsRef<Path>) -> Result<PathBuf> {
        let reference = reference.as_ref();
        let candidate = self.root.join(reference);
        let canonical = fs::canonicalize(&candidate)
            .with_context(|| format!("asset '{}' does not exist", reference.display()))?;
        if !canonical.starts_with(&self.root) {
            bail!(
                "path traversal violation: '{}' resolves outside {}",
                reference.display(),
                self.root.display()
            );
        }
        if !canonical.is_file() {
            bail!("asset '{}' is not a file", reference.display());
        }
        Ok(canonical)
    }

    /// Resolves a sound effect by name. A bare name is looked up as
    /// `sfx/<name>.{mp3,wav,m4a,ogg}` before trying it as a literal path.
    pub fn resolve_sfx(&self, name: &str) -> Result<PathBuf> {
        let name = name.trim();
        if name.is_empty() {
            bail!("sound effect name is empty");
        }
        if Path::new(name).extension().is_none() {
            for ext in ["mp3", "wav", "m4a", "ogg"] {
                if let Ok(found) = self.resolve(format!("sfx/{name}.{ext}")) {
                    return Ok(found);
                }
            }
        }
        self.resolve(name)
            .with_context(|| format!("sound effect '{name}' was not found"))
    }
}
