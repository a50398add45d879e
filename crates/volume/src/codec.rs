use std::path::Path;

use common::Result;

/// Whole-file byte-stream transform applied after the container is
/// finalized and before upload, and inverted after download.
///
/// The concrete ciphers are external collaborators; the engine only fixes
/// the seam: a transform renames the remote file by appending its
/// extension segment and must be the exact inverse of itself on the way
/// back.
pub trait Encryptor: Send + Sync {
    /// Extension segment appended to remote names, empty when the
    /// transform is an identity.
    fn extension(&self) -> &'static str;

    /// Transform `source` into `target`.
    fn encrypt(&self, source: &Path, target: &Path) -> Result<()>;

    /// Invert [`Encryptor::encrypt`].
    fn decrypt(&self, source: &Path, target: &Path) -> Result<()>;

    fn is_identity(&self) -> bool {
        self.extension().is_empty()
    }
}

/// Identity transform used when no passphrase is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncryptor;

impl Encryptor for PassthroughEncryptor {
    fn extension(&self) -> &'static str {
        ""
    }

    fn encrypt(&self, source: &Path, target: &Path) -> Result<()> {
        copy(source, target)
    }

    fn decrypt(&self, source: &Path, target: &Path) -> Result<()> {
        copy(source, target)
    }
}

fn copy(source: &Path, target: &Path) -> Result<()> {
    std::fs::copy(source, target).map_err(|e| common::Error::path(source, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_is_identity() {
        let encryptor = PassthroughEncryptor;
        assert!(encryptor.is_identity());

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a");
        let target = dir.path().join("b");
        std::fs::write(&source, b"opaque").unwrap();
        encryptor.encrypt(&source, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"opaque");
    }
}
