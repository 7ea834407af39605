//! Filesystem input probe.

use std::path::Path;

use crate::core::executor::InputProbe;

/// Probe that asks the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsInputProbe;

impl InputProbe for FsInputProbe {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_missing_files() {
        let probe = FsInputProbe;
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        assert!(probe.exists(&manifest));
        let missing = Path::new("/definitely/not/here.png");
        assert_eq!(
            probe.first_missing(&[manifest.as_path(), missing]),
            Some(missing)
        );
    }
}
