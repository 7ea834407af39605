//! Seams to the outside world: the image generator and the input probe.

use std::path::Path;

use async_trait::async_trait;

use crate::core::credential_pool::Credential;
use crate::core::error::GenerationError;
use crate::core::task::Task;

/// Opaque image generation call.
///
/// The scheduler never looks past the [`GenerationError`] classification.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use quota_scheduler::core::{Credential, GenerationError, ImageGenerator, Task};
///
/// #[derive(Clone)]
/// struct EchoGenerator;
///
/// #[async_trait]
/// impl ImageGenerator for EchoGenerator {
///     async fn generate(&self, _credential: &Credential, task: &Task) -> Result<String, GenerationError> {
///         Ok(task.output_path.display().to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait ImageGenerator: Send + Sync + Clone + 'static {
    /// Render `task` using `credential`, returning where the image was written.
    async fn generate(&self, credential: &Credential, task: &Task) -> Result<String, GenerationError>;
}

/// Checks whether a referenced input still exists.
pub trait InputProbe: Send + Sync + std::fmt::Debug {
    /// Whether `path` can still be read.
    fn exists(&self, path: &Path) -> bool;

    /// First of `paths` that no longer exists.
    fn first_missing<'a>(&self, paths: &[&'a Path]) -> Option<&'a Path> {
        paths.iter().copied().find(|p| !self.exists(p))
    }
}
