//! Shared utility functions.

use std::path::{Component, Path};

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run blocking work (git, file IO) off the async workers.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Check that a resource names a path inside the working tree.
///
/// Resources are relative paths; absolute paths and `..` segments are
/// rejected.
pub fn resource_path(resource: &str) -> Result<&Path> {
    let path = Path::new(resource);
    if resource.trim().is_empty() {
        return Err(Error::Validation("empty resource path".to_string()));
    }
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::Validation(format!(
            "resource {} is outside the working tree",
            resource
        )));
    }
    Ok(path)
}
