#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

mod drv;
mod store_path;

pub use drv::{Derivation, Output, query_drv};
pub use store_path::{HASH_LEN, StorePath};

use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("recipe parse error: `{0}`")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported recipe version: `{0}`")]
    UnsupportedRecipeVersion(u32),
}

pub trait BaseStore {
    fn store_dir(&self) -> &Path;

    /// Full filesystem path for a store path.
    fn print_store_path(&self, p: &StorePath) -> String {
        format!("{}/{}", self.store_dir().display(), p.base_name())
    }
}

/// Filesystem-backed store. Realisation state is judged by path
/// existence; recipes are read and parsed from their store path.
#[derive(Debug, Clone)]
pub struct LocalStore {
    store_dir: Arc<PathBuf>,
}

impl BaseStore for LocalStore {
    fn store_dir(&self) -> &Path {
        &self.store_dir
    }
}

impl LocalStore {
    #[must_use]
    pub fn new(store_dir: PathBuf) -> Self {
        Self {
            store_dir: Arc::new(store_dir),
        }
    }

    pub async fn is_valid_path(&self, p: &StorePath) -> bool {
        fs_err::tokio::try_exists(self.print_store_path(p))
            .await
            .unwrap_or(false)
    }

    /// Outputs of a derivation that are not yet realised in the store.
    /// Outputs without a known path are always considered missing.
    pub async fn query_missing_outputs(&self, outputs: Vec<Output>) -> Vec<Output> {
        let mut missing = Vec::new();
        for o in outputs {
            match &o.path {
                Some(p) if self.is_valid_path(p).await => (),
                _ => missing.push(o),
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn write_store_file(dir: &tempfile::TempDir, base_name: &str, content: &str) {
        std::fs::write(dir.path().join(base_name), content).unwrap();
    }

    #[tokio::test]
    async fn test_is_valid_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        write_store_file(&dir, "abc123def45678901234567890123456-present", "");

        assert!(
            store
                .is_valid_path(&StorePath::new("abc123def45678901234567890123456-present"))
                .await
        );
        assert!(
            !store
                .is_valid_path(&StorePath::new("abc123def45678901234567890123456-missing"))
                .await
        );
    }

    #[tokio::test]
    async fn test_query_missing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        write_store_file(&dir, "abc123def45678901234567890123456-built", "");

        let outputs = vec![
            Output {
                name: "out".into(),
                path: Some(StorePath::new("abc123def45678901234567890123456-built")),
            },
            Output {
                name: "doc".into(),
                path: Some(StorePath::new("abc123def45678901234567890123456-unbuilt")),
            },
            Output {
                name: "floating".into(),
                path: None,
            },
        ];

        let missing = store.query_missing_outputs(outputs).await;
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].name, "doc");
        assert_eq!(missing[1].name, "floating");
    }

    #[tokio::test]
    async fn test_query_drv_reads_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        write_store_file(
            &dir,
            "abc123def45678901234567890123456-pkg.drv",
            r#"{"system": "x86_64-linux", "outputs": [{"name": "out"}]}"#,
        );

        let drv = query_drv(
            &store,
            &StorePath::new("abc123def45678901234567890123456-pkg.drv"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(drv.platform, "x86_64-linux");

        // not a recipe path
        let none = query_drv(
            &store,
            &StorePath::new("abc123def45678901234567890123456-pkg"),
        )
        .await
        .unwrap();
        assert!(none.is_none());
    }
}
