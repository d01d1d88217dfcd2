use std::path::{Component, Path, PathBuf};

use actix_files::NamedFile;

/// Pre-built single-page app served next to the API.
#[derive(Debug, Clone)]
pub struct Frontend {
    dist_dir: PathBuf,
}

impl Frontend {
    pub fn new(dist_dir: impl Into<PathBuf>) -> Self {
        Self {
            dist_dir: dist_dir.into(),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.dist_dir.join("index.html")
    }

    /// Maps an already percent-decoded request tail onto the bundle. Paths
    /// that try to climb out of the bundle resolve to nothing.
    pub fn asset_path(&self, tail: &str) -> Option<PathBuf> {
        let relative = Path::new(tail.trim_start_matches('/'));
        let mut resolved = self.dist_dir.clone();
        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        (depth > 0).then_some(resolved)
    }

    /// Opens a bundle asset, skipping directories and missing files.
    pub async fn asset(&self, tail: &str) -> Option<NamedFile> {
        open_regular_file(self.asset_path(tail)?).await
    }

    /// Opens `index.html` if the frontend has been built.
    pub async fn index(&self) -> Option<NamedFile> {
        open_regular_file(self.index_path()).await
    }
}

async fn open_regular_file(path: PathBuf) -> Option<NamedFile> {
    NamedFile::open_async(path)
        .await
        .ok()
        .filter(|file| file.metadata().is_file())
}
