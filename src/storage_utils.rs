use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable that overrides the storage directory.
pub const STORAGE_DIR_ENV: &str = "CANDLE_HARVESTER_STORAGE";

// STORAGE MANAGER

#[derive(Debug, Clone)]
pub struct AsyncStorageManager {
    // Absolute path of the storage root (e.g., ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Creates a manager rooted at `base_dir`, creating the directory if needed.
    pub async fn new<P: AsRef<Path>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir)
                .await
                .with_context(|| format!("creating storage dir {}", base_dir.display()))?;
        }
        Ok(Self { base_dir })
    }

    /// **Constructor: new_relative**
    /// Creates a new manager instance. It calculates the storage path relative
    /// to where the binary executable is running.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;

        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);

        Self::new(base_dir).await
    }

    /// Uses `$CANDLE_HARVESTER_STORAGE` when set, else `storage/` next to the binary.
    pub async fn from_env_or_relative() -> anyhow::Result<Self> {
        match std::env::var(STORAGE_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => Self::new(dir.trim()).await,
            _ => Self::new_relative("storage").await,
        }
    }

    /// Manager for a sub-directory, created lazily by the first save. Absolute paths are
    /// used as-is.
    pub fn child<P: AsRef<Path>>(&self, dir: P) -> Self {
        Self {
            base_dir: self.base_dir.join(dir),
        }
    }

    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", filename))
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path_of(filename).exists()
    }

    /// **Generic Save Function**
    /// Serializes `data` to `<filename>.json`. `filename` may contain `/`-separated
    /// sub-directories, which are created on demand.
    /// Writes to a `.tmp` sibling first and renames it over the target, so readers
    /// never observe a half-written file.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let final_path = self.path_of(filename);
        if let Some(parent) = final_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut tmp_name = final_path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let json_bytes = serde_json::to_vec_pretty(data)?;

        fs::write(&tmp_path, json_bytes)
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("replacing {}", final_path.display()))?;

        Ok(())
    }

    /// **Generic Load Function**
    /// Reads `<filename>.json` and deserializes it into `T`.
    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        let path = self.path_of(filename);

        // Raw bytes: serde_json validates UTF-8 while parsing anyway.
        let content = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        let data = serde_json::from_slice(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(data)
    }

    /// Like [`load`](Self::load) but returns `None` when the file does not exist.
    pub async fn load_optional<T: DeserializeOwned>(
        &self,
        filename: &str,
    ) -> anyhow::Result<Option<T>> {
        if !self.exists(filename) {
            return Ok(None);
        }
        self.load(filename).await.map(Some)
    }
}
