use crate::error::{DriverError, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const SEED_ISO: &str = "boot2docker.iso";

/// Shared cache of the seed ISO under `<store>/cache`
#[derive(Debug, Clone)]
pub struct SeedImageCache {
    cache_dir: PathBuf,
}

impl SeedImageCache {
    pub fn new(store_path: &Path) -> Self {
        Self {
            cache_dir: store_path.join("cache"),
        }
    }

    pub fn cached_path(&self) -> PathBuf {
        self.cache_dir.join(SEED_ISO)
    }

    /// Refresh the cached ISO from `url`
    ///
    /// `url` can be `http(s)://`, `file://` or a plain path. Without a url the
    /// existing cache entry is kept, and it is an error when there is none.
    pub async fn update_cache(&self, url: Option<&str>) -> Result<PathBuf> {
        let dest = self.cached_path();
        let Some(url) = url else {
            return if fs::try_exists(&dest).await? {
                debug!("Using cached seed image {}", dest.display());
                Ok(dest)
            } else {
                Err(DriverError::SeedImage(
                    "no seed image url configured and nothing cached".to_string(),
                ))
            };
        };
        fs::create_dir_all(&self.cache_dir).await?;
        fetch(url, &dest).await?;
        Ok(dest)
    }

    /// Put the seed ISO into `machine_dir`, from `url` when given, otherwise
    /// from the cache (filling the cache first when it is empty)
    pub async fn copy_to_machine_dir(&self, url: Option<&str>, machine_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(machine_dir).await?;
        let dest = machine_dir.join(SEED_ISO);
        match url {
            Some(u) if is_remote(u) => {
                // remote images always go through the cache
                let cached = self.update_cache(Some(u)).await?;
                fs::copy(&cached, &dest).await?;
            }
            Some(u) => fetch(u, &dest).await?,
            None => {
                let cached = self.update_cache(None).await?;
                fs::copy(&cached, &dest).await?;
            }
        }
        debug!("Seed image copied to {}", dest.display());
        Ok(dest)
    }
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

async fn fetch(url: &str, dest: &Path) -> Result<()> {
    if is_remote(url) {
        download(url, dest).await
    } else {
        let src = Path::new(url.strip_prefix("file://").unwrap_or(url));
        if !fs::try_exists(src).await? {
            return Err(DriverError::SeedImage(format!(
                "{} does not exist",
                src.display()
            )));
        }
        fs::copy(src, dest).await?;
        Ok(())
    }
}

async fn download(url: &str, dest: &Path) -> Result<()> {
    info!("Downloading seed image from {}", url);
    let mut rsp = reqwest::get(url).await?.error_for_status()?;

    // never leave a truncated image in place of a good one
    let tmp = dest.with_extension("iso.part");
    let mut file = fs::File::create(&tmp).await?;
    let mut total = 0u64;
    while let Some(chunk) = rsp.chunk().await? {
        total += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);
    if total == 0 {
        fs::remove_file(&tmp).await?;
        return Err(DriverError::SeedImage(format!("{} returned an empty body", url)));
    }
    fs::rename(&tmp, dest).await?;
    info!("Downloaded {} bytes to {}", total, dest.display());
    Ok(())
}
