use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::warn;
use sha2::{Digest, Sha256};
use url::Url;

/// Storage for uploaded images. `upload` returns a URL that can be fetched
/// directly and stored on posts or profiles.
pub trait BlobStore: Send + Sync {
    fn upload(&self, bytes: &[u8], prefix: &str) -> Result<String>;
}

/// Image attached to a draft: already uploaded, or a local file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Remote(String),
    Local(PathBuf),
}

/// Writes blobs under a directory and hands out `file://` URLs.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: Option<PathBuf>) -> Result<Self> {
        let root = root
            .or_else(default_dir)
            .context("blobs: directory not configured")?;
        fs::create_dir_all(&root)
            .with_context(|| format!("blobs: create directory {}", root.display()))?;
        let root = fs::canonicalize(&root)
            .with_context(|| format!("blobs: resolve directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn upload(&self, bytes: &[u8], prefix: &str) -> Result<String> {
        anyhow::ensure!(!bytes.is_empty(), "blobs: refusing empty upload");

        let extension = extension_for(tree_magic_mini::from_u8(bytes));
        let digest = sha256_hex(bytes);
        let name = format!("{}_{}.{}", sanitize(prefix), &digest[..16], extension);
        let dir = self.root.join("images");
        fs::create_dir_all(&dir)
            .with_context(|| format!("blobs: create directory {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, bytes).with_context(|| format!("blobs: write {}", path.display()))?;

        Url::from_file_path(&path)
            .map(String::from)
            .map_err(|_| anyhow!("blobs: {} is not an absolute path", path.display()))
    }
}

/// Keeps remote images in order and appends uploads of the local ones.
/// A local image that cannot be read or uploaded is logged and left out.
pub fn collect_images(blobs: &dyn BlobStore, images: &[ImageSource], prefix: &str) -> Vec<String> {
    let mut urls: Vec<String> = images
        .iter()
        .filter_map(|image| match image {
            ImageSource::Remote(url) => Some(url.clone()),
            ImageSource::Local(_) => None,
        })
        .collect();

    for image in images {
        let ImageSource::Local(path) = image else {
            continue;
        };
        let uploaded = fs::read(path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|bytes| blobs.upload(&bytes, prefix));
        match uploaded {
            Ok(url) => urls.push(url),
            Err(err) => warn!("blobs: skipping image {}: {err:#}", path.display()),
        }
    }
    urls
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

fn sanitize(prefix: &str) -> String {
    let cleaned: String = prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn default_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("postboard").join("blobs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[test]
    fn upload_names_file_by_content() {
        let dir = tempdir().unwrap();
        let blobs = FsBlobStore::open(Some(dir.path().to_path_buf())).unwrap();

        let url = blobs.upload(PNG_MAGIC, "post-image").unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("post-image_"));

        let path = Url::parse(&url).unwrap().to_file_path().unwrap();
        assert_eq!(fs::read(path).unwrap(), PNG_MAGIC);
    }

    #[test]
    fn unknown_types_default_to_jpeg() {
        assert_eq!(extension_for("image/webp"), "webp");
        assert_eq!(extension_for("application/octet-stream"), "jpg");
        assert_eq!(sanitize("post image/1"), "post_image_1");
    }

    #[test]
    fn empty_upload_is_rejected() {
        let dir = tempdir().unwrap();
        let blobs = FsBlobStore::open(Some(dir.path().to_path_buf())).unwrap();
        assert!(blobs.upload(&[], "x").is_err());
    }

    #[test]
    fn collect_keeps_remote_first_and_skips_unreadable() {
        let dir = tempdir().unwrap();
        let blobs = FsBlobStore::open(Some(dir.path().join("blobs"))).unwrap();
        let local = dir.path().join("pic.png");
        fs::write(&local, PNG_MAGIC).unwrap();

        let urls = collect_images(
            &blobs,
            &[
                ImageSource::Local(local),
                ImageSource::Remote("https://cdn.example/a.jpg".into()),
                ImageSource::Local(dir.path().join("missing.jpg")),
            ],
            "post-image",
        );

        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], "https://cdn.example/a.jpg");
        assert!(urls[1].starts_with("file://"));
    }
}
