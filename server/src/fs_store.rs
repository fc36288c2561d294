//! This module provides [FsObjectStore], an [ObjectStore] backed by a local directory tree.
//!
//! Each container is a directory directly beneath the store root, and each object key is a `/`-separated path
//! relative to its container.

use {
    crate::store::{ObjectStore, StoreError},
    anyhow::{anyhow, Error, Result},
    async_trait::async_trait,
    bytes::Bytes,
    futures::{
        future::{BoxFuture, FutureExt, TryFutureExt},
        stream::{self, BoxStream, StreamExt},
    },
    std::{
        io::{ErrorKind, Write},
        path::{Path, PathBuf},
    },
    tokio::{fs, task},
};

/// Prefix of the temporary files used while writing objects; such files are never listed
const PARTIAL_PREFIX: &str = ".partial-";

/// Guess the content type of an object from the extension of its key
pub fn content_type(key: &str) -> &'static str {
    let extension = Path::new(key)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("heic") => "image/heic",
        Some("heif") => "image/heif",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn check_segment<'a>(segment: &'a str, whole: &str) -> Result<&'a str> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('\\')
        || segment.starts_with(PARTIAL_PREFIX)
    {
        Err(StoreError::InvalidKey(whole.into()).into())
    } else {
        Ok(segment)
    }
}

fn walk<'a>(root: &'a Path, dir: PathBuf, keys: &'a mut Vec<String>) -> BoxFuture<'a, Result<()>> {
    async move {
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                walk(root, path, keys).await?;
            } else if file_type.is_file()
                && !entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(PARTIAL_PREFIX)
            {
                let key = path
                    .strip_prefix(root)?
                    .components()
                    .map(|component| {
                        component
                            .as_os_str()
                            .to_str()
                            .ok_or_else(|| anyhow!("bad utf8"))
                    })
                    .collect::<Result<Vec<_>>>()?
                    .join("/");

                keys.push(key);
            }
        }

        Ok(())
    }
    .boxed()
}

/// An [ObjectStore] backed by a local directory tree
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_path(&self, container: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        path.push(check_segment(container, container)?);
        Ok(path)
    }

    fn path(&self, container: &str, key: &str) -> Result<PathBuf> {
        let mut path = self.container_path(container)?;

        for segment in key.split('/') {
            path.push(check_segment(segment, key)?);
        }

        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, container: &str, key: &str) -> Result<(Bytes, String)> {
        match fs::read(self.path(container, key)?).await {
            Ok(data) => Ok((Bytes::from(data), content_type(key).into())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                container: container.into(),
                key: key.into(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, container: &str, key: &str) -> Result<bool> {
        match fs::metadata(self.path(container, key)?).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, container: &str, key: &str, data: Bytes) -> Result<()> {
        let path = self.path(container, key)?;

        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("object path has no parent: {:?}", path))?
            .to_owned();

        fs::create_dir_all(&dir).await?;

        // Write beside the destination and rename into place so that readers never observe a partial object.
        task::spawn_blocking(move || {
            let mut tmp = tempfile::Builder::new()
                .prefix(PARTIAL_PREFIX)
                .tempfile_in(&dir)?;

            tmp.write_all(&data)?;
            tmp.persist(&path)?;

            Ok::<_, Error>(())
        })
        .await?
    }

    async fn delete(&self, container: &str, key: &str) -> Result<()> {
        match fs::remove_file(self.path(container, key)?).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<(String, String)>> {
        async move {
            let root = self.container_path(container)?;
            let mut keys = Vec::new();

            if fs::metadata(&root).await.is_ok() {
                walk(&root, root.clone(), &mut keys).await?;
            }

            keys.sort();

            Ok::<_, Error>(stream::iter(keys.into_iter().map(|key| {
                let content_type = content_type(&key).to_owned();
                Ok((key, content_type))
            })))
        }
        .try_flatten_stream()
        .boxed()
    }
}
