//! Object stores holding job input, staged attempt output and final output.
//!
//! Keys are `/`-separated paths relative to the store root. Every backend
//! must provide [`ObjectStore::put_if_absent`] as a true create-exclusive
//! primitive: it is what the commit coordinator uses to claim a task's commit
//! slot, and attempts of one task may run in different processes.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use globset::Glob;
use tracing::debug;
use url::Url;
use walkdir::WalkDir;

use crate::layout::join;
use crate::minio;

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Write an object. Readers see either the old or the new contents.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Create an object only if nothing exists under `key`. Returns `false`
    /// when the key is already taken. Must be atomic across processes.
    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Every object key strictly below `dir`, sorted.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Move one object. Readers never observe a partially written target.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove everything at or below `dir`.
    async fn delete_prefix(&self, dir: &str) -> Result<()>;

    /// Create a directory. Flat stores have nothing to do.
    async fn mkdirs(&self, _dir: &str) -> Result<()> {
        Ok(())
    }

    /// Whether `dir` exists as a directory or has anything below it.
    async fn is_dir(&self, dir: &str) -> Result<bool> {
        Ok(!self.list(dir).await?.is_empty())
    }

    /// Names of the immediate children of `dir`, sorted.
    async fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let keys = self.list(dir).await?;
        Ok(children(dir, keys.iter().map(String::as_str)))
    }
}

fn is_below(key: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    dir.is_empty() || key.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

fn children<'a>(dir: &str, keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let dir = dir.trim_end_matches('/');
    let mut names: Vec<String> = keys
        .filter(|key| is_below(key, dir))
        .filter_map(|key| {
            let rest = if dir.is_empty() { key } else { &key[dir.len() + 1..] };
            rest.split('/').next().map(str::to_string)
        })
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Object keys below `dir` whose path matches a glob, e.g. `input/*.txt`.
pub async fn glob_keys(store: &dyn ObjectStore, dir: &str, pattern: &str) -> Result<Vec<String>> {
    let matcher = Glob::new(pattern)
        .with_context(|| format!("invalid glob pattern `{pattern}`"))?
        .compile_matcher();
    let keys = store.list(dir).await?;
    Ok(keys.into_iter().filter(|key| matcher.is_match(key)).collect())
}

/// Open a store from a URL: `file:///abs/dir`, `mem://` or `s3://bucket`.
///
/// S3 stores need client credentials.
pub fn open_store(url: &str, s3: Option<minio::ClientConfig>) -> Result<Arc<dyn ObjectStore>> {
    let parsed = Url::parse(url).map_err(|e| anyhow!("could not parse store url `{url}`: {e}"))?;
    match parsed.scheme() {
        "file" => {
            let root = parsed
                .to_file_path()
                .map_err(|_| anyhow!("`{url}` is not an absolute file url"))?;
            Ok(Arc::new(LocalStore::new(root)))
        }
        "mem" => Ok(Arc::new(MemoryStore::new())),
        "s3" => {
            let config = s3.ok_or_else(|| anyhow!("s3 store `{url}` needs client credentials"))?;
            let location = minio::path_to_bucket_key(url)?;
            let client = minio::Client::from_conf(config);
            Ok(Arc::new(minio::S3Store::new(client, location.bucket)))
        }
        other => bail!("unsupported store scheme `{other}`"),
    }
}

/////////////////////////////////////////////////////////////////////////////
// Local file system
/////////////////////////////////////////////////////////////////////////////

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Store rooted at a local directory.
///
/// Writes go to a temporary sibling first and are renamed into place;
/// exclusive creates hard-link the finished temporary onto the key, which
/// fails if the key exists.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid key `{key}`");
        }
        Ok(self.root.join(relative))
    }

    async fn write_temp(&self, target: &Path, data: &[u8]) -> Result<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("`{}` has no parent directory", target.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create `{}`", parent.display()))?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = parent.join(format!("_{name}.{}.{seq}.tmp", std::process::id()));
        tokio::fs::write(&temp, data)
            .await
            .with_context(|| format!("failed to write `{}`", temp.display()))?;
        Ok(temp)
    }
}

fn not_found(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let target = self.path(key)?;
        let temp = self.write_temp(&target, &data).await?;
        tokio::fs::rename(&temp, &target)
            .await
            .with_context(|| format!("failed to publish `{key}`"))?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<bool> {
        let target = self.path(key)?;
        let temp = self.write_temp(&target, &data).await?;
        let linked = tokio::fs::hard_link(&temp, &target).await;
        let _ = tokio::fs::remove_file(&temp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to create `{key}`")),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let data = tokio::fs::read(self.path(key)?)
            .await
            .with_context(|| format!("failed to read `{key}`"))?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match tokio::fs::metadata(self.path(key)?).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to stat `{key}`")),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.path(dir)?;
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !path.is_dir() {
                return Ok(vec![]);
            }
            let mut keys = vec![];
            for entry in WalkDir::new(&path).min_depth(1) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root)?;
                let key: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                keys.push(key.join("/"));
            }
            keys.sort();
            Ok(keys)
        })
        .await?
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.path(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.path(from)?, &target)
            .await
            .with_context(|| format!("failed to rename `{from}` to `{to}`"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)?).await {
            Err(e) if !not_found(&e) => Err(e).with_context(|| format!("failed to delete `{key}`")),
            _ => Ok(()),
        }
    }

    async fn delete_prefix(&self, dir: &str) -> Result<()> {
        let path = self.path(dir)?;
        let removed = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match removed {
            Err(e) if !not_found(&e) => Err(e).with_context(|| format!("failed to delete `{dir}`")),
            _ => {
                debug!(dir, "deleted");
                Ok(())
            }
        }
    }

    async fn mkdirs(&self, dir: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.path(dir)?)
            .await
            .with_context(|| format!("failed to create `{dir}`"))
    }

    async fn is_dir(&self, dir: &str) -> Result<bool> {
        match tokio::fs::metadata(self.path(dir)?).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if not_found(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to stat `{dir}`")),
        }
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.path(dir)?).await {
            Ok(entries) => entries,
            Err(e) if not_found(&e) => return Ok(vec![]),
            Err(e) => return Err(e).with_context(|| format!("failed to list `{dir}`")),
        };
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/////////////////////////////////////////////////////////////////////////////
// In memory
/////////////////////////////////////////////////////////////////////////////

/// Process-local store, used by tests and `mem://` jobs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Bytes>,
    dirs: DashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(key: &str) -> String {
        key.trim_matches('/').to_string()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.insert(Self::key(key), data);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<bool> {
        match self.objects.entry(Self::key(key)) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(data);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .get(&Self::key(key))
            .map(|data| data.value().clone())
            .ok_or_else(|| anyhow!("no such object `{key}`"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(&Self::key(key)))
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| is_below(entry.key(), dir))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let data = self.get(from).await?;
        self.objects.insert(Self::key(to), data);
        self.objects.remove(&Self::key(from));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(&Self::key(key));
        Ok(())
    }

    async fn delete_prefix(&self, dir: &str) -> Result<()> {
        let dir = Self::key(dir);
        self.objects.retain(|key, _| key != &dir && !is_below(key, &dir));
        self.dirs.retain(|key| key != &dir && !is_below(key, &dir));
        Ok(())
    }

    async fn mkdirs(&self, dir: &str) -> Result<()> {
        let mut path = String::new();
        for segment in Self::key(dir).split('/').filter(|s| !s.is_empty()) {
            path = join(&path, segment);
            self.dirs.insert(path.clone());
        }
        Ok(())
    }

    async fn is_dir(&self, dir: &str) -> Result<bool> {
        let dir = Self::key(dir);
        Ok(self.dirs.contains(&dir) || !self.list(&dir).await?.is_empty())
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<String>> {
        let objects: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        let dirs: Vec<String> = self.dirs.iter().map(|d| d.key().clone()).collect();
        Ok(children(
            dir,
            objects.iter().chain(dirs.iter()).map(String::as_str),
        ))
    }
}
