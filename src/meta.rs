//! Per-source metadata sidecars.
//!
//! Each source file that was built has a JSON record under
//! `<build dir>/<dev|prod>_meta/` with its content hash and the artifacts it
//! produced. On the next start, a file whose hash still matches gets its
//! artifacts read back from disk instead of being compiled again.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::BuildConfigs;
use crate::content::{Encoding, load_content};
use crate::error::{FilerError, Result};
use crate::hash::Hash32;
use crate::paths::Paths;
use crate::source::{BuildDependency, BuildFile, BuildName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetaData {
    pub source_id: Utf8PathBuf,
    pub content_hash: Hash32,
    pub builds: Vec<SourceMetaBuild>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetaBuild {
    pub id: Utf8PathBuf,
    pub build_name: BuildName,
    pub dependencies: Option<Vec<BuildDependency>>,
    pub encoding: Encoding,
}

impl From<&BuildFile> for SourceMetaBuild {
    fn from(file: &BuildFile) -> Self {
        Self {
            id: file.id.clone(),
            build_name: file.build_config.clone(),
            dependencies: file.dependencies.clone(),
            encoding: file.encoding(),
        }
    }
}

#[derive(Debug, Clone)]
struct SourceMeta {
    /// Where the record lives on disk.
    cache_id: Utf8PathBuf,
    data: SourceMetaData,
}

/// In-memory index of every metadata record, written through to disk.
#[derive(Debug)]
pub struct SourceMetaStore {
    paths: Paths,
    entries: Mutex<HashMap<Utf8PathBuf, SourceMeta>>,
    /// Cache files with a write in flight, and the latest bytes waiting to
    /// be written after it.
    writes: Mutex<HashMap<Utf8PathBuf, Option<Vec<u8>>>>,
}

impl SourceMetaStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            entries: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<Utf8PathBuf, SourceMeta>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads every record from disk. Records that can't be read are cache
    /// misses, not errors.
    pub async fn init(&self) -> Result<()> {
        let dir = self.paths.source_meta_dir();
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(());
        }

        let pattern = format!("{}/**/*.json", glob::Pattern::escape(dir.as_str()));
        let files: Vec<Utf8PathBuf> = glob::glob(&pattern)
            .map_err(crate::error::ConfigError::from)?
            .filter_map(|entry| entry.ok())
            .filter_map(|path| Utf8PathBuf::try_from(path).ok())
            .collect();

        let loaded = join_all(files.into_iter().map(|cache_id| async move {
            let data = load_meta(&cache_id).await;
            (cache_id, data)
        }))
        .await;

        let mut entries = self.entries();
        for (cache_id, data) in loaded {
            match data {
                Ok(data) => {
                    entries.insert(data.source_id.clone(), SourceMeta { cache_id, data });
                }
                Err(err) => tracing::warn!("ignoring unreadable source meta {}: {}", cache_id, err),
            }
        }
        tracing::debug!("loaded {} source meta records", entries.len());

        Ok(())
    }

    pub fn get(&self, source_id: &Utf8Path) -> Option<SourceMetaData> {
        self.entries().get(source_id).map(|meta| meta.data.clone())
    }

    /// Replaces the in-memory record of a source file and returns the bytes
    /// to write for it.
    ///
    /// `build_files` has to cover every build the file still holds, cached
    /// ones it hasn't joined yet included. Builds for configs that aren't
    /// active in this run are kept as they were, so switching between config
    /// sets doesn't throw away their cache.
    pub(crate) fn record<'a>(
        &self,
        source_id: &Utf8Path,
        content_hash: Hash32,
        build_files: impl IntoIterator<Item = &'a Arc<BuildFile>>,
        build_configs: &BuildConfigs,
    ) -> Result<(Utf8PathBuf, Vec<u8>)> {
        let mut builds: Vec<SourceMetaBuild> =
            build_files.into_iter().map(|file| SourceMetaBuild::from(file.as_ref())).collect();

        let mut entries = self.entries();
        if let Some(previous) = entries.get(source_id) {
            builds.extend(
                previous
                    .data
                    .builds
                    .iter()
                    .filter(|build| !build_configs.has(&build.build_name))
                    .cloned(),
            );
        }

        let data = SourceMetaData {
            source_id: source_id.to_path_buf(),
            content_hash,
            builds,
        };
        let cache_id = self.paths.to_source_meta_path(source_id);
        let bytes = serde_json::to_vec_pretty(&data).map_err(|err| FilerError::Json(cache_id.clone(), err))?;

        entries.insert(
            source_id.to_path_buf(),
            SourceMeta {
                cache_id: cache_id.clone(),
                data,
            },
        );

        Ok((cache_id, bytes))
    }

    /// Writes a record, coalescing with a write already in flight for the
    /// same file: only the latest bytes requested meanwhile are written next.
    ///
    /// Nothing is left on disk for a source that was deleted while the write
    /// was pending.
    pub(crate) async fn write(&self, source_id: &Utf8Path, cache_id: Utf8PathBuf, bytes: Vec<u8>) -> Result<()> {
        {
            let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pending) = writes.get_mut(&cache_id) {
                *pending = Some(bytes);
                return Ok(());
            }
            writes.insert(cache_id.clone(), None);
        }

        let mut next = Some(bytes);
        let mut result = Ok(());
        while let Some(bytes) = next {
            result = if self.is_recorded(source_id) {
                write_meta(&cache_id, &bytes).await
            } else {
                Ok(())
            };

            let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
            next = writes.get_mut(&cache_id).and_then(Option::take);
            if next.is_none() {
                writes.remove(&cache_id);
            } else if let Err(err) = &result {
                tracing::warn!("source meta write failed, retrying with newer data: {}", err);
            }
        }

        // A delete may have removed the record while the last write ran.
        if !self.is_recorded(source_id) {
            tracing::debug!("dropping source meta of deleted {}", source_id);
            remove_meta(&cache_id).await?;
        }

        result
    }

    fn is_recorded(&self, source_id: &Utf8Path) -> bool {
        self.entries().contains_key(source_id)
    }

    /// Deletes the records of every source id `keep` rejects.
    pub async fn clean(&self, keep: impl Fn(&Utf8Path) -> bool) -> Result<()> {
        let stale: Vec<SourceMeta> = {
            let mut entries = self.entries();
            let ids: Vec<Utf8PathBuf> = entries.keys().filter(|id| !keep(id.as_path())).cloned().collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        if !stale.is_empty() {
            tracing::debug!("cleaning {} stale source meta records", stale.len());
        }

        for meta in stale {
            remove_meta(&meta.cache_id).await?;
        }
        Ok(())
    }

    /// Forgets a source file. Missing records are fine.
    pub async fn delete(&self, source_id: &Utf8Path) -> Result<()> {
        let meta = self.entries().remove(source_id);
        match meta {
            Some(meta) => remove_meta(&meta.cache_id).await,
            None => Ok(()),
        }
    }
}

async fn load_meta(path: &Utf8Path) -> anyhow::Result<SourceMetaData> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_meta(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| FilerError::io(parent, err))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|err| FilerError::io(path, err))
}

async fn remove_meta(path: &Utf8Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FilerError::io(path, err)),
    }
}

/// Rebuilds the artifacts listed in a record by reading them back from disk.
///
/// Only configs active in this run are loaded. A config with any artifact
/// that can't be read is left out entirely, so it gets rebuilt.
pub async fn load_cached_build_files(
    meta: &SourceMetaData,
    build_configs: &BuildConfigs,
) -> BTreeMap<BuildName, Vec<Arc<BuildFile>>> {
    let loaded = join_all(
        meta.builds
            .iter()
            .filter(|build| build_configs.has(&build.build_name))
            .map(|build| async move {
                let content = load_content(&build.id, build.encoding).await;
                (build, content)
            }),
    )
    .await;

    let mut cached: BTreeMap<BuildName, Vec<Arc<BuildFile>>> = BTreeMap::new();
    let mut failed = Vec::new();

    for (build, content) in loaded {
        match content {
            Ok(content) => {
                let mut file = BuildFile::new(&build.id, &meta.source_id, &build.build_name, content);
                file.dependencies = build.dependencies.clone();
                cached.entry(build.build_name.clone()).or_default().push(Arc::new(file));
            }
            Err(err) => {
                tracing::debug!("cache miss for {}: {}", build.id, err);
                failed.push(build.build_name.clone());
            }
        }
    }

    for name in failed {
        cached.remove(&name);
    }

    cached
}
