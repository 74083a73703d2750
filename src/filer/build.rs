use std::io;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, FutureExt, TryFutureExt};

use crate::content::{Content, Encoding, PathStats, infer_encoding, load_content};
use crate::dir::DirId;
use crate::error::{FilerError, Result};
use crate::filer::state::{BuildKey, FilerState};
use crate::filer::{BuildEvent, Filer, run_all};
use crate::hash::Hash32;
use crate::log::as_overhead;
use crate::meta::load_cached_build_files;
use crate::source::{BuildFile, SourceFile};
use crate::sync::{diff_build_files, diff_dependencies, sync_build_files_to_disk, sync_build_files_to_memory};

impl Filer {
    /// Reads a source file from disk into the table.
    ///
    /// Returns whether the file needs to be built: `false` when the content
    /// didn't change, or when a new file got its artifacts back from the
    /// metadata cache. Concurrent calls for the same id share one read.
    pub async fn update_source_file(&self, id: &Utf8Path, dir: DirId) -> Result<bool> {
        let (update, owner) = {
            let mut state = self.state();
            match state.pending_updates.get(id) {
                Some(update) => (update.clone(), false),
                None => {
                    let update = self
                        .clone()
                        .load_source_file(id.to_path_buf(), dir)
                        .map_err(Arc::new)
                        .boxed()
                        .shared();
                    state.pending_updates.insert(id.to_path_buf(), update.clone());
                    (update, true)
                }
            }
        };

        let result = update.await;
        if owner {
            self.state().pending_updates.remove(id);
        }
        result.map_err(FilerError::Shared)
    }

    async fn load_source_file(self, id: Utf8PathBuf, dir_id: DirId) -> Result<bool> {
        let dir = self.dir(dir_id)?;

        let existing = {
            let state = self.state();
            state
                .files
                .get(&id)
                .map(|file| (file.dir, file.dir_path.clone(), file.encoding))
        };

        if let Some((existing_dir, existing_path, _)) = &existing
            && *existing_dir != dir_id
        {
            return Err(FilerError::AmbiguousSource(
                id,
                existing_path.clone(),
                dir.path.clone(),
            ));
        }

        let encoding = match &existing {
            Some((_, _, encoding)) => *encoding,
            None => infer_encoding(id.extension().unwrap_or_default()),
        };
        let content = read_source(&id, encoding).await?;
        let stats = PathStats::load(&id).await.ok();

        if existing.is_none() {
            let mut file = SourceFile::new(id.clone(), dir_id, dir.path.clone(), dir.buildable(), content);
            file.stats = stats;

            if file.buildable
                && let Some(meta) = self.inner.meta.get(&id)
                && meta.content_hash == file.content_hash()
            {
                file.cached_build_files = load_cached_build_files(&meta, &self.inner.ctx.build_configs).await;
                tracing::debug!(
                    "{} has cached builds for {} configs",
                    id,
                    file.cached_build_files.len()
                );
            }

            let needs_build = file.buildable && file.cached_build_files.is_empty();

            let mut state = self.state();
            if state.graph_ready && file.buildable {
                state.wire_pending_edges(&mut file);
            }
            state.files.insert(id, file);
            return Ok(needs_build);
        }

        let mut state = self.state();
        let Some(file) = state.files.get_mut(&id) else {
            tracing::debug!("{} was removed while being read", id);
            return Ok(false);
        };

        if file.content == content {
            file.stats = stats;
            return Ok(false);
        }

        tracing::debug!("{} changed", id);
        file.set_content(content);
        file.stats = stats;
        Ok(file.buildable)
    }

    /// Compiles a source file for a build config.
    ///
    /// Only one compile per pair runs at a time. A request arriving during
    /// one is remembered and, once it finishes, triggers exactly one more
    /// compile if the content moved on in the meantime.
    pub fn build_source_file(&self, id: &Utf8Path, name: &str) -> BoxFuture<'static, Result<()>> {
        let filer = self.clone();
        let key: BuildKey = (id.to_path_buf(), name.to_string());

        async move {
            {
                let mut state = filer.state();
                if state.pending_builds.contains(&key) {
                    tracing::debug!("enqueueing build of {} for {}", key.0, key.1);
                    state.enqueued_builds.insert(key);
                    return Ok(());
                }
                state.pending_builds.insert(key.clone());
            }

            let result = filer.compile(&key.0, &key.1).await;

            let enqueued = {
                let mut state = filer.state();
                state.pending_builds.remove(&key);
                state.enqueued_builds.remove(&key)
            };

            let Some(built_hash) = result? else {
                return Ok(());
            };
            if !enqueued {
                return Ok(());
            }

            let Some(dir) = filer.state().files.get(&key.0).map(|file| file.dir) else {
                return Ok(());
            };
            let changed = filer.update_source_file(&key.0, dir).await?;

            let rebuild = {
                let mut state = filer.state();
                match state.files.get_mut(&key.0) {
                    Some(file) if file.build_configs.contains(&key.1) => {
                        changed || file.content_hash() != built_hash
                    }
                    _ => false,
                }
            };

            if rebuild {
                filer.build_source_file(&key.0, &key.1).await
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    /// One compile, start to finish. Returns the hash of the content that
    /// was compiled, or `None` if the file left the config before it could
    /// be compiled.
    async fn compile(&self, id: &Utf8Path, name: &str) -> Result<Option<Hash32>> {
        let Some(builder) = self.inner.builder.clone() else {
            return Ok(None);
        };
        let config = self
            .inner
            .ctx
            .build_configs
            .get(name)
            .cloned()
            .ok_or_else(|| FilerError::invariant(format!("unknown build config '{name}'")))?;

        let source = {
            let mut state = self.state();
            match state.files.get_mut(id) {
                Some(file) if file.build_configs.contains(name) => file.to_build_source(),
                _ => return Ok(None),
            }
        };

        let start = Instant::now();
        tracing::debug!("building {} for {}", id, name);

        let result = match builder.build(&source, &config, &self.inner.ctx).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!("build for {} failed in {}:\n{:?}", name, id, err);
                return Ok(Some(source.content_hash));
            }
        };
        let new_files: Vec<Arc<BuildFile>> = result.build_files.into_iter().map(Arc::new).collect();

        let (changes, followups, meta) = {
            let mut state = self.state();
            let Some(file) = state.files.get_mut(id) else {
                return Ok(Some(source.content_hash));
            };
            if !file.build_configs.contains(name) {
                tracing::debug!("discarding build of {} for {}, no longer a member", id, name);
                return Ok(Some(source.content_hash));
            }

            let old = file
                .build_files
                .insert(name.to_string(), new_files.clone())
                .unwrap_or_default();
            let changes = diff_build_files(&new_files, Some(old.as_slice()));
            let dependency_changes = diff_dependencies(&new_files, Some(old.as_slice()));

            sync_build_files_to_memory(&mut state.build_files, &changes);
            let followups = self.begin_update_dependencies(&mut state, id, name, &dependency_changes)?;
            let meta = self.record_meta(&mut state, id, Some(source.content_hash))?;
            (changes, followups, meta)
        };

        let (synced, followed) = futures::join!(sync_build_files_to_disk(changes), run_all(followups));
        synced?;
        followed?;

        if let Some((cache_id, bytes)) = meta {
            self.inner.meta.write(id, cache_id, bytes).await?;
        }

        self.inner
            .events
            .send(BuildEvent {
                source_id: id.to_path_buf(),
                build_config: name.to_string(),
            })
            .ok();
        tracing::debug!("built {} for {} {}", id, name, as_overhead(start));

        Ok(Some(source.content_hash))
    }

    /// Snapshots the metadata record of a source file. The caller writes it
    /// once the lock is released.
    ///
    /// Cached builds the file hasn't joined yet are part of the record, or
    /// they would be lost for the next run.
    pub(crate) fn record_meta(
        &self,
        state: &mut FilerState,
        id: &Utf8Path,
        content_hash: Option<Hash32>,
    ) -> Result<Option<(Utf8PathBuf, Vec<u8>)>> {
        let Some(file) = state.files.get_mut(id) else {
            return Ok(None);
        };
        if !file.buildable {
            return Ok(None);
        }

        let content_hash = content_hash.unwrap_or_else(|| file.content_hash());
        let record = self.inner.meta.record(
            id,
            content_hash,
            file.build_files
                .values()
                .chain(file.cached_build_files.values())
                .flatten(),
            &self.inner.ctx.build_configs,
        )?;
        Ok(Some(record))
    }
}

/// Reads a source file, falling back to bytes when text turns out not to be
/// valid UTF-8.
async fn read_source(id: &Utf8Path, encoding: Encoding) -> Result<Content> {
    match load_content(id, encoding).await {
        Ok(content) => Ok(content),
        Err(err) if encoding == Encoding::Utf8 && err.kind() == io::ErrorKind::InvalidData => {
            load_content(id, Encoding::Binary)
                .await
                .map_err(|err| FilerError::io(id, err))
        }
        Err(err) => Err(FilerError::io(id, err)),
    }
}
