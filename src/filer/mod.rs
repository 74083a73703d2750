//! The build engine.
//!
//! A [`Filer`] owns a table of source files read from its watched dirs. Each
//! file is a member of zero or more build configs: it joins one when it's an
//! input of the config or when a member of the config imports it, and leaves
//! it when nothing imports it anymore. Every membership has its own set of
//! build files, kept in sync with the output tree and the metadata cache.
//!
//! All graph state lives behind a single lock that is never held across an
//! `.await`. Operations that change the graph do so synchronously while
//! holding it and hand back the slow part (compiles, disk writes) as futures
//! to run once it's released.

mod build;
mod graph;
mod options;
mod state;

use std::collections::HashSet;
use std::fmt::Debug;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt, join_all};
use tokio::sync::broadcast;

use crate::builder::{BuildContext, Builder, MapDependencyToSourceId};
use crate::config::BuildConfigs;
use crate::dir::{DirChange, DirChangeKind, DirId, FilerDir};
use crate::error::{FilerError, Result};
use crate::log::as_overhead;
use crate::meta::SourceMetaStore;
use crate::paths::Paths;
use crate::source::{BuildFile, BuildName, SourceFile};

pub use options::FilerOptions;

use self::state::FilerState;

/// Continuation of a graph change, run after the state lock is released.
pub(crate) type Work = BoxFuture<'static, Result<()>>;

type SharedInit = Shared<BoxFuture<'static, Result<(), Arc<FilerError>>>>;

const EVENT_CAPACITY: usize = 256;

/// Sent after every successful compile of a source file for a build config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    pub source_id: Utf8PathBuf,
    pub build_config: BuildName,
}

pub(crate) struct FilerParts {
    pub paths: Paths,
    pub dirs: Vec<FilerDir>,
    pub builder: Option<Arc<dyn Builder>>,
    pub build_configs: BuildConfigs,
    pub map_dependency_to_source_id: MapDependencyToSourceId,
    pub watch: bool,
    pub debounce: Duration,
    pub clean_output_dirs: bool,
}

struct FilerInner {
    ctx: BuildContext,
    dirs: Vec<FilerDir>,
    builder: Option<Arc<dyn Builder>>,
    map_dependency_to_source_id: MapDependencyToSourceId,
    meta: SourceMetaStore,
    state: Mutex<FilerState>,
    events: broadcast::Sender<BuildEvent>,
    init: Mutex<Option<SharedInit>>,
    #[cfg_attr(not(feature = "live"), allow(dead_code))]
    watch: bool,
    #[cfg_attr(not(feature = "live"), allow(dead_code))]
    debounce: Duration,
    clean_output_dirs: bool,
    event_loop: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to a build engine. Clones share the same engine.
#[derive(Clone)]
pub struct Filer {
    inner: Arc<FilerInner>,
}

impl Debug for Filer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filer")
            .field("root", &self.inner.ctx.paths.root)
            .field("dirs", &self.inner.dirs)
            .field("builder", &self.inner.builder.as_ref().map(|builder| builder.name()))
            .finish_non_exhaustive()
    }
}

impl Filer {
    pub(crate) fn from_parts(parts: FilerParts) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(FilerInner {
                meta: SourceMetaStore::new(parts.paths.clone()),
                ctx: BuildContext {
                    paths: parts.paths,
                    build_configs: parts.build_configs,
                },
                dirs: parts.dirs,
                builder: parts.builder,
                map_dependency_to_source_id: parts.map_dependency_to_source_id,
                state: Mutex::new(FilerState::default()),
                events,
                init: Mutex::new(None),
                watch: parts.watch,
                debounce: parts.debounce,
                clean_output_dirs: parts.clean_output_dirs,
                event_loop: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FilerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dir(&self, id: DirId) -> Result<&FilerDir> {
        self.inner
            .dirs
            .get(id.0)
            .ok_or_else(|| FilerError::invariant(format!("unknown dir {id:?}")))
    }

    pub fn paths(&self) -> &Paths {
        &self.inner.ctx.paths
    }

    pub fn build_configs(&self) -> &BuildConfigs {
        &self.inner.ctx.build_configs
    }

    pub fn dirs(&self) -> &[FilerDir] {
        &self.inner.dirs
    }

    /// Receives a [`BuildEvent`] after every successful compile.
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.inner.events.subscribe()
    }

    /// A snapshot of a source file.
    pub fn source_file(&self, id: impl AsRef<Utf8Path>) -> Option<SourceFile> {
        self.state().files.get(id.as_ref()).cloned()
    }

    pub fn build_file(&self, id: impl AsRef<Utf8Path>) -> Option<Arc<BuildFile>> {
        self.state().build_files.get(id.as_ref()).cloned()
    }

    /// Every source id in the table, sorted.
    pub fn source_ids(&self) -> Vec<Utf8PathBuf> {
        self.state().sorted_ids()
    }

    /// Resolves a path relative to the served dirs, in the order they were
    /// given.
    pub fn find_by_path(&self, path: impl AsRef<Utf8Path>) -> Option<SourceFile> {
        let state = self.state();
        self.inner
            .dirs
            .iter()
            .filter(|dir| !dir.buildable())
            .find_map(|dir| state.files.get(&dir.to_id(path.as_ref())))
            .cloned()
    }

    /// Reads the watched dirs, builds the initial graph and starts watching
    /// when asked to.
    ///
    /// Calling it again, even concurrently, waits for the same run.
    pub async fn init(&self) -> Result<()> {
        let init = {
            let mut slot = self.inner.init.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| self.clone().run_init().map_err(Arc::new).boxed().shared())
                .clone()
        };

        init.await.map_err(FilerError::Shared)
    }

    async fn run_init(self) -> Result<()> {
        let start = Instant::now();

        self.inner.meta.init().await?;

        for dir in &self.inner.dirs {
            let changes = dir.init().await?;
            tracing::debug!("read {} files from {}", changes.len(), dir.path);
            run_all(changes.into_iter().map(|change| self.on_dir_change(change, dir.id))).await?;
        }

        let ids: HashSet<Utf8PathBuf> = self.state().files.keys().cloned().collect();
        self.inner.meta.clean(|id| ids.contains(id)).await?;

        if let Some(builder) = &self.inner.builder {
            builder
                .init(&self.inner.ctx)
                .await
                .map_err(|err| FilerError::BuilderInit(builder.name().to_string(), err))?;
        }

        self.build_initial_graph().await?;

        if self.inner.clean_output_dirs {
            self.clean_output_dirs().await?;
        }

        #[cfg(feature = "live")]
        if self.inner.watch {
            self.start_watching()?;
        }

        tracing::info!(
            "filer ready with {} source files {}",
            self.state().files.len(),
            as_overhead(start)
        );

        Ok(())
    }

    /// Applies one change observed in a watched dir.
    pub async fn on_dir_change(&self, change: DirChange, dir_id: DirId) -> Result<()> {
        let dir = self.dir(dir_id)?;
        let id = dir.to_id(&change.path);

        match change.kind {
            DirChangeKind::Init | DirChangeKind::Create | DirChangeKind::Update => {
                if change.stats.is_directory {
                    return Ok(());
                }

                let needs_build = self.update_source_file(&id, dir_id).await?;
                if !needs_build || change.kind == DirChangeKind::Init || !dir.buildable() {
                    return Ok(());
                }

                // Rebuild where the file already is, and look for configs it
                // should join now.
                let members: Vec<BuildName> = self
                    .state()
                    .files
                    .get(&id)
                    .map(|file| file.build_configs.iter().cloned().collect())
                    .unwrap_or_default();
                let rebuilds = members.iter().map(|name| self.build_source_file(&id, name));

                let (rebuilt, discovered) = futures::join!(run_all(rebuilds), self.init_source_file(&id));
                rebuilt?;
                discovered
            }
            DirChangeKind::Delete if change.stats.is_directory => {
                if dir.buildable() {
                    self.remove_output_dirs(&id).await?;
                }
                Ok(())
            }
            DirChangeKind::Delete => self.destroy_source_id(&id).await,
        }
    }

    /// Deletes the output dir matching a deleted source dir, under every
    /// build config. Configs that never had files there are swept too.
    async fn remove_output_dirs(&self, source_dir: &Utf8Path) -> Result<()> {
        let paths = &self.inner.ctx.paths;
        let base = paths.to_base_path(source_dir);

        for config in &self.inner.ctx.build_configs {
            let out = paths.to_build_out_path(&config.name, base);
            match tokio::fs::remove_dir_all(&out).await {
                Ok(()) => tracing::debug!("removed {}", out),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(FilerError::io(out, err)),
            }
        }

        Ok(())
    }

    /// Deletes files in the output dirs that no source file produced.
    async fn clean_output_dirs(&self) -> Result<()> {
        let known: HashSet<Utf8PathBuf> = self.state().build_files.keys().cloned().collect();
        let mut removed = 0;

        for config in &self.inner.ctx.build_configs {
            let dir = self.inner.ctx.paths.build_out_dir(&config.name);
            let pattern = format!("{}/**/*", glob::Pattern::escape(dir.as_str()));
            let stale: Vec<Utf8PathBuf> = glob::glob(&pattern)
                .map_err(crate::error::ConfigError::from)?
                .filter_map(|entry| entry.ok())
                .filter_map(|path| Utf8PathBuf::try_from(path).ok())
                .filter(|path| path.is_file() && !known.contains(path))
                .collect();

            for path in stale {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(FilerError::io(path, err)),
                }
            }
        }

        if removed > 0 {
            tracing::info!("removed {} stale build files", removed);
        }
        Ok(())
    }

    #[cfg(feature = "live")]
    fn start_watching(&self) -> Result<()> {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        for dir in &self.inner.dirs {
            dir.watch(self.inner.debounce, sender.clone())?;
        }
        drop(sender);

        // The loop must not keep the engine alive on its own.
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some((change, dir)) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let filer = Filer { inner };
                tokio::spawn(async move {
                    if let Err(err) = filer.on_dir_change(change, dir).await {
                        tracing::error!("failed to handle change: {}", err);
                    }
                });
            }
        });

        *self.inner.event_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stops watching. The table stays readable.
    pub fn close(&self) {
        for dir in &self.inner.dirs {
            dir.close();
        }

        let handle = self
            .inner
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Runs every future to completion, then reports the first error.
pub(crate) async fn run_all<F>(works: impl IntoIterator<Item = F>) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    join_all(works).await.into_iter().collect()
}
