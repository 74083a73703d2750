//! Watched directories: replaying the existing tree and turning filesystem
//! events into [`DirChange`]s.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::content::PathStats;
use crate::error::{FilerError, Result};

/// Index of a watched dir in the filer's dir list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    /// Files are compiled through the builder.
    Buildable,
    /// Files are only tracked, e.g. static assets served as they are.
    Served,
}

/// Predicate over absolute paths; `false` hides a path from the filer.
pub type PathFilter = Arc<dyn Fn(&Utf8Path) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirChangeKind {
    /// The file existed when the dir was first read.
    Init,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirChange {
    pub kind: DirChangeKind,
    /// Relative to the watched dir.
    pub path: Utf8PathBuf,
    pub stats: PathStats,
}

pub struct FilerDir {
    pub id: DirId,
    /// Absolute and canonical.
    pub path: Utf8PathBuf,
    pub kind: DirKind,
    filter: Option<PathFilter>,
    #[cfg(feature = "live")]
    debouncer: std::sync::Mutex<Option<live::Debouncer>>,
}

impl std::fmt::Debug for FilerDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilerDir")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl FilerDir {
    pub fn new(id: DirId, path: Utf8PathBuf, kind: DirKind, filter: Option<PathFilter>) -> Self {
        Self {
            id,
            path,
            kind,
            filter,
            #[cfg(feature = "live")]
            debouncer: std::sync::Mutex::new(None),
        }
    }

    pub fn buildable(&self) -> bool {
        self.kind == DirKind::Buildable
    }

    /// Absolute id of a path relative to this dir.
    pub fn to_id(&self, path: &Utf8Path) -> Utf8PathBuf {
        self.path.join(path)
    }

    fn is_visible(&self, path: &Utf8Path) -> bool {
        is_visible(self.filter.as_ref(), path)
    }

    /// Lists every file currently under the dir as an `Init` change.
    ///
    /// A missing dir is created first so it can be watched afterwards.
    pub async fn init(&self) -> Result<Vec<DirChange>> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|err| FilerError::io(&self.path, err))?;

        let pattern = format!("{}/**/*", glob::Pattern::escape(self.path.as_str()));
        let mut changes = Vec::new();

        let entries = glob::glob(&pattern).map_err(crate::error::ConfigError::from)?;
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!("couldn't read {}: {}", err.path().display(), err);
                    continue;
                }
            };
            let Ok(path) = Utf8PathBuf::try_from(path) else {
                tracing::warn!("skipping non UTF-8 path under {}", self.path);
                continue;
            };
            if !self.is_visible(&path) {
                continue;
            }

            let stats = PathStats::load(&path)
                .await
                .map_err(|err| FilerError::io(&path, err))?;
            if stats.is_directory {
                continue;
            }

            if let Ok(relative) = path.strip_prefix(&self.path) {
                changes.push(DirChange {
                    kind: DirChangeKind::Init,
                    path: relative.to_path_buf(),
                    stats,
                });
            }
        }

        Ok(changes)
    }

    /// Starts forwarding debounced filesystem events to `sender`.
    #[cfg(feature = "live")]
    pub fn watch(
        &self,
        debounce: std::time::Duration,
        sender: tokio::sync::mpsc::UnboundedSender<(DirChange, DirId)>,
    ) -> Result<()> {
        use notify::RecursiveMode;

        let mut slot = self
            .debouncer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return Err(crate::error::WatchError::AlreadyWatching(self.path.clone()).into());
        }

        let id = self.id;
        let root = self.path.clone();
        let filter = self.filter.clone();
        let mut debouncer = notify_debouncer_full::new_debouncer(
            debounce,
            None,
            move |result: notify_debouncer_full::DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        for change in live::changes_from_event(&root, filter.as_ref(), &event.event) {
                            if sender.send((change, id)).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for err in errors {
                        tracing::error!("watch error in {}: {:?}", root, err);
                    }
                }
            },
        )
        .map_err(crate::error::WatchError::from)?;

        debouncer
            .watch(&self.path, RecursiveMode::Recursive)
            .map_err(crate::error::WatchError::from)?;
        tracing::info!("watching {}", self.path);

        *slot = Some(debouncer);
        Ok(())
    }

    /// Stops the watcher, if one is running.
    pub fn close(&self) {
        #[cfg(feature = "live")]
        {
            let debouncer = self
                .debouncer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(debouncer) = debouncer {
                debouncer.stop();
                tracing::debug!("stopped watching {}", self.path);
            }
        }
    }
}

fn is_visible(filter: Option<&PathFilter>, path: &Utf8Path) -> bool {
    filter.is_none_or(|filter| filter(path))
}

#[cfg(feature = "live")]
mod live {
    use camino::Utf8Path;
    use notify::event::{ModifyKind, RemoveKind};
    use notify::{EventKind, RecommendedWatcher};
    use notify_debouncer_full::RecommendedCache;

    use super::{DirChange, DirChangeKind, PathFilter, is_visible};
    use crate::content::PathStats;

    pub(super) type Debouncer = notify_debouncer_full::Debouncer<RecommendedWatcher, RecommendedCache>;

    /// Maps a notify event onto a change kind, given whether the path still
    /// exists once the debounce window closed.
    pub(super) fn classify(kind: &EventKind, exists: bool) -> Option<DirChangeKind> {
        match (kind, exists) {
            (EventKind::Access(_), _) => None,
            (_, false) => Some(DirChangeKind::Delete),
            (EventKind::Create(_), true) => Some(DirChangeKind::Create),
            // The target of a rename shows up as a new file.
            (EventKind::Modify(ModifyKind::Name(_)), true) => Some(DirChangeKind::Create),
            (_, true) => Some(DirChangeKind::Update),
        }
    }

    pub(super) fn changes_from_event(
        root: &Utf8Path,
        filter: Option<&PathFilter>,
        event: &notify::Event,
    ) -> Vec<DirChange> {
        let mut changes = Vec::new();

        for path in &event.paths {
            let Some(path) = Utf8Path::from_path(path) else {
                continue;
            };
            if !is_visible(filter, path) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if relative.as_str().is_empty() {
                continue;
            }

            let metadata = std::fs::metadata(path).ok();
            let Some(kind) = classify(&event.kind, metadata.is_some()) else {
                continue;
            };
            let stats = match &metadata {
                Some(metadata) => PathStats::from(metadata),
                None => PathStats::removed(is_folder_removal(&event.kind)),
            };

            changes.push(DirChange {
                kind,
                path: relative.to_path_buf(),
                stats,
            });
        }

        changes
    }

    pub(super) fn is_folder_removal(kind: &EventKind) -> bool {
        matches!(kind, EventKind::Remove(RemoveKind::Folder))
    }

}
