//! Reconciles the artifacts of one (source file, build config) pair between
//! builds, both in the in-memory table and on disk.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;

use crate::content::Content;
use crate::error::{FilerError, Result};
use crate::source::{BuildDependency, BuildFile};

#[derive(Debug, Clone)]
pub enum BuildFileChange {
    Added(Arc<BuildFile>),
    /// Same id as before. The bytes may or may not differ.
    Updated {
        file: Arc<BuildFile>,
        old: Arc<BuildFile>,
    },
    Removed(Arc<BuildFile>),
}

/// Compares the artifacts of a new build with the previous ones, by id.
///
/// With no previous set every new file is `Added`. Sets are expected to be
/// tiny, so this is a linear scan.
pub fn diff_build_files(
    new_files: &[Arc<BuildFile>],
    old_files: Option<&[Arc<BuildFile>]>,
) -> Vec<BuildFileChange> {
    let Some(old_files) = old_files else {
        return new_files.iter().cloned().map(BuildFileChange::Added).collect();
    };

    let mut changes = Vec::new();

    for old in old_files {
        if !new_files.iter().any(|file| file.id == old.id) {
            changes.push(BuildFileChange::Removed(old.clone()));
        }
    }

    for file in new_files {
        match old_files.iter().find(|old| old.id == file.id) {
            Some(old) => changes.push(BuildFileChange::Updated {
                file: file.clone(),
                old: old.clone(),
            }),
            None => changes.push(BuildFileChange::Added(file.clone())),
        }
    }

    changes
}

/// Applies changes to the table of build files keyed by output id.
pub fn sync_build_files_to_memory(
    files: &mut HashMap<Utf8PathBuf, Arc<BuildFile>>,
    changes: &[BuildFileChange],
) {
    for change in changes {
        match change {
            BuildFileChange::Added(file) | BuildFileChange::Updated { file, .. } => {
                files.insert(file.id.clone(), file.clone());
            }
            BuildFileChange::Removed(file) => {
                files.remove(&file.id);
            }
        }
    }
}

/// Applies changes to the output tree, skipping writes that would not change
/// the bytes on disk.
pub async fn sync_build_files_to_disk(changes: Vec<BuildFileChange>) -> Result<()> {
    join_all(changes.into_iter().map(sync_change_to_disk))
        .await
        .into_iter()
        .collect()
}

async fn sync_change_to_disk(change: BuildFileChange) -> Result<()> {
    match change {
        BuildFileChange::Added(file) => {
            if !is_same_on_disk(&file.id, &file.content).await {
                tracing::debug!("writing {}", file.id);
                write_build_file(&file).await?;
            }
        }
        BuildFileChange::Updated { file, old } => {
            if file.content != old.content {
                tracing::debug!("updating {}", file.id);
                write_build_file(&file).await?;
            }
        }
        BuildFileChange::Removed(file) => {
            tracing::debug!("removing {}", file.id);
            match tokio::fs::remove_file(&file.id).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(FilerError::io(&file.id, err)),
            }
        }
    }

    Ok(())
}

async fn is_same_on_disk(path: &Utf8Path, content: &Content) -> bool {
    match tokio::fs::read(path).await {
        Ok(bytes) => content.same_bytes(&bytes),
        Err(_) => false,
    }
}

async fn write_build_file(file: &BuildFile) -> Result<()> {
    if let Some(parent) = file.id.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| FilerError::io(parent, err))?;
    }

    tokio::fs::write(&file.id, file.content.as_bytes())
        .await
        .map_err(|err| FilerError::io(&file.id, err))
}

/// Dependency edges gained and lost between two builds, keyed by build id.
#[derive(Debug, Default, Clone)]
pub struct DependencyChanges {
    pub added: Vec<BuildDependency>,
    pub removed: Vec<BuildDependency>,
}

fn collect_dependencies(files: &[Arc<BuildFile>]) -> HashMap<&Utf8Path, &BuildDependency> {
    files
        .iter()
        .filter_map(|file| file.dependencies.as_ref())
        .flatten()
        .map(|dependency| (dependency.build_id.as_path(), dependency))
        .collect()
}

/// Compares the dependencies declared by two sets of build files.
pub fn diff_dependencies(
    new_files: &[Arc<BuildFile>],
    old_files: Option<&[Arc<BuildFile>]>,
) -> DependencyChanges {
    let new = collect_dependencies(new_files);
    let old = old_files.map(collect_dependencies).unwrap_or_default();

    let mut added: Vec<_> = new
        .iter()
        .filter(|(id, _)| !old.contains_key(*id))
        .map(|(_, dependency)| (*dependency).clone())
        .collect();
    let mut removed: Vec<_> = old
        .iter()
        .filter(|(id, _)| !new.contains_key(*id))
        .map(|(_, dependency)| (*dependency).clone())
        .collect();

    added.sort_by(|a, b| a.build_id.cmp(&b.build_id));
    removed.sort_by(|a, b| a.build_id.cmp(&b.build_id));

    DependencyChanges { added, removed }
}
