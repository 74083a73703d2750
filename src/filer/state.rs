//! The mutable half of the filer, always accessed under one lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::{BoxFuture, Shared};

use crate::error::{FilerError, Result};
use crate::source::{BuildFile, BuildName, SourceFile};

pub(crate) type SharedUpdate = Shared<BoxFuture<'static, Result<bool, Arc<FilerError>>>>;

pub(crate) type BuildKey = (Utf8PathBuf, BuildName);

#[derive(Default)]
pub(crate) struct FilerState {
    pub files: HashMap<Utf8PathBuf, SourceFile>,
    /// Every artifact of every source file, by output id.
    pub build_files: HashMap<Utf8PathBuf, Arc<BuildFile>>,

    pub pending_updates: HashMap<Utf8PathBuf, SharedUpdate>,
    pub pending_builds: HashSet<BuildKey>,
    pub enqueued_builds: HashSet<BuildKey>,

    /// Set once the initial graph construction started. From then on, new
    /// files pick up the edges other files already recorded towards them.
    pub graph_ready: bool,
}

impl FilerState {
    pub fn file_mut(&mut self, id: &Utf8Path) -> Result<&mut SourceFile> {
        self.files
            .get_mut(id)
            .ok_or_else(|| FilerError::invariant(format!("source file {id} is not in the table")))
    }

    /// A file that can take part in the dependency graph.
    pub fn buildable(&self, id: &Utf8Path) -> Option<&SourceFile> {
        self.files.get(id).filter(|file| file.buildable)
    }

    /// Mirrors into `file.dependents` every edge that other files recorded
    /// towards its id while it wasn't in the table.
    pub fn wire_pending_edges(&self, file: &mut SourceFile) {
        for other in self.files.values().filter(|other| other.buildable) {
            for (name, dependencies) in &other.dependencies {
                let Some(edges) = dependencies.get(&file.id) else {
                    continue;
                };
                if edges.is_empty() {
                    continue;
                }

                tracing::debug!("wiring {} edges from {} to {}", name, other.id, file.id);
                file.dependents
                    .entry(name.clone())
                    .or_default()
                    .entry(other.id.clone())
                    .or_default()
                    .extend(edges.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
    }

    /// Source ids in a stable order.
    pub fn sorted_ids(&self) -> Vec<Utf8PathBuf> {
        let mut ids: Vec<_> = self.files.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Configs some other file depends on `id` through, that `id` isn't a
    /// member of yet.
    pub fn dependent_triggered(&self, id: &Utf8Path) -> BTreeSet<BuildName> {
        let Some(file) = self.files.get(id) else {
            return BTreeSet::new();
        };

        file.dependents
            .iter()
            .filter(|(name, dependents)| !dependents.is_empty() && !file.build_configs.contains(*name))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;
    use crate::dir::DirId;
    use crate::source::BuildDependency;

    fn file(id: &str) -> SourceFile {
        SourceFile::new(id.into(), DirId(0), "/p/src".into(), true, Content::from(""))
    }

    #[test]
    fn test_wire_pending_edges() {
        let mut state = FilerState::default();

        let mut a = file("/p/src/a.ts");
        let edge = BuildDependency::new("./b.js", "/p/.filer/dev/node/src/b.js");
        a.dependencies
            .entry("node".into())
            .or_default()
            .entry("/p/src/b.ts".into())
            .or_default()
            .insert(edge.build_id.clone(), edge.clone());
        state.files.insert(a.id.clone(), a);

        let mut b = file("/p/src/b.ts");
        state.wire_pending_edges(&mut b);

        let dependents = &b.dependents["node"][Utf8Path::new("/p/src/a.ts")];
        assert_eq!(dependents.get(&edge.build_id), Some(&edge));

        state.files.insert(b.id.clone(), b);
        let triggered = state.dependent_triggered(Utf8Path::new("/p/src/b.ts"));
        assert_eq!(triggered, BTreeSet::from(["node".to_string()]));
    }

    #[test]
    fn test_missing_file_is_invariant() {
        let mut state = FilerState::default();
        assert!(matches!(
            state.file_mut(Utf8Path::new("/nope")),
            Err(FilerError::Invariant(_))
        ));
    }
}
