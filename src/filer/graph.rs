//! Membership of source files in build configs, and the dependency edges
//! that drive it.
//!
//! The `begin_*` functions run under the state lock. They apply every graph
//! change right away, recursively for the files they pull in or drop, and
//! return the async remainder as [`Work`].

use camino::Utf8Path;
use futures::future::FutureExt;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing::Instrument;

use crate::config::BuildConfigInput;
use crate::error::{FilerError, Result};
use crate::filer::state::FilerState;
use crate::filer::{Filer, Work, run_all};
use crate::log::{PROGRESS_STYLE, as_overhead};
use crate::sync::{
    DependencyChanges, diff_build_files, diff_dependencies, sync_build_files_to_disk,
    sync_build_files_to_memory,
};

impl Filer {
    /// Makes a source file a member of a build config and builds it, unless
    /// its artifacts come back from the metadata cache.
    pub async fn add_source_file_to_build(&self, id: &Utf8Path, name: &str, is_input: bool) -> Result<()> {
        let work = {
            let mut state = self.state();
            self.begin_add(&mut state, id, name, is_input)?
        };
        work.await
    }

    /// Takes a source file out of a build config, deleting its artifacts.
    pub async fn remove_source_file_from_build(&self, id: &Utf8Path, name: &str, update_meta: bool) -> Result<()> {
        let work = {
            let mut state = self.state();
            self.begin_remove(&mut state, id, name, update_meta)?
        };
        work.await
    }

    pub(crate) fn begin_add(&self, state: &mut FilerState, id: &Utf8Path, name: &str, is_input: bool) -> Result<Work> {
        let file = state.file_mut(id)?;
        if !file.buildable {
            return Err(FilerError::invariant(format!("{id} is not buildable")));
        }
        if !file.build_configs.insert(name.to_string()) {
            return Err(FilerError::invariant(format!("{id} is already in build config '{name}'")));
        }
        tracing::debug!("adding {} to {}", id, name);

        if is_input {
            file.is_input_to_build_configs.insert(name.to_string());
        }
        file.dependencies.entry(name.to_string()).or_default();
        file.dependents.entry(name.to_string()).or_default();

        let (followups, needs_build) = match file.cached_build_files.remove(name) {
            Some(cached) => {
                file.build_files.insert(name.to_string(), cached.clone());
                let dirty = file.dirty;

                let changes = diff_build_files(&cached, None);
                sync_build_files_to_memory(&mut state.build_files, &changes);
                let dependency_changes = diff_dependencies(&cached, None);
                let followups = self.begin_update_dependencies(state, id, name, &dependency_changes)?;
                (followups, dirty)
            }
            None => {
                file.build_files.insert(name.to_string(), Vec::new());
                (Vec::new(), true)
            }
        };

        let filer = self.clone();
        let id = id.to_path_buf();
        let name = name.to_string();

        Ok(async move {
            run_all(followups).await?;

            if needs_build {
                filer.build_source_file(&id, &name).await?;
                if let Some(file) = filer.state().files.get_mut(&id) {
                    file.dirty = false;
                }
            }
            Ok(())
        }
        .boxed())
    }

    pub(crate) fn begin_remove(
        &self,
        state: &mut FilerState,
        id: &Utf8Path,
        name: &str,
        update_meta: bool,
    ) -> Result<Work> {
        // Membership goes first so that a cascade coming back around a cycle
        // doesn't try to remove this file a second time.
        let file = state.file_mut(id)?;
        if !file.build_configs.remove(name) {
            return Err(FilerError::invariant(format!("{id} is not in build config '{name}'")));
        }
        let old = file.build_files.get(name).cloned().unwrap_or_default();
        tracing::debug!("removing {} from {}", id, name);

        let changes = diff_build_files(&[], Some(old.as_slice()));
        sync_build_files_to_memory(&mut state.build_files, &changes);
        let dependency_changes = diff_dependencies(&[], Some(old.as_slice()));
        let followups = self.begin_update_dependencies(state, id, name, &dependency_changes)?;

        let file = state.file_mut(id)?;
        let detached = file.build_files.remove(name).is_some()
            && file.dependencies.remove(name).is_some()
            && file.dependents.remove(name).is_some();
        if !detached {
            return Err(FilerError::invariant(format!(
                "{id} was only partially a member of build config '{name}'"
            )));
        }
        file.is_input_to_build_configs.remove(name);
        let source = file.to_build_source();

        state.enqueued_builds.remove(&(id.to_path_buf(), name.to_string()));

        let config = self
            .inner
            .ctx
            .build_configs
            .get(name)
            .cloned()
            .ok_or_else(|| FilerError::invariant(format!("unknown build config '{name}'")))?;

        let filer = self.clone();
        let id = id.to_path_buf();

        Ok(async move {
            let (synced, followed) = futures::join!(sync_build_files_to_disk(changes), run_all(followups));
            synced?;
            followed?;

            if let Some(builder) = &filer.inner.builder
                && let Err(err) = builder.on_remove(&source, &config, &filer.inner.ctx).await
            {
                tracing::error!("on_remove for {} failed in {}:\n{:?}", config.name, id, err);
            }

            if update_meta {
                let record = {
                    let mut state = filer.state();
                    filer.record_meta(&mut state, &id, None)?
                };
                if let Some((cache_id, bytes)) = record {
                    filer.inner.meta.write(&id, cache_id, bytes).await?;
                }
            }
            Ok(())
        }
        .boxed())
    }

    /// Applies the edges a build of `id` gained and lost.
    ///
    /// Gained edges pull their dependency into the config. Lost edges drop
    /// it once nothing depends on it anymore, unless it's an input.
    pub(crate) fn begin_update_dependencies(
        &self,
        state: &mut FilerState,
        id: &Utf8Path,
        name: &str,
        changes: &DependencyChanges,
    ) -> Result<Vec<Work>> {
        let build_root = self.inner.ctx.paths.build_root();
        let map = &self.inner.map_dependency_to_source_id;
        let mut works = Vec::new();

        for dependency in &changes.added {
            if dependency.external {
                continue;
            }
            let dependency_id = map(dependency, &build_root);
            if dependency_id.as_path() == id {
                continue;
            }

            state
                .file_mut(id)?
                .dependencies
                .entry(name.to_string())
                .or_default()
                .entry(dependency_id.clone())
                .or_default()
                .insert(dependency.build_id.clone(), dependency.clone());

            // Not (yet) in the table: the edge stays on this side until a
            // file with that id shows up.
            let Some(target) = state.files.get_mut(&dependency_id).filter(|file| file.buildable) else {
                continue;
            };

            target
                .dependents
                .entry(name.to_string())
                .or_default()
                .entry(id.to_path_buf())
                .or_default()
                .insert(dependency.build_id.clone(), dependency.clone());

            if !target.build_configs.contains(name) {
                let is_input = self
                    .inner
                    .ctx
                    .build_configs
                    .get(name)
                    .is_some_and(|config| config.is_input(&dependency_id));
                works.push(self.begin_add(state, &dependency_id, name, is_input)?);
            }
        }

        for dependency in &changes.removed {
            if dependency.external {
                continue;
            }
            let dependency_id = map(dependency, &build_root);
            if dependency_id.as_path() == id {
                continue;
            }

            let resolved = state.buildable(&dependency_id).is_some();
            let file = state.file_mut(id)?;
            let edges = file.dependencies.get_mut(name).and_then(|map| map.get_mut(&dependency_id));

            if !resolved {
                if let Some(edges) = edges {
                    edges.remove(&dependency.build_id);
                    if edges.is_empty()
                        && let Some(map) = file.dependencies.get_mut(name)
                    {
                        map.remove(&dependency_id);
                    }
                }
                continue;
            }

            let removed = edges.and_then(|edges| edges.remove(&dependency.build_id));
            if removed.is_none() {
                return Err(FilerError::invariant(format!(
                    "{id} has no dependency on {dependency_id} in '{name}' to remove"
                )));
            }
            if let Some(map) = file.dependencies.get_mut(name)
                && map.get(&dependency_id).is_some_and(|edges| edges.is_empty())
            {
                map.remove(&dependency_id);
            }

            let target = state.file_mut(&dependency_id)?;
            let dependents = target.dependents.get_mut(name);
            let removed = dependents
                .and_then(|map| map.get_mut(id))
                .and_then(|edges| edges.remove(&dependency.build_id));
            if removed.is_none() {
                return Err(FilerError::invariant(format!(
                    "{dependency_id} has no dependent {id} in '{name}' to remove"
                )));
            }

            let dependents = target.dependents.entry(name.to_string()).or_default();
            if dependents.get(id).is_some_and(|edges| edges.is_empty()) {
                dependents.remove(id);
            }

            if dependents.is_empty()
                && target.build_configs.contains(name)
                && !target.is_input_to(name)
            {
                works.push(self.begin_remove(state, &dependency_id, name, true)?);
            }
        }

        Ok(works)
    }

    /// Finds the build configs a file that just appeared should join: the
    /// ones it's an input of, and the ones other files already import it in.
    pub async fn init_source_file(&self, id: &Utf8Path) -> Result<()> {
        let works = {
            let mut state = self.state();
            self.begin_init_source_file(&mut state, id)?
        };
        run_all(works).await
    }

    fn begin_init_source_file(&self, state: &mut FilerState, id: &Utf8Path) -> Result<Vec<Work>> {
        if state.buildable(id).is_none() {
            return Ok(Vec::new());
        }

        let dependent_triggered = state.dependent_triggered(id);
        let mut works = Vec::new();

        for config in &self.inner.ctx.build_configs {
            let is_input = config.is_input(id);
            let file = state.file_mut(id)?;

            if file.build_configs.contains(&config.name) {
                if is_input {
                    file.is_input_to_build_configs.insert(config.name.clone());
                }
                continue;
            }

            if is_input || dependent_triggered.contains(&config.name) {
                works.push(self.begin_add(state, id, &config.name, is_input)?);
            }
        }

        Ok(works)
    }

    /// Forgets a source file: it leaves every build config, then its
    /// metadata is deleted.
    pub async fn destroy_source_id(&self, id: &Utf8Path) -> Result<()> {
        let works = {
            let mut state = self.state();
            let Some(file) = state.files.get(id) else {
                return Ok(());
            };

            let names: Vec<String> = file.build_configs.iter().cloned().collect();
            let mut works = Vec::with_capacity(names.len());
            for name in names {
                works.push(self.begin_remove(&mut state, id, &name, false)?);
            }

            state.files.remove(id);
            state.enqueued_builds.retain(|(source_id, _)| source_id.as_path() != id);
            works
        };
        tracing::debug!("destroyed {}", id);

        let removed = run_all(works).await;
        self.inner.meta.delete(id).await?;
        removed
    }

    /// Adds every input of every build config, which pulls in everything
    /// they import.
    pub(crate) async fn build_initial_graph(&self) -> Result<()> {
        let works = {
            let mut state = self.state();
            state.graph_ready = true;
            let ids = state.sorted_ids();
            let mut works = Vec::new();

            for config in &self.inner.ctx.build_configs {
                for input in &config.input {
                    if let BuildConfigInput::Path(path) = input
                        && state.buildable(path).is_none()
                    {
                        return Err(FilerError::MissingInput(config.name.clone(), path.clone()));
                    }
                }

                for id in &ids {
                    if state.buildable(id).is_none() || !config.is_input(id) {
                        continue;
                    }

                    let file = state.file_mut(id)?;
                    if file.build_configs.contains(&config.name) {
                        // Already pulled in as someone's dependency.
                        file.is_input_to_build_configs.insert(config.name.clone());
                        continue;
                    }

                    works.push(self.begin_add(&mut state, id, &config.name, true)?);
                }
            }

            works
        };

        if works.is_empty() {
            return Ok(());
        }

        let start = std::time::Instant::now();
        let span = tracing::info_span!("build_graph");
        span.pb_set_style(&PROGRESS_STYLE);
        span.pb_set_length(works.len() as u64);
        span.pb_set_message("Building inputs...");

        let tracked = works.into_iter().map(|work| {
            let span = span.clone();
            async move {
                let result = work.await;
                span.pb_inc(1);
                result
            }
        });
        let result = run_all(tracked).instrument(span.clone()).await;

        tracing::info!("built the initial graph {}", as_overhead(start));
        result
    }
}
