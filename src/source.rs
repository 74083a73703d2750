//! Files tracked by the filer: watched sources and the artifacts built from
//! them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::content::{Content, Encoding, PathStats};
use crate::dir::DirId;
use crate::hash::Hash32;

/// Name of a build config, used as the key of every per-config map.
pub type BuildName = String;

/// Edges from one file to another, keyed by the build id they resolve to.
pub type DependencyEdges = BTreeMap<Utf8PathBuf, BuildDependency>;

/// `other source id -> edges`, for one build config.
pub type DependencyMap = BTreeMap<Utf8PathBuf, DependencyEdges>;

/// One import discovered while compiling a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDependency {
    /// The specifier as written in the source.
    pub specifier: String,
    /// The specifier after the builder rewrote it for the output.
    pub mapped_specifier: String,
    /// The build output the specifier resolves to. Edges are keyed by it.
    pub build_id: Utf8PathBuf,
    /// Whether the specifier names a package rather than a project file.
    pub external: bool,
}

impl BuildDependency {
    pub fn new(specifier: impl Into<String>, build_id: impl Into<Utf8PathBuf>) -> Self {
        let specifier = specifier.into();
        Self {
            mapped_specifier: specifier.clone(),
            specifier,
            build_id: build_id.into(),
            external: false,
        }
    }

    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }
}

/// One output artifact of compiling a source file for one build config.
///
/// Never mutated after creation: a rebuild produces new `BuildFile`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFile {
    /// Path in the build output tree.
    pub id: Utf8PathBuf,
    pub source_id: Utf8PathBuf,
    pub build_config: BuildName,
    pub content: Content,
    /// Set on the primary output of a compile only.
    pub dependencies: Option<Vec<BuildDependency>>,
}

impl BuildFile {
    pub fn new(
        id: impl Into<Utf8PathBuf>,
        source_id: impl Into<Utf8PathBuf>,
        build_config: impl Into<BuildName>,
        content: impl Into<Content>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            build_config: build_config.into(),
            content: content.into(),
            dependencies: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<BuildDependency>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    pub fn encoding(&self) -> Encoding {
        self.content.encoding()
    }

    pub fn extension(&self) -> &str {
        self.id.extension().unwrap_or_default()
    }
}

/// A read-only view of a source file handed to builders.
#[derive(Debug, Clone)]
pub struct BuildSource {
    pub id: Utf8PathBuf,
    pub dir: Utf8PathBuf,
    pub extension: String,
    pub content: Content,
    pub content_hash: Hash32,
}

impl BuildSource {
    pub fn encoding(&self) -> Encoding {
        self.content.encoding()
    }
}

/// A file under a watched dir and its state across every build config it
/// takes part in.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub id: Utf8PathBuf,
    pub dir: DirId,
    /// Absolute path of the watched dir `dir` refers to.
    pub dir_path: Utf8PathBuf,
    /// `false` for files of served-only dirs.
    pub buildable: bool,
    pub encoding: Encoding,
    pub extension: String,
    pub content: Content,
    pub(crate) content_hash: Option<Hash32>,
    pub(crate) stats: Option<PathStats>,
    /// Content changed since the last successful build.
    pub dirty: bool,

    pub build_configs: BTreeSet<BuildName>,
    pub is_input_to_build_configs: BTreeSet<BuildName>,
    pub build_files: BTreeMap<BuildName, Vec<Arc<BuildFile>>>,
    pub dependencies: BTreeMap<BuildName, DependencyMap>,
    pub dependents: BTreeMap<BuildName, DependencyMap>,

    /// Artifacts reconstructed from the metadata cache, waiting for the file
    /// to join their build config.
    pub(crate) cached_build_files: BTreeMap<BuildName, Vec<Arc<BuildFile>>>,
}

impl SourceFile {
    pub(crate) fn new(
        id: Utf8PathBuf,
        dir: DirId,
        dir_path: Utf8PathBuf,
        buildable: bool,
        content: Content,
    ) -> Self {
        Self {
            extension: id.extension().unwrap_or_default().to_string(),
            encoding: content.encoding(),
            id,
            dir,
            dir_path,
            buildable,
            content,
            content_hash: None,
            stats: None,
            dirty: false,
            build_configs: BTreeSet::new(),
            is_input_to_build_configs: BTreeSet::new(),
            build_files: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            dependents: BTreeMap::new(),
            cached_build_files: BTreeMap::new(),
        }
    }

    pub fn content_hash(&mut self) -> Hash32 {
        *self.content_hash.get_or_insert_with(|| self.content.hash())
    }

    /// The last known stats, if any were loaded since the content changed.
    pub fn stats(&self) -> Option<PathStats> {
        self.stats
    }

    /// Replaces the content in place, keeping the identity of the file.
    pub(crate) fn set_content(&mut self, content: Content) {
        self.encoding = content.encoding();
        self.content = content;
        self.content_hash = None;
        self.stats = None;
        self.cached_build_files.clear();
        self.dirty = true;
    }

    pub fn is_input_to(&self, name: &str) -> bool {
        self.is_input_to_build_configs.contains(name)
    }

    pub fn has_cached_build_files(&self) -> bool {
        !self.cached_build_files.is_empty()
    }

    pub(crate) fn to_build_source(&mut self) -> BuildSource {
        BuildSource {
            id: self.id.clone(),
            dir: self.dir_path.clone(),
            extension: self.extension.clone(),
            content: self.content.clone(),
            content_hash: self.content_hash(),
        }
    }

    /// Every dependency edge recorded for a build config, flattened.
    pub fn dependency_edges<'a>(
        &'a self,
        name: &str,
    ) -> impl Iterator<Item = (&'a Utf8Path, &'a BuildDependency)> + 'a {
        self.dependencies
            .get(name)
            .into_iter()
            .flat_map(|map| map.iter())
            .flat_map(|(id, edges)| edges.values().map(move |edge| (id.as_path(), edge)))
    }
}
