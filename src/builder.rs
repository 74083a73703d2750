//! The pluggable compile step.
//!
//! The filer never looks inside a file: it hands a [`BuildSource`] to a
//! [`Builder`] together with the target [`BuildConfig`] and gets back the
//! artifacts to keep. Dependency edges come from the `dependencies` the
//! builder attaches to its primary output.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{BuildConfig, BuildConfigs};
use crate::error::BuilderError;
use crate::paths::Paths;
use crate::source::{BuildDependency, BuildFile, BuildSource};

/// Shared, read-only state handed to every builder call.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub paths: Paths,
    pub build_configs: BuildConfigs,
}

impl BuildContext {
    pub fn dev(&self) -> bool {
        self.paths.dev
    }

    /// Output path of `source_id` for a config, with the extension swapped.
    pub fn build_out_id(&self, config: &BuildConfig, source_id: &Utf8Path, extension: &str) -> Utf8PathBuf {
        self.paths.to_build_out_id(&config.name, source_id, extension)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildResult {
    pub build_files: Vec<BuildFile>,
}

impl BuildResult {
    pub fn new(build_files: Vec<BuildFile>) -> Self {
        Self { build_files }
    }
}

#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &str;

    /// Called once, after the watched dirs were read and before the first
    /// build.
    async fn init(&self, _ctx: &BuildContext) -> Result<(), BuilderError> {
        Ok(())
    }

    async fn build(
        &self,
        source: &BuildSource,
        config: &BuildConfig,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError>;

    /// Called after `source` left `config`, its artifacts are already gone.
    async fn on_remove(
        &self,
        _source: &BuildSource,
        _config: &BuildConfig,
        _ctx: &BuildContext,
    ) -> Result<(), BuilderError> {
        Ok(())
    }
}

/// Copies every source to its output path unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBuilder;

#[async_trait]
impl Builder for NoopBuilder {
    fn name(&self) -> &str {
        "noop"
    }

    async fn build(
        &self,
        source: &BuildSource,
        config: &BuildConfig,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError> {
        let id = ctx.build_out_id(config, &source.id, &source.extension);
        let file = BuildFile::new(id, &source.id, &config.name, source.content.clone());
        Ok(BuildResult::new(vec![file]))
    }
}

/// Routes each source to a builder by its extension.
pub struct ExtensionBuilder {
    builders: HashMap<String, Arc<dyn Builder>>,
    fallback: Arc<dyn Builder>,
}

impl ExtensionBuilder {
    pub fn new(fallback: impl Builder + 'static) -> Self {
        Self {
            builders: HashMap::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Registers a builder for an extension, without the leading dot.
    pub fn with(mut self, extension: impl Into<String>, builder: Arc<dyn Builder>) -> Self {
        self.builders.insert(extension.into(), builder);
        self
    }

    fn resolve(&self, extension: &str) -> &Arc<dyn Builder> {
        self.builders.get(extension).unwrap_or(&self.fallback)
    }

    /// Each distinct builder once, the fallback first.
    fn distinct(&self) -> Vec<&Arc<dyn Builder>> {
        let mut builders: Vec<&Arc<dyn Builder>> = vec![&self.fallback];
        for builder in self.builders.values() {
            if !builders.iter().any(|known| Arc::ptr_eq(known, builder)) {
                builders.push(builder);
            }
        }
        builders
    }
}

impl std::fmt::Debug for ExtensionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut extensions: Vec<_> = self.builders.keys().collect();
        extensions.sort();
        f.debug_struct("ExtensionBuilder")
            .field("extensions", &extensions)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

#[async_trait]
impl Builder for ExtensionBuilder {
    fn name(&self) -> &str {
        "extension"
    }

    async fn init(&self, ctx: &BuildContext) -> Result<(), BuilderError> {
        for builder in self.distinct() {
            builder.init(ctx).await?;
        }
        Ok(())
    }

    async fn build(
        &self,
        source: &BuildSource,
        config: &BuildConfig,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError> {
        self.resolve(&source.extension).build(source, config, ctx).await
    }

    async fn on_remove(
        &self,
        source: &BuildSource,
        config: &BuildConfig,
        ctx: &BuildContext,
    ) -> Result<(), BuilderError> {
        self.resolve(&source.extension).on_remove(source, config, ctx).await
    }
}

/// Maps a dependency edge back to the id of the source file that produces
/// its build output. The second argument is the build root
/// (`<build dir>/<dev|prod>`).
pub type MapDependencyToSourceId = Arc<dyn Fn(&BuildDependency, &Utf8Path) -> Utf8PathBuf + Send + Sync>;

/// Output extensions mapped back to the source extension they come from.
const DEFAULT_EXTENSION_MAP: &[(&str, &str)] = &[("js", "ts")];

/// Strips `<build root>/<config>/` from the build id, rejoins the rest onto
/// `root`, and swaps output extensions for source extensions.
///
/// Build ids outside the build root are returned unchanged.
pub fn default_map_dependency_to_source_id(root: &Utf8Path) -> MapDependencyToSourceId {
    let root = root.to_path_buf();

    Arc::new(move |dependency, build_root| {
        let Ok(rest) = dependency.build_id.strip_prefix(build_root) else {
            return dependency.build_id.clone();
        };

        let mut components = rest.components();
        if components.next().is_none() {
            return dependency.build_id.clone();
        }

        let mut id = root.join(components.as_path());
        let extension = id.extension().unwrap_or_default();
        if let Some((_, source)) = DEFAULT_EXTENSION_MAP.iter().find(|(out, _)| *out == extension) {
            id.set_extension(source);
        }
        id
    })
}
