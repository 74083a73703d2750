use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::builder::{Builder, MapDependencyToSourceId, default_map_dependency_to_source_id};
use crate::config::{BuildConfig, BuildConfigs};
use crate::dir::{DirId, DirKind, FilerDir, PathFilter};
use crate::error::{ConfigError, Result};
use crate::filer::Filer;
use crate::paths::Paths;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Everything needed to create a [`Filer`].
///
/// ```no_run
/// # use filer::{BuildConfig, BuildConfigInput, FilerOptions, NoopBuilder, Platform};
/// # fn main() -> Result<(), filer::FilerError> {
/// let filer = FilerOptions::new("/project")
///     .source_dir("src")
///     .builder(NoopBuilder)
///     .build_config(
///         BuildConfig::new("browser", Platform::Browser)
///             .with_input(BuildConfigInput::path("/project/src/index.ts")),
///     )
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct FilerOptions {
    root: Utf8PathBuf,
    dev: bool,
    build_dir: Option<Utf8PathBuf>,
    source_dirs: Vec<Utf8PathBuf>,
    served_dirs: Vec<Utf8PathBuf>,
    builder: Option<Arc<dyn Builder>>,
    build_configs: Vec<BuildConfig>,
    map_dependency_to_source_id: Option<MapDependencyToSourceId>,
    watch: bool,
    debounce: Duration,
    filter: Option<PathFilter>,
    clean_output_dirs: bool,
}

impl FilerOptions {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            dev: true,
            build_dir: None,
            source_dirs: Vec::new(),
            served_dirs: Vec::new(),
            builder: None,
            build_configs: Vec::new(),
            map_dependency_to_source_id: None,
            watch: false,
            debounce: DEFAULT_DEBOUNCE,
            filter: None,
            clean_output_dirs: false,
        }
    }

    /// Development or production build trees. Defaults to development.
    pub fn dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    /// Where build outputs and metadata go, `<root>/.filer` by default.
    pub fn build_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.build_dir = Some(dir.into());
        self
    }

    /// A dir whose files are compiled. Relative paths are resolved against
    /// the root.
    pub fn source_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.source_dirs.push(dir.into());
        self
    }

    /// A dir whose files are tracked but never compiled.
    pub fn served_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.served_dirs.push(dir.into());
        self
    }

    pub fn builder(mut self, builder: impl Builder + 'static) -> Self {
        self.builder = Some(Arc::new(builder));
        self
    }

    pub fn shared_builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn build_config(mut self, config: BuildConfig) -> Self {
        self.build_configs.push(config);
        self
    }

    pub fn build_configs(mut self, configs: impl IntoIterator<Item = BuildConfig>) -> Self {
        self.build_configs.extend(configs);
        self
    }

    pub fn map_dependency_to_source_id(mut self, map: MapDependencyToSourceId) -> Self {
        self.map_dependency_to_source_id = Some(map);
        self
    }

    /// Keep watching the dirs after [`Filer::init`]. Off by default.
    pub fn watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Hides paths from the filer, both when reading dirs and when watching.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Utf8Path) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// After the first build, delete files in the output dirs that no
    /// source produced.
    pub fn clean_output_dirs(mut self, clean: bool) -> Self {
        self.clean_output_dirs = clean;
        self
    }

    pub fn build(self) -> Result<Filer> {
        let has_source_dirs = !self.source_dirs.is_empty();

        if has_source_dirs && self.builder.is_none() {
            return Err(ConfigError::MissingBuilder.into());
        }
        if !has_source_dirs && (self.builder.is_some() || !self.build_configs.is_empty()) {
            return Err(ConfigError::ServedWithBuild.into());
        }

        let root = resolve_dir(&self.root, None)?;
        let paths = Paths::new(root, self.build_dir, self.dev);

        let source_dirs = self
            .source_dirs
            .iter()
            .map(|dir| resolve_dir(dir, Some(&paths.root)))
            .collect::<Result<Vec<_>, _>>()?;
        let served_dirs = self
            .served_dirs
            .iter()
            .map(|dir| resolve_dir(dir, Some(&paths.root)))
            .collect::<Result<Vec<_>, _>>()?;

        check_dirs(source_dirs.iter().chain(&served_dirs))?;

        let source_root = source_dirs.first().cloned().unwrap_or_else(|| paths.root.clone());
        let build_configs = BuildConfigs::new(self.build_configs, &source_root, has_source_dirs)?;

        let filter = compose_filter(paths.build_dir.clone(), self.filter);
        let dirs = source_dirs
            .into_iter()
            .map(|path| (path, DirKind::Buildable))
            .chain(served_dirs.into_iter().map(|path| (path, DirKind::Served)))
            .enumerate()
            .map(|(i, (path, kind))| FilerDir::new(DirId(i), path, kind, Some(filter.clone())))
            .collect();

        let map_dependency_to_source_id = self
            .map_dependency_to_source_id
            .unwrap_or_else(|| default_map_dependency_to_source_id(&paths.root));

        Ok(Filer::from_parts(super::FilerParts {
            paths,
            dirs,
            builder: self.builder,
            build_configs,
            map_dependency_to_source_id,
            watch: self.watch,
            debounce: self.debounce,
            clean_output_dirs: self.clean_output_dirs,
        }))
    }
}

/// Makes `dir` absolute and canonical, creating it if it's missing.
fn resolve_dir(dir: &Utf8Path, root: Option<&Utf8Path>) -> Result<Utf8PathBuf, ConfigError> {
    let dir = match root {
        Some(root) if dir.is_relative() => root.join(dir),
        _ => dir.to_path_buf(),
    };

    std::fs::create_dir_all(&dir).map_err(|err| ConfigError::ResolveDir(dir.clone(), err))?;
    dir.canonicalize_utf8()
        .map_err(|err| ConfigError::ResolveDir(dir.clone(), err))
}

/// Watched dirs must be disjoint: every file belongs to exactly one.
fn check_dirs<'a>(dirs: impl Iterator<Item = &'a Utf8PathBuf> + Clone) -> Result<(), ConfigError> {
    for (i, a) in dirs.clone().enumerate() {
        for (j, b) in dirs.clone().enumerate() {
            if i == j {
                continue;
            }
            if a == b {
                return Err(ConfigError::DuplicateDir(a.clone()));
            }
            if a.starts_with(b) {
                return Err(ConfigError::NestedDirs(a.clone(), b.clone()));
            }
        }
    }
    Ok(())
}

/// The build dir is always hidden, on top of the user's filter.
fn compose_filter(build_dir: Utf8PathBuf, filter: Option<PathFilter>) -> PathFilter {
    Arc::new(move |path: &Utf8Path| {
        !path.starts_with(&build_dir) && filter.as_ref().is_none_or(|filter| filter(path))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::NoopBuilder;
    use crate::config::Platform;
    use crate::error::FilerError;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().canonicalize().unwrap()).unwrap();
        (dir, path)
    }

    fn config_err(result: Result<Filer>) -> ConfigError {
        match result {
            Err(FilerError::Config(err)) => err,
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("expected a config error"),
        }
    }

    #[test]
    fn test_missing_builder() {
        let (_guard, root) = tempdir();
        let result = FilerOptions::new(&root)
            .source_dir("src")
            .build_config(BuildConfig::new("node", Platform::Node))
            .build();
        assert!(matches!(config_err(result), ConfigError::MissingBuilder));
    }

    #[test]
    fn test_served_with_build() {
        let (_guard, root) = tempdir();
        let result = FilerOptions::new(&root)
            .served_dir("static")
            .builder(NoopBuilder)
            .build();
        assert!(matches!(config_err(result), ConfigError::ServedWithBuild));

        let result = FilerOptions::new(&root)
            .served_dir("static")
            .build_config(BuildConfig::new("node", Platform::Node))
            .build();
        assert!(matches!(config_err(result), ConfigError::ServedWithBuild));
    }

    #[test]
    fn test_no_build_configs() {
        let (_guard, root) = tempdir();
        let result = FilerOptions::new(&root).source_dir("src").builder(NoopBuilder).build();
        assert!(matches!(config_err(result), ConfigError::NoBuildConfigs));
    }

    #[test]
    fn test_nested_and_duplicate_dirs() {
        let (_guard, root) = tempdir();

        let result = FilerOptions::new(&root)
            .source_dir("src")
            .served_dir("src/static")
            .builder(NoopBuilder)
            .build_config(BuildConfig::new("node", Platform::Node))
            .build();
        assert!(matches!(config_err(result), ConfigError::NestedDirs(..)));

        let result = FilerOptions::new(&root)
            .source_dir("src")
            .source_dir(root.join("src"))
            .builder(NoopBuilder)
            .build_config(BuildConfig::new("node", Platform::Node))
            .build();
        assert!(matches!(config_err(result), ConfigError::DuplicateDir(_)));
    }

    #[test]
    fn test_similar_names_are_not_nested() {
        let (_guard, root) = tempdir();
        let filer = FilerOptions::new(&root)
            .source_dir("src")
            .served_dir("src-static")
            .builder(NoopBuilder)
            .build_config(BuildConfig::new("node", Platform::Node))
            .build()
            .unwrap();

        assert_eq!(filer.build_configs().len(), 3);
        assert_eq!(filer.paths().build_dir, root.join(".filer"));
    }

    #[test]
    fn test_filter_hides_build_dir() {
        let user: PathFilter = Arc::new(|path: &Utf8Path| path.extension() != Some("swp"));
        let filter = compose_filter(Utf8PathBuf::from("/p/.filer"), Some(user));

        assert!(filter(Utf8Path::new("/p/src/a.ts")));
        assert!(!filter(Utf8Path::new("/p/.filer/dev/node/a.js")));
        assert!(!filter(Utf8Path::new("/p/src/a.ts.swp")));
    }
}
