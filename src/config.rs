//! Build configs: the named targets every source file may be compiled against.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Reserved config for the tool's own files (tasks and the like).
pub const SYSTEM_BUILD_CONFIG_NAME: &str = "system";
/// Reserved config for the project's configuration file.
pub const CONFIG_BUILD_CONFIG_NAME: &str = "config";
/// File picked up by the reserved `config` build config.
pub const CONFIG_FILE_NAME: &str = "filer.config.ts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Node,
    Browser,
}

type InputFilter = Arc<dyn Fn(&Utf8Path) -> bool + Send + Sync>;

/// A single entry of a build config's `input`.
#[derive(Clone)]
pub enum BuildConfigInput {
    /// An explicit source id. It must exist when the graph is first built.
    Path(Utf8PathBuf),
    /// Every source id matching the predicate is an input.
    Filter(InputFilter),
}

impl BuildConfigInput {
    pub fn path(id: impl Into<Utf8PathBuf>) -> Self {
        BuildConfigInput::Path(id.into())
    }

    pub fn filter<F>(filter: F) -> Self
    where
        F: Fn(&Utf8Path) -> bool + Send + Sync + 'static,
    {
        BuildConfigInput::Filter(Arc::new(filter))
    }

    /// Compiles a glob pattern into a filter matched against absolute ids.
    pub fn glob(pattern: &str) -> Result<Self, ConfigError> {
        let pattern = Pattern::new(pattern)?;
        Ok(Self::filter(move |id| pattern.matches(id.as_str())))
    }

    pub fn matches(&self, id: &Utf8Path) -> bool {
        match self {
            BuildConfigInput::Path(path) => path.as_path() == id,
            BuildConfigInput::Filter(filter) => filter(id),
        }
    }
}

impl Debug for BuildConfigInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildConfigInput::Path(path) => write!(f, "Path({path})"),
            BuildConfigInput::Filter(_) => write!(f, "Filter(*)"),
        }
    }
}

/// A named, immutable compilation target.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub name: String,
    pub platform: Platform,
    pub input: Vec<BuildConfigInput>,
}

impl BuildConfig {
    pub fn new(name: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            platform,
            input: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: BuildConfigInput) -> Self {
        self.input.push(input);
        self
    }

    /// Whether `id` is explicitly declared an input to this config.
    pub fn is_input(&self, id: &Utf8Path) -> bool {
        self.input.iter().any(|input| input.matches(id))
    }

    pub fn is_system(&self) -> bool {
        self.name == SYSTEM_BUILD_CONFIG_NAME
    }

    fn system(source_root: &Utf8Path) -> Result<Self, ConfigError> {
        let pattern = source_root.join("**").join("*.task.*");
        Ok(BuildConfig::new(SYSTEM_BUILD_CONFIG_NAME, Platform::Node)
            .with_input(BuildConfigInput::glob(pattern.as_str())?))
    }

    fn config(source_root: &Utf8Path) -> Self {
        // A filter instead of a path: the config file is optional.
        let config_file = source_root.join(CONFIG_FILE_NAME);
        BuildConfig::new(CONFIG_BUILD_CONFIG_NAME, Platform::Node)
            .with_input(BuildConfigInput::filter(move |id| id == config_file.as_path()))
    }
}

/// Declarative form of a [`BuildConfig`], e.g. from a JSON config file.
///
/// `input` accepts a single string or a list. Strings containing glob
/// metacharacters become filters, everything else is an explicit path.
/// Relative entries are resolved against the root.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildConfigPartial {
    pub name: String,
    pub platform: Platform,
    #[serde(default)]
    pub input: OneOrMany<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

impl BuildConfigPartial {
    pub fn normalize(self, root: &Utf8Path) -> Result<BuildConfig, ConfigError> {
        let mut config = BuildConfig::new(self.name, self.platform);

        for entry in self.input.into_vec() {
            let path = Utf8Path::new(&entry);
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            };

            let input = if entry.contains(['*', '?', '[']) {
                BuildConfigInput::glob(absolute.as_str())?
            } else {
                BuildConfigInput::Path(crate::paths::normalize_path(&absolute))
            };

            config.input.push(input);
        }

        Ok(config)
    }
}

/// The validated, fixed list of build configs of one filer.
#[derive(Debug, Clone, Default)]
pub struct BuildConfigs {
    configs: Vec<Arc<BuildConfig>>,
}

impl BuildConfigs {
    /// Validates the user-provided list and adds the reserved configs if
    /// they are missing.
    ///
    /// An empty list is only allowed when there is nothing to build.
    pub fn new(
        configs: Vec<BuildConfig>,
        source_root: &Utf8Path,
        has_source_dirs: bool,
    ) -> Result<Self, ConfigError> {
        if !has_source_dirs {
            return Ok(Self::default());
        }

        if configs.is_empty() {
            return Err(ConfigError::NoBuildConfigs);
        }

        let mut names = HashSet::new();
        for config in &configs {
            if config.name.is_empty() {
                return Err(ConfigError::EmptyBuildConfigName);
            }
            if !names.insert(config.name.clone()) {
                return Err(ConfigError::DuplicateBuildConfig(config.name.clone()));
            }
        }

        let mut configs: Vec<Arc<BuildConfig>> = configs.into_iter().map(Arc::new).collect();

        if !names.contains(SYSTEM_BUILD_CONFIG_NAME) {
            configs.insert(0, Arc::new(BuildConfig::system(source_root)?));
        }
        if !names.contains(CONFIG_BUILD_CONFIG_NAME) {
            configs.insert(0, Arc::new(BuildConfig::config(source_root)));
        }

        Ok(Self { configs })
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<BuildConfig>> {
        self.configs.iter().find(|config| config.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BuildConfig>> {
        self.configs.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.configs.iter().map(|config| config.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Configs for which `id` is an explicit input.
    pub fn inputs_for<'a>(&'a self, id: &'a Utf8Path) -> impl Iterator<Item = &'a Arc<BuildConfig>> {
        self.configs.iter().filter(move |config| config.is_input(id))
    }
}

impl<'a> IntoIterator for &'a BuildConfigs {
    type Item = &'a Arc<BuildConfig>;
    type IntoIter = std::slice::Iter<'a, Arc<BuildConfig>>;

    fn into_iter(self) -> Self::IntoIter {
        self.configs.iter()
    }
}
