use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as BuilderError;

/// Problems with the options passed to [`FilerOptions`](crate::FilerOptions).
///
/// These are operator mistakes; the filer refuses to start until they are
/// fixed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No build configs were provided but there are source dirs to build")]
    NoBuildConfigs,

    #[error("A builder is required when there are source dirs to build")]
    MissingBuilder,

    #[error("Served-only mode cannot be combined with a builder or build configs")]
    ServedWithBuild,

    #[error("Duplicate build config name '{0}'")]
    DuplicateBuildConfig(String),

    #[error("Build config name must not be empty")]
    EmptyBuildConfigName,

    #[error("Watched dir {0} is nested inside watched dir {1}")]
    NestedDirs(Utf8PathBuf, Utf8PathBuf),

    #[error("Watched dir {0} is listed more than once")]
    DuplicateDir(Utf8PathBuf),

    #[error("Couldn't resolve dir {0}:\n{1}")]
    ResolveDir(Utf8PathBuf, std::io::Error),

    #[error("Couldn't compile input pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Error)]
pub enum FilerError {
    #[error(transparent)]
    Shared(#[from] Arc<FilerError>),

    #[error("Invalid filer options:\n{0}")]
    Config(#[from] ConfigError),

    /// The engine found its own state in a shape it never produces. Seeing
    /// this means a logic bug or a collaborator breaking its contract.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Missing input for build config '{0}': {1}")]
    MissingInput(String, Utf8PathBuf),

    #[error("Source file {0} was observed under two watched dirs: {1} and {2}")]
    AmbiguousSource(Utf8PathBuf, Utf8PathBuf, Utf8PathBuf),

    #[error("I/O error at {0}:\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Couldn't serialize source meta for {0}:\n{1}")]
    Json(Utf8PathBuf, serde_json::Error),

    #[error("Builder '{0}' failed to initialize:\n{1}")]
    BuilderInit(String, BuilderError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

impl FilerError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        FilerError::Invariant(message.into())
    }

    pub(crate) fn io(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        FilerError::Io(path.into(), err)
    }
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error("Watcher for {0} is already running")]
    AlreadyWatching(Utf8PathBuf),
}

pub type Result<T, E = FilerError> = std::result::Result<T, E>;
