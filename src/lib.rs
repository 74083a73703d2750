#![forbid(unsafe_code)]
//! An incremental build graph for a set of watched source directories.
//!
//! The [`Filer`] keeps every source file in memory, hands buildable ones to a
//! [`Builder`] once per build config they belong to, and writes the results
//! under `<root>/.filer`. Dependencies reported by the builder decide which
//! other files join a build config. A small metadata record per source file
//! lets the next run skip files whose content didn't change.
//!
//! ```no_run
//! # use filer::{BuildConfig, BuildConfigInput, FilerOptions, NoopBuilder, Platform};
//! # async fn run() -> Result<(), filer::FilerError> {
//! let filer = FilerOptions::new("/project")
//!     .source_dir("src")
//!     .builder(NoopBuilder)
//!     .build_config(
//!         BuildConfig::new("node", Platform::Node)
//!             .with_input(BuildConfigInput::glob("/project/src/**/*.ts")?),
//!     )
//!     .build()?;
//!
//! filer.init().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod content;
mod dir;
mod error;
mod filer;
mod hash;
mod log;
mod meta;
mod paths;
mod source;
mod sync;

pub use crate::builder::{
    BuildContext, BuildResult, Builder, ExtensionBuilder, MapDependencyToSourceId, NoopBuilder,
    default_map_dependency_to_source_id,
};
pub use crate::config::{BuildConfig, BuildConfigInput, BuildConfigPartial, BuildConfigs, Platform};
pub use crate::content::{Content, Encoding, PathStats};
pub use crate::dir::{DirChange, DirChangeKind, DirId, DirKind, FilerDir, PathFilter};
pub use crate::error::*;
pub use crate::filer::{BuildEvent, Filer, FilerOptions};
pub use crate::hash::Hash32;
pub use crate::log::as_overhead;
#[cfg(feature = "logging")]
pub use crate::log::init_logging;
pub use crate::meta::{SourceMetaBuild, SourceMetaData};
pub use crate::paths::Paths;
pub use crate::source::{BuildDependency, BuildFile, BuildName, BuildSource, SourceFile};
