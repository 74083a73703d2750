//! Disk layout owned by the filer.
//!
//! ```text
//! <root>/.filer/dev/<build config>/<path relative to root, output extension>
//! <root>/.filer/dev_meta/<path relative to root>.json
//! ```
//!
//! `prod` replaces `dev` for production builds.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::hash::Hash32;

/// Name of the directory created under the project root.
pub const FILER_DIR: &str = ".filer";

const META_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Project root, absolute.
    pub root: Utf8PathBuf,
    /// Directory holding every build and metadata tree.
    pub build_dir: Utf8PathBuf,
    pub dev: bool,
}

impl Paths {
    pub fn new(root: impl Into<Utf8PathBuf>, build_dir: Option<Utf8PathBuf>, dev: bool) -> Self {
        let root = normalize_path(&root.into());
        let build_dir = match build_dir {
            Some(dir) if dir.is_absolute() => normalize_path(&dir),
            Some(dir) => normalize_path(&root.join(dir)),
            None => root.join(FILER_DIR),
        };

        Self {
            root,
            build_dir,
            dev,
        }
    }

    fn mode(&self) -> &'static str {
        if self.dev { "dev" } else { "prod" }
    }

    /// `<build_dir>/<dev|prod>`
    pub fn build_root(&self) -> Utf8PathBuf {
        self.build_dir.join(self.mode())
    }

    /// `<build_dir>/<dev|prod>/<config>`
    pub fn build_out_dir(&self, config_name: &str) -> Utf8PathBuf {
        self.build_root().join(config_name)
    }

    /// Maps a path relative to the root into the output tree of a config.
    pub fn to_build_out_path(&self, config_name: &str, base_path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.build_out_dir(config_name).join(base_path)
    }

    /// Output path of a source id with its extension swapped.
    pub fn to_build_out_id(&self, config_name: &str, source_id: &Utf8Path, extension: &str) -> Utf8PathBuf {
        let relative = self.to_base_path(source_id);
        let mut out = self.to_build_out_path(config_name, relative);
        if !extension.is_empty() {
            out.set_extension(extension);
        }
        out
    }

    /// `<build_dir>/<dev|prod>_meta`
    pub fn source_meta_dir(&self) -> Utf8PathBuf {
        self.build_dir.join(format!("{}_meta", self.mode()))
    }

    /// Where the metadata sidecar of a source file lives.
    ///
    /// Sources outside the root are keyed by the hash of their id.
    pub fn to_source_meta_path(&self, source_id: &Utf8Path) -> Utf8PathBuf {
        let dir = self.source_meta_dir();
        match source_id.strip_prefix(&self.root) {
            Ok(relative) => {
                let mut file = relative.as_str().to_string();
                file.push('.');
                file.push_str(META_EXTENSION);
                dir.join(file)
            }
            Err(_) => dir
                .join("_external")
                .join(Hash32::hash(source_id.as_str()).to_hex())
                .with_extension(META_EXTENSION),
        }
    }

    /// Path of `id` relative to the root, or the id itself if it's outside.
    pub fn to_base_path<'a>(&self, id: &'a Utf8Path) -> &'a Utf8Path {
        id.strip_prefix(&self.root).unwrap_or(id)
    }

    /// Path of a build output relative to the output dir of its config,
    /// together with the config name.
    pub fn split_build_id<'a>(&self, build_id: &'a Utf8Path) -> Option<(&'a str, &'a Utf8Path)> {
        let rest = build_id.strip_prefix(self.build_root()).ok()?;
        let mut components = rest.components();
        let config = match components.next()? {
            Utf8Component::Normal(name) => name,
            _ => return None,
        };
        Some((config, components.as_path()))
    }
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => {}
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}
