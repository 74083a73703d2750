//! Loading file content with the right encoding and comparing it for change
//! detection.

use std::sync::Arc;
use std::time::SystemTime;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::hash::Hash32;

/// How the bytes of a file are held in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Text content (UTF-8).
    Utf8,
    /// Binary content (raw bytes).
    Binary,
}

/// Extensions that are never decoded as text.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "avif", "ico", "bmp", "tif", "tiff", "woff", "woff2",
    "ttf", "otf", "eot", "mp3", "mp4", "wav", "ogg", "webm", "flac", "pdf", "zip", "gz", "tgz",
    "br", "wasm", "bin",
];

/// Guesses the encoding of a file from its extension (without the dot).
pub fn infer_encoding(extension: &str) -> Encoding {
    let extension = extension.to_ascii_lowercase();
    if BINARY_EXTENSIONS.contains(&extension.as_str()) {
        Encoding::Binary
    } else {
        Encoding::Utf8
    }
}

/// The content of a source or build file.
///
/// Cloning is cheap, the underlying buffer is shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Content {
    Utf8(Arc<str>),
    Binary(Arc<[u8]>),
}

impl Content {
    pub fn encoding(&self) -> Encoding {
        match self {
            Content::Utf8(_) => Encoding::Utf8,
            Content::Binary(_) => Encoding::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Utf8(text) => text.as_bytes(),
            Content::Binary(bytes) => bytes,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Content::Utf8(text) => Some(text),
            Content::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hash(&self) -> Hash32 {
        Hash32::hash(self.as_bytes())
    }

    /// Byte-level equality against content read from somewhere else.
    pub fn same_bytes(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl AsRef<[u8]> for Content {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Utf8(value.into())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Utf8(value.into())
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content::Binary(value.into())
    }
}

impl std::fmt::Debug for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Utf8(text) => write!(f, "Utf8({} bytes)", text.len()),
            Content::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
        }
    }
}

/// Reads a file with the given encoding.
pub async fn load_content(path: &Utf8Path, encoding: Encoding) -> std::io::Result<Content> {
    Ok(match encoding {
        Encoding::Utf8 => Content::Utf8(tokio::fs::read_to_string(path).await?.into()),
        Encoding::Binary => Content::Binary(tokio::fs::read(path).await?.into()),
    })
}

/// The subset of filesystem metadata the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStats {
    pub is_directory: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl From<&std::fs::Metadata> for PathStats {
    fn from(metadata: &std::fs::Metadata) -> Self {
        Self {
            is_directory: metadata.is_dir(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

impl PathStats {
    pub(crate) fn removed(is_directory: bool) -> Self {
        Self {
            is_directory,
            size: 0,
            modified: None,
        }
    }

    pub async fn load(path: &Utf8Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(PathStats::from(&metadata))
    }
}
