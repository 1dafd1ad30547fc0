use std::{collections::HashSet, fmt, path::PathBuf};

use serde::Deserialize;

use crate::fetch::RateLimitPolicy;

pub const DEFAULT_MAX_CONCURRENCY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Directory,
    File,
    Submodule,
    SymlinkFile,
    SymlinkDirectory,
}

impl EntryKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "directory" => Some(Self::Directory),
            "file" => Some(Self::File),
            "submodule" => Some(Self::Submodule),
            "symlink_file" => Some(Self::SymlinkFile),
            "symlink_directory" => Some(Self::SymlinkDirectory),
            _ => None,
        }
    }
}

/// One child of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Entry {
    /// Path relative to the repository root, appended to the origin to build its url.
    #[serde(rename = "path")]
    pub relative_path: String,
    /// Name of the local file or directory to create.
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

impl Entry {
    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_tag(&self.content_type)
    }
}

/// How a file's raw content url is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawUrlMode {
    /// Fetch the file's page and read the raw url from its metadata.
    #[default]
    Metadata,
    /// Rewrite `/tree/<rev>/` to `/raw/<rev>/` without an extra request.
    Rewrite,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub destination: PathBuf,
    pub recursive: bool,
    /// When set, only files with one of these names are downloaded. Never filters directories.
    pub allow_list: Option<HashSet<String>>,
    pub follow_symlinks: bool,
    pub max_concurrency: usize,
    pub rate_limit_policy: RateLimitPolicy,
    pub raw_url_mode: RawUrlMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("."),
            recursive: true,
            allow_list: None,
            follow_symlinks: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            rate_limit_policy: RateLimitPolicy::default(),
            raw_url_mode: RawUrlMode::default(),
        }
    }
}

impl RunConfig {
    fn allows_file(&self, name: &str) -> bool {
        self.allow_list
            .as_ref()
            .map_or(true, |list| list.contains(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Descend,
    Download,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotRecursive,
    Submodule,
    SymlinksDisabled,
    NotInAllowList,
    UnknownKind,
    UnsafeName,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::NotRecursive => "recursion disabled",
            SkipReason::Submodule => "submodule",
            SkipReason::SymlinksDisabled => "symlinks not followed",
            SkipReason::NotInAllowList => "not in file list",
            SkipReason::UnknownKind => "unknown content type",
            SkipReason::UnsafeName => "unsafe name",
        };
        f.write_str(reason)
    }
}

pub fn classify(entry: &Entry, config: &RunConfig) -> Action {
    let Some(kind) = entry.kind() else {
        return Action::Skip(SkipReason::UnknownKind);
    };

    let action = match kind {
        EntryKind::Submodule => Action::Skip(SkipReason::Submodule),
        EntryKind::File if config.allows_file(&entry.display_name) => Action::Download,
        EntryKind::File => Action::Skip(SkipReason::NotInAllowList),
        _ if !config.recursive => Action::Skip(SkipReason::NotRecursive),
        EntryKind::Directory => Action::Descend,
        EntryKind::SymlinkFile | EntryKind::SymlinkDirectory if !config.follow_symlinks => {
            Action::Skip(SkipReason::SymlinksDisabled)
        }
        EntryKind::SymlinkDirectory => Action::Descend,
        EntryKind::SymlinkFile if config.allows_file(&entry.display_name) => Action::Download,
        EntryKind::SymlinkFile => Action::Skip(SkipReason::NotInAllowList),
    };

    if action != Action::Descend && action != Action::Download {
        return action;
    }

    // names become local path components, a listing must not escape the destination
    if is_unsafe_name(&entry.display_name) {
        return Action::Skip(SkipReason::UnsafeName);
    }

    action
}

fn is_unsafe_name(name: &str) -> bool {
    name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\'])
}
