use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    entry::{classify, Action, Entry, RawUrlMode, RunConfig, SkipReason},
    fetch::{Fetch, FetchError, RateLimitPolicy, RemoteClient},
    listing_parsing::{parse_listing, parse_raw_blob_url, ListingError},
};

/// Scheme, host, repository and revision part of the permalink. Its path
/// always ends in `/`.
///
/// Entry paths from listings are relative to this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin(Url);

impl Origin {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Browse url of a repository-relative path. Each segment is percent-encoded.
    pub fn join(&self, relative: &str) -> Url {
        let mut url = self.0.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(relative.split('/').filter(|s| !s.is_empty()));
        }
        url
    }

    /// Raw content url of a repository-relative path, for origins of the form
    /// `<repo>/tree/<rev>/`.
    pub fn raw_url(&self, relative: &str) -> Option<Url> {
        let segments: Vec<&str> = self.0.path_segments()?.filter(|s| !s.is_empty()).collect();
        let (rev, head) = segments.split_last()?;
        let (tree, repo) = head.split_last()?;
        if *tree != "tree" || repo.is_empty() {
            return None;
        }

        // segments are still encoded, `set_path` keeps them as they are
        let mut base = self.0.clone();
        base.set_path(&format!("/{}/raw/{rev}/", repo.join("/")));
        Some(Origin(base).join(relative))
    }

    /// Resolves a link found in page metadata, which may be relative to the host.
    pub fn resolve(&self, link: &str) -> Result<Url, url::ParseError> {
        self.0.join(link)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips the subtree path off the permalink.
///
/// The path must appear in the permalink as whole segments, either as given or
/// percent-encoded. The last such occurrence is used and anything after it,
/// like a query string, is dropped.
pub fn derive_origin(permalink: &str, subtree_path: &str) -> Result<Origin> {
    let mut url =
        Url::parse(permalink).with_context(|| format!("Invalid permalink {permalink}"))?;
    if url.cannot_be_a_base() {
        bail!("Permalink {permalink} is not a hierarchical url");
    }
    url.set_query(None);
    url.set_fragment(None);

    let path: Vec<String> = non_empty_segments(&url);
    let wanted: Vec<&str> = subtree_path.split('/').filter(|s| !s.is_empty()).collect();

    let mut scratch = url.clone();
    if let Ok(mut segments) = scratch.path_segments_mut() {
        segments.clear().extend(&wanted);
    }
    let encoded = non_empty_segments(&scratch);
    let as_given: Vec<String> = wanted.iter().map(|s| s.to_string()).collect();

    let start = find_last(&path, &encoded)
        .or_else(|| find_last(&path, &as_given))
        .with_context(|| {
            format!("Permalink {permalink} does not contain the path {subtree_path}")
        })?;

    if start == 0 {
        url.set_path("/");
    } else {
        url.set_path(&format!("/{}/", path[..start].join("/")));
    }
    Ok(Origin(url))
}

fn non_empty_segments(url: &Url) -> Vec<String> {
    url.path_segments()
        .map(|segments| {
            segments
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn find_last(haystack: &[String], needle: &[String]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Creates the destination if needed. An existing non-directory is an error.
pub fn prepare_destination(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => bail!("Download destination {} is not a directory", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => std::fs::create_dir_all(path)
            .with_context(|| {
                format!(
                    "Error while trying to create directory {}",
                    path.to_string_lossy()
                )
            }),
        Err(e) => Err(e).with_context(|| format!("Failed to inspect {}", path.display())),
    }
}

#[derive(Debug, Error)]
enum DumpError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed page at {url}")]
    Malformed {
        url: Url,
        #[source]
        source: ListingError,
    },
    #[error("invalid raw url {link:?} on page {url}")]
    InvalidLink {
        url: Url,
        link: String,
        #[source]
        source: url::ParseError,
    },
    #[error("error while trying to write {} to disk", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shared by every task of a run.
struct TreeContext<F> {
    client: RemoteClient<F>,
    origin: Origin,
    config: RunConfig,
}

impl<F: Fetch> TreeContext<F> {
    /// A rate limit under the abort policy is the only failure that stops the run.
    fn is_fatal(&self, err: &DumpError) -> bool {
        matches!(err, DumpError::Fetch(FetchError::RateLimited { .. }))
            && self.client.policy() == RateLimitPolicy::Abort
    }

    async fn list_folder(&self, url: &Url) -> Result<Vec<Entry>, DumpError> {
        let page = self.client.fetch_with_retry(url.as_str()).await?;
        parse_listing(&page).map_err(|source| DumpError::Malformed {
            url: url.clone(),
            source,
        })
    }

    async fn raw_url(&self, relative: &str) -> Result<Url, DumpError> {
        if self.config.raw_url_mode == RawUrlMode::Rewrite {
            if let Some(url) = self.origin.raw_url(relative) {
                return Ok(url);
            }
        }

        let url = self.origin.join(relative);
        let page = self.client.fetch_with_retry(url.as_str()).await?;
        let link = parse_raw_blob_url(&page).map_err(|source| DumpError::Malformed {
            url: url.clone(),
            source,
        })?;
        self.origin
            .resolve(&link)
            .map_err(|source| DumpError::InvalidLink { url, link, source })
    }

    /// The destination is only written once the whole body is in memory.
    async fn materialize(&self, relative: &str, dest: &Path) -> Result<usize, DumpError> {
        let raw_url = self.raw_url(relative).await?;
        let bytes = self.client.fetch_with_retry(raw_url.as_str()).await?;

        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|source| DumpError::Write {
                path: dest.to_path_buf(),
                source,
            })?;
        Ok(bytes.len())
    }

    async fn download_file(&self, relative: String, dest: PathBuf) -> Result<()> {
        match self.materialize(&relative, &dest).await {
            Ok(size) => {
                info!(path = %relative, bytes = size, "Downloaded file");
                Ok(())
            }
            Err(e) if self.is_fatal(&e) => {
                Err(e).with_context(|| format!("Aborting while downloading {relative}"))
            }
            Err(e) => {
                log_failure("file", &relative, &e);
                Ok(())
            }
        }
    }
}

fn log_failure(what: &str, path: &str, err: &DumpError) {
    match err {
        DumpError::Fetch(FetchError::NotFound { status, .. }) => {
            warn!(path, status, "Skipping {what}, not found");
        }
        DumpError::Fetch(FetchError::RateLimited { .. }) => {
            warn!(path, "Skipping {what}, still rate limited after retry");
        }
        DumpError::Malformed { .. } | DumpError::InvalidLink { .. } => {
            warn!(path, error = %error_chain(err), "Skipping {what}, could not parse page");
        }
        DumpError::Fetch(FetchError::Transport { .. }) | DumpError::Write { .. } => {
            error!(path, error = %error_chain(err), "Failed to download {what}");
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// Mirrors one folder into `local_dir`.
///
/// Resolves once every task spawned for this folder has finished. Failures are
/// logged and contained here, except at the root and for fatal errors, which
/// are returned. Returning early drops the join set, aborting the siblings.
fn visit<F: Fetch + 'static>(
    ctx: Arc<TreeContext<F>>,
    folder: String,
    local_dir: PathBuf,
    depth: usize,
) -> BoxFuture<'static, Result<()>> {
    async move {
        let url = ctx.origin.join(&folder);
        let entries = match ctx.list_folder(&url).await {
            Ok(entries) => entries,
            Err(e) if depth == 0 => {
                return Err(e).with_context(|| format!("Failed to list root folder {url}"));
            }
            Err(e) if ctx.is_fatal(&e) => {
                return Err(e).with_context(|| format!("Aborting while listing {folder}"));
            }
            Err(e) => {
                log_failure("folder", &folder, &e);
                return Ok(());
            }
        };

        debug!(path = %folder, entries = entries.len(), depth, "Listed folder");

        let mut tasks = JoinSet::new();
        for entry in entries {
            match classify(&entry, &ctx.config) {
                Action::Descend => {
                    let child_dir = local_dir.join(&entry.display_name);
                    if let Err(e) = tokio::fs::create_dir_all(&child_dir).await {
                        error!(
                            path = %child_dir.display(),
                            error = %e,
                            "Failed to create directory"
                        );
                        continue;
                    }
                    tasks.spawn(visit(
                        Arc::clone(&ctx),
                        entry.relative_path,
                        child_dir,
                        depth + 1,
                    ));
                }
                Action::Download => {
                    let ctx = Arc::clone(&ctx);
                    let dest = local_dir.join(&entry.display_name);
                    tasks.spawn(async move { ctx.download_file(entry.relative_path, dest).await });
                }
                Action::Skip(reason @ (SkipReason::UnknownKind | SkipReason::UnsafeName)) => {
                    warn!(
                        path = %entry.relative_path,
                        name = %entry.display_name,
                        kind = %entry.content_type,
                        "Skipping entry: {reason}"
                    );
                }
                Action::Skip(reason) => {
                    debug!(path = %entry.relative_path, "Skipping entry: {reason}");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => error!(path = %folder, error = %e, "Task did not complete"),
            }
        }

        Ok(())
    }
    .boxed()
}

/// Mirrors `subtree_path` below `origin` into the configured destination.
pub async fn download_all<F: Fetch + 'static>(
    transport: F,
    origin: Origin,
    subtree_path: &str,
    config: RunConfig,
) -> Result<()> {
    prepare_destination(&config.destination)?;

    let client = RemoteClient::new(transport, config.max_concurrency, config.rate_limit_policy);
    let root_dir = config.destination.clone();
    let ctx = Arc::new(TreeContext {
        client,
        origin,
        config,
    });

    visit(ctx, subtree_path.trim_matches('/').to_string(), root_dir, 0).await
}
