use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hyper::{client::HttpConnector, header, Body, Client, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use thiserror::Error;
use tokio::{sync::Semaphore, time::sleep};
use tracing::{debug, warn};
use url::Url;

const USER_AGENT: &str = concat!("subtree-dumper/", env!("CARGO_PKG_VERSION"));

/// Raw blob links redirect to a separate content host, so a few hops are expected.
const MAX_REDIRECTS: usize = 5;

/// Used when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum FetchError {
    /// 404, or 403 which the host uses for resources we can't see.
    #[error("got {status} while trying to fetch {url}")]
    NotFound { url: String, status: u16 },

    #[error("rate limited while trying to fetch {url} (retry after {retry_after:?})")]
    RateLimited { url: String, retry_after: Duration },

    #[error("error while trying to fetch {url}")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },
}

impl FetchError {
    pub fn transport(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Transport {
            url: url.into(),
            source: source.into(),
        }
    }
}

/// What to do when the host answers with a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitPolicy {
    /// Sleep for the indicated delay and try the same request once more.
    #[default]
    RetryOnce,
    /// Give up immediately and stop the whole run.
    Abort,
}

/// A single GET against the remote host, returning the full body.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl<T: Fetch + ?Sized> Fetch for Arc<T> {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(url).await
    }
}

/// Production transport. One pooled client is shared by every request of the run.
pub struct HyperFetch {
    client: Client<HttpsConnector<HttpConnector>>,
}

impl HyperFetch {
    pub fn new() -> Self {
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());
        Self { client }
    }
}

impl Default for HyperFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetch for HyperFetch {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut current = Url::parse(url).map_err(|e| FetchError::transport(url, e))?;

        for _ in 0..=MAX_REDIRECTS {
            let uri: Uri = current
                .as_str()
                .parse()
                .map_err(|e| FetchError::transport(current.as_str(), e))?;
            let request = Request::get(uri)
                .header(header::ACCEPT, "application/json")
                .header(header::USER_AGENT, USER_AGENT)
                .body(Body::empty())
                .map_err(|e| FetchError::transport(current.as_str(), e))?;

            let resp = self
                .client
                .request(request)
                .await
                .map_err(|e| FetchError::transport(current.as_str(), e))?;

            let status = resp.status();
            if is_followed_redirect(status) {
                let location = resp
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        FetchError::transport(
                            current.as_str(),
                            format!("{status} without a location"),
                        )
                    })?;
                let next = redirect_target(&current, location)
                    .map_err(|e| FetchError::transport(current.as_str(), e))?;
                debug!(from = %current, to = %next, "Following redirect");
                current = next;
                continue;
            }

            return match status {
                StatusCode::OK => {
                    let bytes = hyper::body::to_bytes(resp.into_body())
                        .await
                        .map_err(|e| FetchError::transport(current.as_str(), e))?;
                    Ok(bytes.to_vec())
                }
                StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Err(FetchError::NotFound {
                    url: current.into(),
                    status: status.as_u16(),
                }),
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = parse_retry_after(
                        resp.headers()
                            .get(header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok()),
                    );
                    Err(FetchError::RateLimited {
                        url: current.into(),
                        retry_after,
                    })
                }
                _ => Err(FetchError::transport(
                    current.as_str(),
                    format!("status code is {status}"),
                )),
            };
        }

        Err(FetchError::transport(url, "too many redirects"))
    }
}

/// 300 and 304 carry no usable target, everything else is answered as is.
fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn redirect_target(current: &Url, location: &str) -> Result<Url, BoxError> {
    let next = current.join(location)?;
    match next.scheme() {
        "http" | "https" => Ok(next),
        scheme => Err(format!("refusing to follow redirect to a {scheme} url").into()),
    }
}

/// Only the delta-seconds form is understood, dates fall back to the default.
fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// The one gate every network call goes through.
///
/// Holds the transport together with a semaphore sized to the run's
/// concurrency cap. A single instance is shared by the whole traversal, so
/// the cap holds across every folder regardless of depth or fan-out.
pub struct RemoteClient<F> {
    transport: F,
    limiter: Arc<Semaphore>,
    policy: RateLimitPolicy,
}

impl<F: Fetch> RemoteClient<F> {
    pub fn new(transport: F, max_concurrency: usize, policy: RateLimitPolicy) -> Self {
        Self {
            transport,
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
            policy,
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Performs one request while holding a permit. The permit is released
    /// when this returns, whatever the outcome.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| FetchError::transport(url, e))?;
        self.transport.fetch(url).await
    }

    /// Like [`RemoteClient::fetch`], but a rate limited request is repeated
    /// exactly once after the server's delay when the policy allows it.
    pub async fn fetch_with_retry(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        match self.fetch(url).await {
            Err(FetchError::RateLimited { retry_after, .. })
                if self.policy == RateLimitPolicy::RetryOnce =>
            {
                warn!(url, ?retry_after, "Rate limited, retrying once");
                sleep(retry_after).await;
                self.fetch(url).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Answers with 429 for the first `limited` calls, then with `b"ok"`.
    struct Flaky {
        limited: usize,
        retry_after: Duration,
        calls: Mutex<usize>,
    }

    impl Flaky {
        fn new(limited: usize) -> Arc<Self> {
            Self::with_delay(limited, Duration::from_millis(5))
        }

        fn with_delay(limited: usize, retry_after: Duration) -> Arc<Self> {
            Arc::new(Self {
                limited,
                retry_after,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Fetch for Flaky {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.limited {
                Err(FetchError::RateLimited {
                    url: url.into(),
                    retry_after: self.retry_after,
                })
            } else {
                Ok(b"ok".to_vec())
            }
        }
    }

    #[tokio::test]
    async fn retries_once_after_rate_limit() {
        let stub = Flaky::new(1);
        let client = RemoteClient::new(stub.clone(), 1, RateLimitPolicy::RetryOnce);

        let body = client.fetch_with_retry("https://host.test/a").await.unwrap();
        assert_eq!(body, b"ok");
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_retry_after() {
        let retry_after = Duration::from_secs(30);
        let stub = Flaky::with_delay(1, retry_after);
        let client = RemoteClient::new(stub.clone(), 1, RateLimitPolicy::RetryOnce);

        let started = tokio::time::Instant::now();
        let body = client.fetch_with_retry("https://host.test/a").await.unwrap();

        assert_eq!(body, b"ok");
        assert!(started.elapsed() >= retry_after);
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_does_not_wait() {
        let stub = Flaky::with_delay(1, Duration::from_secs(30));
        let client = RemoteClient::new(stub, 1, RateLimitPolicy::Abort);

        let started = tokio::time::Instant::now();
        assert!(client.fetch_with_retry("https://host.test/a").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn gives_up_after_second_rate_limit() {
        let stub = Flaky::new(5);
        let client = RemoteClient::new(stub.clone(), 1, RateLimitPolicy::RetryOnce);

        let result = client.fetch_with_retry("https://host.test/a").await;
        assert!(matches!(result, Err(FetchError::RateLimited { .. })));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn abort_policy_does_not_retry() {
        let stub = Flaky::new(1);
        let client = RemoteClient::new(stub.clone(), 1, RateLimitPolicy::Abort);

        let result = client.fetch_with_retry("https://host.test/a").await;
        assert!(matches!(result, Err(FetchError::RateLimited { .. })));
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn permit_is_released_on_failure() {
        let stub = Flaky::new(3);
        let client = RemoteClient::new(stub.clone(), 1, RateLimitPolicy::Abort);

        for _ in 0..3 {
            assert!(client.fetch("https://host.test/a").await.is_err());
        }
        assert_eq!(client.fetch("https://host.test/a").await.unwrap(), b"ok");
    }

    #[test]
    fn retry_after_header() {
        assert_eq!(parse_retry_after(Some("12")), Duration::from_secs(12));
        assert_eq!(parse_retry_after(Some(" 3 ")), Duration::from_secs(3));
        assert_eq!(
            parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")),
            DEFAULT_RETRY_AFTER
        );
        assert_eq!(parse_retry_after(None), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn redirect_locations() {
        let base = Url::parse("https://github.com/o/r/raw/abc/a.py").unwrap();
        let target = |location: &str| redirect_target(&base, location).unwrap().to_string();

        assert_eq!(
            target("https://raw.example.com/o/r/abc/a.py"),
            "https://raw.example.com/o/r/abc/a.py"
        );
        assert_eq!(target("/o/r/blob/abc/a.py"), "https://github.com/o/r/blob/abc/a.py");
        assert_eq!(target("b.py"), "https://github.com/o/r/raw/abc/b.py");
        assert_eq!(target("//cdn.example.com/x"), "https://cdn.example.com/x");
        assert_eq!(target("../def/./a.py"), "https://github.com/o/r/raw/def/a.py");
        assert_eq!(target("/o/r/My%20Notes.md"), "https://github.com/o/r/My%20Notes.md");

        assert!(redirect_target(&base, "file:///etc/passwd").is_err());
        assert!(redirect_target(&base, "http://[::1").is_err());
    }

    #[test]
    fn followed_redirect_statuses() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_followed_redirect(StatusCode::from_u16(code).unwrap()), "{code}");
        }
        for code in [200, 300, 304, 404, 429] {
            assert!(!is_followed_redirect(StatusCode::from_u16(code).unwrap()), "{code}");
        }
    }
}
