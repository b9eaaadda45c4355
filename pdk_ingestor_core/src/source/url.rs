//! Sources reading a list of locators.
//!
//! Locators are `http://` or `https://` URLs, `file://` URLs or plain paths.
//! They are fetched with bounded concurrency; each body becomes one frame.
//! A streamed body holds its fetch slot until it is read to the end or
//! dropped, so no more than `concurrency` bodies are open at any time.
use std::{io, path::Path, sync::Arc};

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use snafu::ResultExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    error::{ConfigError, HttpSnafu, InvalidOptionSnafu, IoSnafu, SourceError, StatusSnafu},
    metrics::PipelineMetrics,
    retry::RetryPolicy,
    source::{Frame, Origin, Payload},
};

const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Locators fetched in parallel, and bodies open at once.
    pub concurrency: usize,
    /// Read each body completely before decoding it.
    pub use_read_all: bool,
    /// Fail the run if a locator cannot be fetched.
    pub require_all: bool,
    pub retry: RetryPolicy,
}

pub struct UrlSource {
    frames: BoxStream<'static, Result<Frame, SourceError>>,
    require_all: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            use_read_all: false,
            require_all: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl FetchOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return InvalidOptionSnafu {
                name: "fetch-concurrency",
                message: "must be greater than 0",
            }
            .fail();
        }
        Ok(())
    }
}

impl UrlSource {
    pub fn new(locators: Vec<String>, options: FetchOptions) -> Self {
        Self::with_client(reqwest::Client::new(), locators, options)
    }

    pub fn with_client(
        client: reqwest::Client,
        locators: Vec<String>,
        options: FetchOptions,
    ) -> Self {
        let FetchOptions {
            concurrency,
            use_read_all,
            require_all,
            retry,
        } = options;

        let concurrency = concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));

        let frames = futures::stream::iter(locators)
            .map(move |locator| {
                let client = client.clone();
                let slots = slots.clone();
                async move {
                    let slot = match slots.acquire_owned().await {
                        Ok(slot) => slot,
                        Err(err) => {
                            return Err(SourceError::Io {
                                locator,
                                source: io::Error::other(err),
                            });
                        }
                    };
                    let mut frame = fetch_with_retry(&client, locator, use_read_all, retry).await?;
                    frame.payload = hold_slot(frame.payload, slot);
                    Ok(frame)
                }
            })
            .buffer_unordered(concurrency)
            .boxed();

        Self {
            frames,
            require_all,
        }
    }

    /// Returns `true` if every locator must be fetched.
    pub fn require_all(&self) -> bool {
        self.require_all
    }

    /// Returns the next fetched frame.
    ///
    /// Locators that cannot be fetched are skipped, unless every locator is
    /// required.
    pub async fn next_frame(
        &mut self,
        metrics: &PipelineMetrics,
    ) -> Result<Option<Frame>, SourceError> {
        loop {
            match self.frames.next().await {
                None => return Ok(None),
                Some(Ok(frame)) => return Ok(Some(frame)),
                Some(Err(err)) => {
                    metrics.fetch_failures.incr();
                    if self.require_all {
                        return Err(err);
                    }
                    warn!(error = %err, "skipping locator that could not be fetched");
                }
            }
        }
    }
}

/// Parses a locator list: one locator per line, blank lines and `#` comments skipped.
pub fn parse_locators(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Reads a locator list from disk.
pub async fn read_locators(path: impl AsRef<Path>) -> Result<Vec<String>, SourceError> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await.context(IoSnafu {
        locator: path.display().to_string(),
    })?;
    Ok(parse_locators(&content))
}

/// Keeps `slot` taken while the body of a streamed payload is open.
fn hold_slot(payload: Payload, slot: OwnedSemaphorePermit) -> Payload {
    match payload {
        Payload::Stream(stream) => Payload::Stream(
            stream
                .map(move |chunk| {
                    let _slot = &slot;
                    chunk
                })
                .boxed(),
        ),
        bytes => bytes,
    }
}

async fn fetch_with_retry(
    client: &reqwest::Client,
    locator: String,
    use_read_all: bool,
    retry: RetryPolicy,
) -> Result<Frame, SourceError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match fetch(client, &locator, use_read_all).await {
            Ok(payload) => {
                debug!(%locator, attempts, "fetched locator");
                return Ok(Frame {
                    origin: Origin::Locator(locator),
                    payload,
                    ack: None,
                });
            }
            Err(err) if err.is_retryable() && retry.should_retry(attempts) => {
                let delay = retry.backoff(attempts);
                debug!(%locator, attempts, error = %err, ?delay, "retrying fetch");
                tokio::time::sleep(delay).await;
            }
            Err(err) if attempts > 1 => {
                return Err(SourceError::Exhausted {
                    locator,
                    attempts,
                    source: Box::new(err),
                });
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fetch(
    client: &reqwest::Client,
    locator: &str,
    use_read_all: bool,
) -> Result<Payload, SourceError> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        let response = client
            .get(locator)
            .send()
            .await
            .context(HttpSnafu { locator })?;

        let status = response.status();
        if !status.is_success() {
            return StatusSnafu { locator, status }.fail();
        }

        if use_read_all {
            let body = response.bytes().await.context(HttpSnafu { locator })?;
            return Ok(Payload::Bytes(body));
        }

        let stream = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        return Ok(Payload::Stream(stream.boxed()));
    }

    let path = locator.strip_prefix(FILE_SCHEME).unwrap_or(locator);
    if use_read_all {
        let body = tokio::fs::read(path).await.context(IoSnafu { locator })?;
        return Ok(Payload::Bytes(Bytes::from(body)));
    }

    let file = tokio::fs::File::open(path)
        .await
        .context(IoSnafu { locator })?;
    Ok(Payload::Stream(ReaderStream::new(file).boxed()))
}
