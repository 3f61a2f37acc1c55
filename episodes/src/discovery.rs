//! This module provides episode discovery.

use std::sync::LazyLock;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

pub use reqwest::Client;

/// First page of the podcast archive.
pub const ARCHIVE_URL: &str = "https://www.zeit.de/serie/alles-gesagt";

static CONTAINER: LazyLock<Selector> = LazyLock::new(|| selector(".zon-teaser__container"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector(".zon-teaser__title"));
static AUDIO: LazyLock<Selector> = LazyLock::new(|| selector("audio"));
static PAGER: LazyLock<Selector> = LazyLock::new(|| selector("li.pager__page, li.pager__page--current"));
static LINK: LazyLock<Selector> = LazyLock::new(|| selector("a[href]"));

fn selector(selectors: &str) -> Selector {
    Selector::parse(selectors).expect("valid selector")
}

/// A discovery failure, which is fatal to the whole run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot fetch archive page: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid link in archive page: {0}")]
    Url(#[from] url::ParseError),
}

/// A remotely hosted episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    pub title: String,
    pub url: Url,
}

impl Episode {
    pub fn new(title: impl Into<String>, url: Url) -> Self {
        Self { title: title.into(), url }
    }
}

/// A source of episodes.
///
/// The returned stream is forward-only: it is lazily produced, ends when the source is exhausted and cannot be resumed
/// after an error, which is fatal.
pub trait Discover: Send + Sync {
    fn episodes(&self) -> BoxStream<'_, Result<Episode, Error>>;
}

impl Discover for Vec<Episode> {
    fn episodes(&self) -> BoxStream<'_, Result<Episode, Error>> {
        stream::iter(self.iter().cloned().map(Ok)).boxed()
    }
}

/// The paginated HTML archive of the podcast.
#[derive(Debug, Clone)]
pub struct Archive {
    client: Client,
    start: Url,
}

impl Archive {
    pub fn new(start: Url) -> Self {
        Self {
            client: Client::default(),
            start,
        }
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    async fn fetch(&self, url: Url) -> Result<Page, Error> {
        tracing::debug!("Fetching archive page `{url}`");

        let html = self.client.get(url.clone()).send().await?.error_for_status()?.text().await?;

        parse_page(&html, &url)
    }
}

impl Discover for Archive {
    fn episodes(&self) -> BoxStream<'_, Result<Episode, Error>> {
        stream::try_unfold(Some(self.start.clone()), move |next| async move {
            let Some(url) = next else {
                return Ok::<_, Error>(None);
            };

            let page = self.fetch(url).await?;

            Ok(Some((stream::iter(page.episodes.into_iter().map(Ok::<_, Error>)), page.next)))
        })
        .try_flatten()
        .boxed()
    }
}

/// One parsed archive page.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Page {
    pub episodes: Vec<Episode>,
    /// The following page, if any.
    pub next: Option<Url>,
}

/// Parse an archive page located at `base`, relative links being resolved against it.
///
/// Teasers without a title or an audio source are ignored. The ad-free audio source is preferred.
pub fn parse_page(html: &str, base: &Url) -> Result<Page, Error> {
    let document = Html::parse_document(html);
    let mut episodes = vec![];

    for container in document.select(&CONTAINER) {
        let title = container
            .select(&TITLE)
            .next()
            .map(|title| title.text().collect::<String>().trim().to_owned())
            .filter(|title| !title.is_empty());

        let source = container.select(&AUDIO).next().and_then(|audio| {
            let audio = audio.value();
            let non_empty = |src: &&str| !src.is_empty();
            audio.attr("data-src-adfree").filter(non_empty).or_else(|| audio.attr("src").filter(non_empty))
        });

        match (title, source) {
            (Some(title), Some(source)) => episodes.push(Episode::new(title, base.join(source)?)),
            _ => tracing::trace!("Skipping incomplete teaser in `{base}`"),
        }
    }

    let next = next_page(&document).map(|href| base.join(href)).transpose()?;

    Ok(Page { episodes, next })
}

/// Return the link of the pager entry following the current one.
fn next_page(document: &Html) -> Option<&str> {
    fn is_current(li: &ElementRef<'_>) -> bool {
        li.value().classes().any(|class| class == "pager__page--current")
    }

    document
        .select(&PAGER)
        .skip_while(|li| !is_current(li))
        .skip(1)
        .find(|li| !is_current(li))
        .and_then(|li| li.select(&LINK).next())
        .and_then(|a| a.value().attr("href"))
}
