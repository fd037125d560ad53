use std::time::Duration;

use quick_xml::events::{BytesText, Event};
use quick_xml::reader::Reader;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

/// Sent as `User-Agent` on every feed request.
pub const USER_AGENT: &str = "gator";

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("server responded with {status}")]
    Http { status: StatusCode },
    #[error("malformed feed XML: {0}")]
    MalformedXml(String),
}

impl From<quick_xml::Error> for FetchError {
    fn from(err: quick_xml::Error) -> Self {
        FetchError::MalformedXml(err.to_string())
    }
}

/// One fetched feed, with text already unescaped. Never stored as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFeed {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<RawItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
}

pub struct Fetcher {
    client: Client,
    deadline: Duration,
    strict_status: bool,
}

impl Fetcher {
    pub fn new(deadline: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            deadline,
            strict_status: false,
        })
    }

    /// Reject non-success responses before looking at the body.
    ///
    /// Off by default: some feeds answer with an error status and a perfectly
    /// good document, and those keep working unless this is switched on.
    pub fn strict_status(mut self, strict: bool) -> Self {
        self.strict_status = strict;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn fetch(&self, url: &str) -> Result<RawFeed, FetchError> {
        self.fetch_with_deadline(url, self.deadline).await
    }

    pub async fn fetch_with_deadline(
        &self,
        url: &str,
        deadline: Duration,
    ) -> Result<RawFeed, FetchError> {
        debug!(url, ?deadline, "fetching feed");

        let response = self
            .client
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            if self.strict_status {
                return Err(FetchError::Http { status });
            }
            warn!(url, %status, "feed answered with an error status, parsing body anyway");
        }

        let body = response.text().await.map_err(FetchError::Transport)?;

        match parse_feed(&body) {
            Ok(feed) => Ok(feed),
            // A broken body behind an error status is the status's fault.
            Err(FetchError::MalformedXml(_)) if !status.is_success() => {
                Err(FetchError::Http { status })
            }
            Err(err) => Err(err),
        }
    }
}

/// Decode an RSS document and unescape the HTML entities producers like to
/// double-encode in titles and descriptions.
///
/// Only the unprefixed `title`, `link`, `description` and `pubDate` elements
/// directly under `<rss><channel>` or `<item>` are read. Namespaced
/// look-alikes such as `<atom:link>` or `<itunes:title>` are ignored, and
/// markup nested inside a field contributes only its text. When a field
/// repeats, its first non-empty value wins.
pub fn parse_feed(xml: &str) -> Result<RawFeed, FetchError> {
    let mut reader = Reader::from_str(xml);

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut channel: Option<Texts> = None;
    let mut item: Option<Texts> = None;
    let mut items = Vec::new();
    // Field being read, with the depth its element opened at
    let mut reading: Option<(Field, usize, String)> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if reading.is_none() {
                    if at(&path, &[b"rss"]) && name == b"channel" {
                        channel = Some(Texts::default());
                    } else if at(&path, &[b"rss", b"channel"]) && name == b"item" {
                        item = Some(Texts::default());
                    } else if at(&path, &[b"rss", b"channel"]) {
                        reading = Field::from_name(&name, false)
                            .map(|field| (field, path.len(), String::new()));
                    } else if at(&path, &[b"rss", b"channel", b"item"]) {
                        reading = Field::from_name(&name, true)
                            .map(|field| (field, path.len(), String::new()));
                    }
                }
                path.push(name);
            }
            Event::End(_) => {
                let closed = path.pop();
                match reading.take() {
                    Some((field, depth, text)) if depth == path.len() => {
                        let target = if depth == 3 { item.as_mut() } else { channel.as_mut() };
                        if let Some(texts) = target {
                            texts.push(field, text);
                        }
                    }
                    still_reading => reading = still_reading,
                }
                if at(&path, &[b"rss", b"channel"]) && closed.as_deref() == Some(b"item".as_slice()) {
                    if let Some(texts) = item.take() {
                        items.push(texts.into_item());
                    }
                }
            }
            Event::Text(e) => {
                if let Some((_, _, text)) = reading.as_mut() {
                    text.push_str(&decode_text(&e));
                }
            }
            Event::CData(e) => {
                if let Some((_, _, text)) = reading.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => {
                if !path.is_empty() {
                    return Err(FetchError::MalformedXml(
                        "document ends inside an open element".to_string(),
                    ));
                }
                break;
            }
            _ => {}
        }
    }

    let channel = channel.ok_or_else(|| {
        FetchError::MalformedXml("missing <rss><channel> element".to_string())
    })?;

    Ok(RawFeed {
        title: unescape(first_text(channel.title)),
        link: first_text(channel.link),
        description: unescape(first_text(channel.description)),
        items,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Description,
    PubDate,
}

impl Field {
    /// Matches the full element name, prefix included.
    fn from_name(name: &[u8], in_item: bool) -> Option<Self> {
        match name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"description" => Some(Field::Description),
            b"pubDate" if in_item => Some(Field::PubDate),
            _ => None,
        }
    }
}

/// Text collected for one channel or item, every occurrence of each field.
#[derive(Debug, Default)]
struct Texts {
    title: Vec<String>,
    link: Vec<String>,
    description: Vec<String>,
    pub_date: Vec<String>,
}

impl Texts {
    fn push(&mut self, field: Field, text: String) {
        match field {
            Field::Title => self.title.push(text),
            Field::Link => self.link.push(text),
            Field::Description => self.description.push(text),
            Field::PubDate => self.pub_date.push(text),
        }
    }

    fn into_item(self) -> RawItem {
        RawItem {
            title: unescape(first_text(self.title)),
            link: first_text(self.link),
            description: unescape(first_text(self.description)),
            pub_date: first_text(self.pub_date),
        }
    }
}

fn at(path: &[Vec<u8>], expected: &[&[u8]]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(name, want)| name == want)
}

fn decode_text(text: &BytesText) -> String {
    match text.unescape() {
        Ok(decoded) => decoded.into_owned(),
        // Not an XML entity (`&nbsp;`, `&eacute;`); html-escape deals with it
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

fn first_text(values: Vec<String>) -> String {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

fn unescape(text: String) -> String {
    html_escape::decode_html_entities(&text).into_owned()
}
