use feed_rs::model::{Entry, Feed, FeedType, Link};
use feed_rs::parser;
use sha2::{Digest, Sha256};
use url::Url;

use super::fetcher::FetchError;
use crate::storage::{ContentBlock, Enclosure, Logo};
use crate::util::site_origin;

/// Subscriber-independent metadata describing a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedDescriptor {
    /// URL the document was fetched from.
    pub url: String,
    pub title: Option<String>,
    /// Canonical `scheme://host` of the site behind the feed.
    pub link: String,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    /// Format tag such as `rss20` or `atom10`.
    pub version: String,
    pub logo: Logo,
    pub updated: Option<i64>,
}

/// One feed item after normalization. `published` is always set.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    /// Stable identity of the remote item within its feed.
    pub entry_key: String,
    pub feed_url: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: i64,
    pub summary: Option<String>,
    pub content: Vec<ContentBlock>,
    pub enclosures: Vec<Enclosure>,
}

/// Irregularities the parser tolerates. They are logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseAnomaly {
    /// The HTTP charset disagrees with the document's XML declaration.
    EncodingOverride { declared: String, document: String },
    /// The server labelled the document with a non-XML media type.
    NonXmlContentType(String),
}

impl std::fmt::Display for ParseAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseAnomaly::EncodingOverride { declared, document } => write!(
                f,
                "document declared as {} but served as {}",
                document, declared
            ),
            ParseAnomaly::NonXmlContentType(ct) => write!(f, "non-XML content type {}", ct),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub descriptor: FeedDescriptor,
    /// Entries in document order.
    pub entries: Vec<NormalizedEntry>,
    pub anomalies: Vec<ParseAnomaly>,
}

impl ParsedFeed {
    /// Largest `published` value across all entries, if any.
    pub fn newest_published(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.published).max()
    }
}

/// Parse and normalize a fetched document.
///
/// `content_type` is the raw `Content-Type` header, used only to detect
/// survivable anomalies. `now` is the processing time assigned to entries that
/// carry neither a publish nor an update time.
///
/// # Errors
///
/// Returns [`FetchError::Parse`] when feed-rs rejects the document, which
/// includes documents without a recognizable RSS/Atom/JSON Feed root.
pub fn parse_feed(
    bytes: &[u8],
    fetched_url: &Url,
    content_type: Option<&str>,
    now: i64,
) -> Result<ParsedFeed, FetchError> {
    let anomalies = detect_anomalies(bytes, content_type);
    // Leave missing ids empty so normalization derives a deterministic key
    // instead of feed-rs falling back to a random UUID
    let feed = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)
        .map_err(|e| FetchError::Parse(e.to_string()))?;
    Ok(normalize(feed, fetched_url, now, anomalies))
}

fn normalize(feed: Feed, fetched_url: &Url, now: i64, anomalies: Vec<ParseAnomaly>) -> ParsedFeed {
    let feed_url = fetched_url.as_str().to_owned();

    // Fall back to the fetched URL when the feed's own link is missing or relative
    let origin = primary_link(&feed.links)
        .and_then(|href| Url::parse(href).ok())
        .and_then(|u| site_origin(&u))
        .or_else(|| site_origin(fetched_url))
        .unwrap_or_else(|| feed_url.clone());

    let logo = match feed.logo.as_ref().or(feed.icon.as_ref()) {
        Some(image) if !image.uri.trim().is_empty() => Logo {
            url: image.uri.trim().to_owned(),
            is_default: false,
        },
        _ => Logo {
            url: format!("{}/favicon.ico", origin),
            is_default: true,
        },
    };

    let descriptor = FeedDescriptor {
        url: feed_url.clone(),
        title: feed.title.map(|t| t.content),
        link: origin,
        author: feed.authors.first().map(|p| p.name.clone()),
        subtitle: feed.description.map(|t| t.content),
        version: version_tag(&feed.feed_type).to_owned(),
        logo,
        updated: feed.updated.map(|dt| dt.timestamp()),
    };

    let language = feed.language;
    let entries = feed
        .entries
        .into_iter()
        .map(|entry| normalize_entry(entry, &feed_url, language.as_deref(), now))
        .collect();

    ParsedFeed {
        descriptor,
        entries,
        anomalies,
    }
}

fn normalize_entry(
    entry: Entry,
    feed_url: &str,
    language: Option<&str>,
    now: i64,
) -> NormalizedEntry {
    let declared = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let published = declared.unwrap_or(now);
    let link = primary_link(&entry.links).map(str::to_owned);
    let title = entry.title.map(|t| t.content);
    let summary = entry.summary.map(|t| t.content);

    let content = entry
        .content
        .and_then(|c| {
            let content_type = c.content_type.to_string();
            c.body.map(|value| ContentBlock {
                value,
                content_type,
                language: language.map(str::to_owned),
            })
        })
        .into_iter()
        .collect();

    let mut enclosures: Vec<Enclosure> = entry
        .links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure"))
        .filter_map(|l| Enclosure::new(&l.href, l.media_type.clone(), l.length))
        .collect();
    for media in &entry.media {
        for item in &media.content {
            if let Some(url) = &item.url {
                if let Some(enclosure) = Enclosure::new(
                    url.as_str(),
                    item.content_type.as_ref().map(|m| m.to_string()),
                    item.size,
                ) {
                    if !enclosures.iter().any(|e| e.href == enclosure.href) {
                        enclosures.push(enclosure);
                    }
                }
            }
        }
    }

    let existing_id = if entry.id.trim().is_empty() {
        None
    } else {
        Some(entry.id.as_str())
    };
    let entry_key = generate_entry_key(
        existing_id,
        link.as_deref(),
        title.as_deref().unwrap_or(""),
        summary.as_deref(),
        declared,
    );

    NormalizedEntry {
        entry_key,
        feed_url: feed_url.to_owned(),
        title,
        link,
        author: entry.authors.first().map(|p| p.name.clone()),
        published,
        summary,
        content,
        enclosures,
    }
}

/// Stable key for a remote item: its own id when present, otherwise a hash
/// of link, title, summary and the date the item declares.
///
/// `declared` must come from the document. A processing-time fallback
/// would give an undated item a new key on every fetch.
pub(crate) fn generate_entry_key(
    existing: Option<&str>,
    link: Option<&str>,
    title: &str,
    summary: Option<&str>,
    declared: Option<i64>,
) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let declared = declared.map(|ts| ts.to_string()).unwrap_or_default();
    let input = format!(
        "{}|{}|{}|{}",
        link.unwrap_or(""),
        title,
        summary.unwrap_or(""),
        declared
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

/// First alternate (or rel-less) link, else the first non-enclosure link.
fn primary_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| {
            links
                .iter()
                .find(|l| !matches!(l.rel.as_deref(), Some("enclosure") | Some("self")))
        })
        .map(|l| l.href.as_str())
        .filter(|href| !href.trim().is_empty())
}

fn version_tag(feed_type: &FeedType) -> &'static str {
    match feed_type {
        FeedType::Atom => "atom10",
        FeedType::JSON => "json1",
        FeedType::RSS0 => "rss09x",
        FeedType::RSS1 => "rss10",
        FeedType::RSS2 => "rss20",
    }
}

fn detect_anomalies(bytes: &[u8], content_type: Option<&str>) -> Vec<ParseAnomaly> {
    let mut anomalies = Vec::new();
    let Some(content_type) = content_type else {
        return anomalies;
    };

    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if !media_type.is_empty() && !media_type.contains("xml") && !media_type.contains("json") {
        anomalies.push(ParseAnomaly::NonXmlContentType(media_type));
    }

    let declared_charset = parts
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, v)| v.trim().trim_matches('"').to_ascii_lowercase());

    if let (Some(declared), Some(document)) = (declared_charset, xml_declared_encoding(bytes)) {
        if declared != document {
            anomalies.push(ParseAnomaly::EncodingOverride { declared, document });
        }
    }

    anomalies
}

/// Encoding named in the `<?xml ... ?>` declaration, lowercased.
fn xml_declared_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(256)];
    let head = String::from_utf8_lossy(head);
    let decl_end = head.find("?>")?;
    let decl = &head[..decl_end];
    if !decl.trim_start_matches('\u{feff}').trim_start().starts_with("<?xml") {
        return None;
    }
    let after = &decl[decl.find("encoding")? + "encoding".len()..];
    let after = after.trim_start().strip_prefix('=')?.trim_start();
    let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &after[1..];
    let end = value.find(quote)?;
    Some(value[..end].to_ascii_lowercase())
}
