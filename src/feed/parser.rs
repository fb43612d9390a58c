use thiserror::Error;

use super::types::{Episode, Owner, Podcast};
use super::xml::{parse_document, Element, XmlError};

/// Errors produced while turning feed text into a [`Podcast`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// The text is not well-formed XML.
    #[error("Malformed XML: {0}")]
    MalformedXml(#[from] XmlError),

    /// Well-formed XML without the `rss` > `channel` structure.
    #[error("Invalid RSS feed format: {0}")]
    InvalidFeedFormat(&'static str),
}

/// Parses RSS 2.0 text with the iTunes podcast extension into a [`Podcast`].
///
/// The document goes through three stages: a generic element tree, typed
/// records holding exactly what the feed said ([`ChannelRecord`],
/// [`ItemRecord`]), and finally the normalized model where every missing field
/// has its default. No I/O happens here.
///
/// # Errors
///
/// - [`ParseError::MalformedXml`] if the text cannot be parsed as XML
/// - [`ParseError::InvalidFeedFormat`] if the root is not `<rss>` or has no `<channel>`
pub fn parse_feed(xml: &str) -> Result<Podcast, ParseError> {
    let root = parse_document(xml)?;
    let channel = ChannelRecord::from_document(&root)?;
    Ok(channel.into_podcast())
}

// ============================================================================
// Feed Records
// ============================================================================

/// Channel-level values exactly as present in the document.
#[derive(Debug, Default)]
struct ChannelRecord {
    title: Option<String>,
    description: Option<String>,
    link: Option<String>,
    language: Option<String>,
    copyright: Option<String>,
    last_build_date: Option<String>,
    pub_date: Option<String>,
    generator: Option<String>,
    managing_editor: Option<String>,
    itunes_author: Option<String>,
    itunes_explicit: Option<String>,
    itunes_category: Option<CategoryRecord>,
    itunes_image: Option<String>,
    image_url: Option<String>,
    owner_name: Option<String>,
    owner_email: Option<String>,
    items: Vec<ItemRecord>,
}

/// First `itunes:category` and its nested subcategory, one level deep.
#[derive(Debug, Default)]
struct CategoryRecord {
    text: Option<String>,
    subcategory: Option<String>,
}

#[derive(Debug, Default)]
struct ItemRecord {
    title: Option<String>,
    description: Option<String>,
    pub_date: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    enclosure: Option<EnclosureRecord>,
    itunes_duration: Option<String>,
    itunes_explicit: Option<String>,
    itunes_episode: Option<String>,
    itunes_season: Option<String>,
    itunes_episode_type: Option<String>,
    itunes_image: Option<String>,
}

#[derive(Debug, Default)]
struct EnclosureRecord {
    url: Option<String>,
    mime_type: Option<String>,
    length: Option<String>,
}

impl ChannelRecord {
    fn from_document(root: &Element) -> Result<Self, ParseError> {
        if root.name != "rss" {
            return Err(ParseError::InvalidFeedFormat("root element is not <rss>"));
        }
        let channel = root
            .child("channel")
            .ok_or(ParseError::InvalidFeedFormat("missing <channel> element"))?;

        let owner = channel.child("itunes:owner");

        Ok(Self {
            title: text(channel, "title"),
            description: text(channel, "description"),
            link: text(channel, "link"),
            language: text(channel, "language"),
            copyright: text(channel, "copyright"),
            last_build_date: text(channel, "lastBuildDate"),
            pub_date: text(channel, "pubDate"),
            generator: text(channel, "generator"),
            managing_editor: text(channel, "managingEditor"),
            itunes_author: text(channel, "itunes:author"),
            itunes_explicit: text(channel, "itunes:explicit"),
            itunes_category: channel
                .child("itunes:category")
                .map(CategoryRecord::from_element),
            itunes_image: href(channel, "itunes:image"),
            image_url: channel.child("image").and_then(|image| text(image, "url")),
            owner_name: owner.and_then(|o| text(o, "itunes:name")),
            owner_email: owner.and_then(|o| text(o, "itunes:email")),
            items: channel
                .children_named("item")
                .map(ItemRecord::from_element)
                .collect(),
        })
    }

    fn into_podcast(self) -> Podcast {
        let category = self.itunes_category.unwrap_or_default();

        Podcast {
            title: self.title.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            link: self.link.unwrap_or_default(),
            language: self.language.unwrap_or_default(),
            copyright: self.copyright.unwrap_or_default(),
            last_build_date: self.last_build_date.unwrap_or_default(),
            pub_date: self.pub_date.unwrap_or_default(),
            generator: self.generator.unwrap_or_default(),
            author: self
                .itunes_author
                .or_else(|| self.managing_editor.clone())
                .unwrap_or_default(),
            explicit: parse_explicit(self.itunes_explicit.as_deref()),
            category: category.text.unwrap_or_default(),
            subcategory: category.subcategory.unwrap_or_default(),
            image: self.itunes_image.or(self.image_url).unwrap_or_default(),
            owner: Owner {
                name: self.owner_name.unwrap_or_default(),
                email: self
                    .owner_email
                    .or(self.managing_editor)
                    .unwrap_or_default(),
            },
            episodes: self.items.into_iter().map(ItemRecord::into_episode).collect(),
        }
    }
}

impl CategoryRecord {
    fn from_element(element: &Element) -> Self {
        Self {
            text: non_empty(element.attr("text")),
            subcategory: element
                .child("itunes:category")
                .and_then(|sub| non_empty(sub.attr("text"))),
        }
    }
}

impl ItemRecord {
    fn from_element(item: &Element) -> Self {
        Self {
            title: text(item, "title"),
            description: text(item, "description"),
            pub_date: text(item, "pubDate"),
            link: text(item, "link"),
            // Plain `<guid>x</guid>` and `<guid isPermaLink="false">x</guid>` both land in text
            guid: text(item, "guid"),
            enclosure: item.child("enclosure").map(|e| EnclosureRecord {
                url: non_empty(e.attr("url")),
                mime_type: non_empty(e.attr("type")),
                length: non_empty(e.attr("length")),
            }),
            // Raw: colon durations are kept exactly as written
            itunes_duration: item
                .child("itunes:duration")
                .map(|e| e.text.clone())
                .filter(|v| !v.trim().is_empty()),
            itunes_explicit: text(item, "itunes:explicit"),
            itunes_episode: text(item, "itunes:episode"),
            itunes_season: text(item, "itunes:season"),
            itunes_episode_type: text(item, "itunes:episodeType"),
            itunes_image: href(item, "itunes:image"),
        }
    }

    fn into_episode(self) -> Episode {
        let enclosure = self.enclosure.unwrap_or_default();

        Episode {
            title: self.title.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            pub_date: self.pub_date.unwrap_or_default(),
            link: self.link.unwrap_or_default(),
            guid: self.guid.unwrap_or_default(),
            audio_url: enclosure.url.unwrap_or_default(),
            audio_type: enclosure.mime_type.unwrap_or_default(),
            audio_size: enclosure
                .length
                .and_then(|len| len.parse::<u64>().ok())
                .unwrap_or(0),
            duration: normalize_duration(self.itunes_duration.as_deref()),
            explicit: parse_explicit(self.itunes_explicit.as_deref()),
            episode_number: self.itunes_episode.unwrap_or_default(),
            season: self.itunes_season.unwrap_or_default(),
            episode_type: self
                .itunes_episode_type
                .unwrap_or_else(|| Episode::DEFAULT_TYPE.to_string()),
            image: self.itunes_image.unwrap_or_default(),
        }
    }
}

// ============================================================================
// Field Helpers
// ============================================================================

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn text(parent: &Element, name: &str) -> Option<String> {
    non_empty(parent.child_text(name))
}

fn href(parent: &Element, name: &str) -> Option<String> {
    parent.child(name).and_then(|e| non_empty(e.attr("href")))
}

/// `itunes:explicit` is free text: "yes" and "true" (any case) mean explicit.
pub(crate) fn parse_explicit(value: Option<&str>) -> bool {
    value
        .map(str::trim)
        .is_some_and(|v| v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true"))
}

/// Normalizes `itunes:duration`.
///
/// A bare count of seconds (surrounding whitespace ignored) becomes `M:SS`
/// (minutes unpadded, seconds padded to two digits). Values containing a colon,
/// and anything else that is not a plain integer, are returned verbatim.
/// Absent or blank is `""`.
pub(crate) fn normalize_duration(value: Option<&str>) -> String {
    let Some(raw) = value else {
        return String::new();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if raw.contains(':') || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return raw.to_string();
    }

    match trimmed.parse::<u64>() {
        Ok(total) => format!("{}:{:02}", total / 60, total % 60),
        Err(_) => raw.to_string(),
    }
}
