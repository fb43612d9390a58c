use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Data Structures
// ============================================================================

/// A podcast as described by its feed.
///
/// Every optional feed field is normalized to an empty string, `false` or `0`
/// by the parser, so consumers never deal with missing values. The identity of
/// a podcast is not part of the feed; see [`crate::storage::StoredPodcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Podcast {
    pub title: String,
    pub description: String,
    pub link: String,
    pub language: String,
    pub copyright: String,
    pub last_build_date: String,
    pub pub_date: String,
    pub generator: String,
    pub author: String,
    pub explicit: bool,
    pub category: String,
    pub subcategory: String,
    pub image: String,
    pub owner: Owner,
    /// Episodes in feed order. Always present, possibly empty.
    pub episodes: Vec<Episode>,
}

/// Feed owner contact (`itunes:owner`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
    pub email: String,
}

/// A single `<item>` of a podcast feed.
///
/// `pub_date` keeps the feed's original string so no timezone information is
/// lost. `duration` is already normalized to `M:SS` when the feed supplied
/// plain seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub title: String,
    pub description: String,
    pub pub_date: String,
    pub link: String,
    pub guid: String,
    pub audio_url: String,
    pub audio_type: String,
    pub audio_size: u64,
    pub duration: String,
    pub explicit: bool,
    pub episode_number: String,
    pub season: String,
    pub episode_type: String,
    pub image: String,
}

impl Default for Episode {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            pub_date: String::new(),
            link: String::new(),
            guid: String::new(),
            audio_url: String::new(),
            audio_type: String::new(),
            audio_size: 0,
            duration: String::new(),
            explicit: false,
            episode_number: String::new(),
            season: String::new(),
            episode_type: Episode::DEFAULT_TYPE.to_string(),
            image: String::new(),
        }
    }
}

impl Episode {
    /// `itunes:episodeType` used when the feed does not say.
    pub const DEFAULT_TYPE: &'static str = "full";

    /// Key used to recognise the same episode across imports.
    ///
    /// The feed's guid when present. Otherwise a SHA-256 fingerprint over the
    /// exact title, publish date, audio URL and link, so a guid-less episode
    /// only matches an identical one.
    pub fn dedup_key(&self) -> String {
        let trimmed = self.guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }

        let input = format!(
            "{}|{}|{}|{}",
            self.title, self.pub_date, self.audio_url, self.link
        );
        let hash = Sha256::digest(input.as_bytes());
        format!("fp:{:x}", hash)
    }

    pub fn has_guid(&self) -> bool {
        !self.guid.trim().is_empty()
    }
}
