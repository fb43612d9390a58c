use std::collections::HashSet;

use crate::feed::{Episode, Podcast};

/// Counts describing how an episode merge went. Logged by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Episodes not seen before
    pub added: usize,
    /// Episodes already known, replaced by the fetched copy
    pub refreshed: usize,
    /// Known episodes that are no longer in the feed but are kept
    pub retained: usize,
    /// Fetched episodes dropped because an earlier item had the same key
    pub duplicates: usize,
    /// Fetched episodes without a guid (matched by field fingerprint)
    pub without_guid: usize,
}

/// Folds freshly fetched feed data into a previously stored podcast.
///
/// Podcast-level fields are replaced wholesale by the fetched values. Episodes
/// are reconciled by [`Episode::dedup_key`]: the result lists every fetched
/// episode in feed order (fetched values win for known episodes), followed by
/// stored episodes that have dropped out of the feed. Nothing is deleted.
pub fn reconcile(existing: Podcast, mut fetched: Podcast) -> (Podcast, MergeStats) {
    let fetched_episodes = std::mem::take(&mut fetched.episodes);
    let (episodes, stats) = merge_episodes(existing.episodes, fetched_episodes);
    fetched.episodes = episodes;
    (fetched, stats)
}

pub(crate) fn merge_episodes(
    existing: Vec<Episode>,
    fetched: Vec<Episode>,
) -> (Vec<Episode>, MergeStats) {
    let known: HashSet<String> = existing.iter().map(Episode::dedup_key).collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(known.len() + fetched.len());
    let mut merged = Vec::with_capacity(known.len().max(fetched.len()));
    let mut stats = MergeStats::default();

    for episode in fetched {
        if !episode.has_guid() {
            stats.without_guid += 1;
        }
        let key = episode.dedup_key();
        if !seen.insert(key.clone()) {
            stats.duplicates += 1;
            continue;
        }
        if known.contains(&key) {
            stats.refreshed += 1;
        } else {
            stats.added += 1;
        }
        merged.push(episode);
    }

    for episode in existing {
        if seen.insert(episode.dedup_key()) {
            stats.retained += 1;
            merged.push(episode);
        }
    }

    (merged, stats)
}
