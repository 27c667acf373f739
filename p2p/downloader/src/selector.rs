//! # Peer Selector
//!
//! Ranks a candidate list against the quality registry and returns up to
//! `count` peers in preference order. Known-good peers are capped to a
//! minority of the output so the load spreads; the rest of the slots go to
//! medium and unexplored peers. The only mutation is the lazy creation of
//! records for peers seen for the first time.
//!
//! Ties are broken randomly through the injected RNG; with the same seed,
//! registry state and candidate list the output is deterministic.

use rand::{seq::SliceRandom, Rng};
use tokio::time::Instant;

use galena_types::PeerId;

use crate::peer_quality::PeerQualityRegistry;

/// A candidate that survived filtering.
#[derive(Debug, Copy, Clone)]
struct Candidate {
    peer: PeerId,
    score: f64,
    overused: bool,
    consecutive_failures: u32,
}

/// Score assigned to peers the registry has never seen.
const NEW_PEER_SCORE: f64 = 0.6;

/// Selects up to `count` peers to try, in preference order.
///
/// Returns an empty list when no candidate passes the quality bars; the
/// caller is expected to ask the overlay for more candidates.
pub fn select_peers<R: Rng + ?Sized>(
    candidates: &[PeerId],
    count: usize,
    registry: &PeerQualityRegistry,
    rng: &mut R,
) -> Vec<PeerId> {
    let now = Instant::now();

    let mut all = Vec::new();
    let mut high_quality = Vec::new();
    let mut medium = Vec::new();
    let mut new_peers = Vec::new();
    let mut skipped = 0_usize;

    for &peer in candidates {
        let Some(quality) = registry.get(peer) else {
            registry.get_or_create(peer);
            let candidate = Candidate {
                peer,
                score: NEW_PEER_SCORE,
                overused: false,
                consecutive_failures: 0,
            };
            all.push(candidate);
            new_peers.push(candidate);
            continue;
        };

        if quality.is_blacklisted(now) {
            skipped += 1;
            continue;
        }

        let score = quality.score(now);

        if score < 0.2 && quality.total_attempts() >= 2 {
            tracing::debug!(%peer, score, "filtering low-quality peer");
            skipped += 1;
            continue;
        }

        if quality.consecutive_failures >= 2 && quality.success_rate() < 0.3 {
            tracing::debug!(
                %peer,
                consecutive_failures = quality.consecutive_failures,
                "filtering peer with consecutive failures",
            );
            skipped += 1;
            continue;
        }

        let candidate = Candidate {
            peer,
            score,
            overused: quality.is_overused(now),
            consecutive_failures: quality.consecutive_failures,
        };
        all.push(candidate);

        if quality.success_rate() >= 0.7 && quality.total_attempts() >= 2 {
            high_quality.push(candidate);
        } else if quality.is_new_node() || (score >= 0.3 && quality.success_rate() >= 0.3) {
            medium.push(candidate);
        }
        // Everything else stays in `all` only, as fallback material.
    }

    if all.is_empty() {
        tracing::warn!(candidates = candidates.len(), skipped, "no usable peers");
        return Vec::new();
    }

    let selected_count = count.min(all.len());
    let mut result = Vec::with_capacity(selected_count);

    if !high_quality.is_empty() {
        let (mut fresh, mut used): (Vec<_>, Vec<_>) =
            high_quality.iter().copied().partition(|c| !c.overused);
        sort_by_score(&mut fresh, rng);
        sort_by_score(&mut used, rng);

        // Known-good peers fill at most 40% of the slots (but always at
        // least one) so the selection keeps exploring.
        let mut slots = (2 * selected_count).div_ceil(5).max(1);
        slots = slots.min(high_quality.len());

        let fresh_slots = slots.min(fresh.len());
        result.extend(fresh[..fresh_slots].iter().map(|c| c.peer));

        let used_slots = (slots - fresh_slots).min(used.len());
        result.extend(used[..used_slots].iter().map(|c| c.peer));
    }

    let remaining = selected_count.saturating_sub(result.len());
    if remaining > 0 {
        let mut explore = medium;
        explore.extend(new_peers);
        sort_by_score(&mut explore, rng);
        result.extend(explore.iter().take(remaining).map(|c| c.peer));
    }

    if result.is_empty() {
        sort_by_score(&mut all, rng);
        if let Some(fallback) = all
            .iter()
            .find(|c| c.score >= 0.25 && c.consecutive_failures <= 2)
        {
            tracing::warn!(peer = %fallback.peer, score = fallback.score, "fallback selection");
            result.push(fallback.peer);
        } else {
            tracing::warn!(
                candidates = all.len(),
                skipped,
                "no acceptable peers, failing gracefully",
            );
        }
    }

    result
}

/// Sorts by score descending; the pre-shuffle randomizes the order of
/// equal-scored peers (the sort is stable).
fn sort_by_score<R: Rng + ?Sized>(candidates: &mut [Candidate], rng: &mut R) {
    candidates.shuffle(rng);
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
}
