//! Outbound text fragmentation.
//!
//! A message longer than the radio payload limit is split into `N` fragments sent in
//! order. When `N > 1` every fragment starts with a `"(i/N) "` marker; a message that fits
//! in one packet is sent unchanged. Fragment slices always end on a UTF-8 character
//! boundary, so each fragment is valid text on its own and the slices concatenate back to
//! the original message.
//!
//! The prefix budget is computed for the widest marker of a given `N` (both numbers
//! printed with `N`'s digit count), so no fragment exceeds the limit even when `i` and
//! `N` have different widths.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("fragment size {max} bytes cannot hold a part marker and any text")]
    FragmentTooSmall { max: usize },
}

fn digits(n: usize) -> usize {
    n.to_string().len()
}

/// Byte length of the widest `"(i/N) "` marker for `n` fragments.
fn prefix_len(n: usize) -> usize {
    2 * digits(n) + 4
}

/// Greedy split of `text` into slices of at most `budget` bytes on char boundaries.
fn slice_on_boundaries(text: &str, budget: usize) -> Option<Vec<&str>> {
    let mut slices = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= budget {
            slices.push(rest);
            break;
        }
        let mut end = budget;
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // the next character alone is wider than the budget
            return None;
        }
        slices.push(&rest[..end]);
        rest = &rest[end..];
    }
    Some(slices)
}

/// Split `text` into fragments of at most `max_fragment_bytes` bytes each.
pub fn split(text: &str, max_fragment_bytes: usize) -> Result<Vec<String>, ChunkError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if text.len() <= max_fragment_bytes {
        return Ok(vec![text.to_string()]);
    }

    let too_small = ChunkError::FragmentTooSmall {
        max: max_fragment_bytes,
    };
    // Start from the smallest multi-part count and widen until the marker width used for
    // the budget covers the count the split actually produced.
    let mut assumed = 2usize;
    loop {
        let budget = max_fragment_bytes
            .checked_sub(prefix_len(assumed))
            .filter(|b| *b > 0)
            .ok_or_else(|| too_small.clone())?;
        let slices = slice_on_boundaries(text, budget).ok_or_else(|| too_small.clone())?;
        let n = slices.len();
        if digits(n) <= digits(assumed) {
            return Ok(slices
                .iter()
                .enumerate()
                .map(|(i, s)| format!("({}/{}) {}", i + 1, n, s))
                .collect());
        }
        assumed = n;
    }
}

/// Remove a leading `"(i/N) "` marker, returning `(i, N, rest)` when present.
pub fn strip_prefix(fragment: &str) -> Option<(usize, usize, &str)> {
    let inner = fragment.strip_prefix('(')?;
    let close = inner.find(") ")?;
    let (nums, rest) = (&inner[..close], &inner[close + 2..]);
    let (i, n) = nums.split_once('/')?;
    let i: usize = i.parse().ok()?;
    let n: usize = n.parse().ok()?;
    if i == 0 || i > n {
        return None;
    }
    Some((i, n, rest))
}
