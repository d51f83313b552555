use super::StopMatch;
use tracing::trace;

/// Matches generated text against an ordered list of stop strings.
///
/// Matching is a pure function of the unsent text, the byte length of the
/// newest token and the stop strings, so it can be exercised without a model.
///
/// A full match only rescans the last `stop.len() + last_token_len` bytes of
/// the text, which is the region the newest token could have completed. A
/// partial match is a suffix of the text that equals a prefix of a stop
/// string; the longest such prefix is used. Across stop strings the earliest
/// offset wins.
///
/// # Examples
///
/// ```rust
/// use llama_completion::stopper::{StopMatch, StopSequenceMatcher};
///
/// let matcher = StopSequenceMatcher::new(vec!["\n\n".to_string()]);
/// assert_eq!(
///     matcher.check(" 2\n\n", 1),
///     Some(StopMatch::Full { offset: 2, stop_index: 0 })
/// );
/// assert_eq!(matcher.check(" 2\n", 1), Some(StopMatch::Partial { offset: 2 }));
/// assert_eq!(matcher.check(" 2", 2), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StopSequenceMatcher {
    stops: Vec<String>,
}

impl StopSequenceMatcher {
    pub fn new(stops: Vec<String>) -> Self {
        Self { stops }
    }

    pub fn stops(&self) -> &[String] {
        &self.stops
    }

    pub fn stop(&self, index: usize) -> Option<&str> {
        self.stops.get(index).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Full-match check first, then the partial check.
    pub fn check(&self, text: &str, last_token_len: usize) -> Option<StopMatch> {
        if let Some((offset, stop_index)) = find_full_stop(text, last_token_len, &self.stops) {
            trace!(offset, stop_index, "full stop match");
            return Some(StopMatch::Full { offset, stop_index });
        }
        find_partial_stop(text, &self.stops).map(|offset| StopMatch::Partial { offset })
    }
}

/// Earliest full occurrence of any stop string, as `(offset, stop_index)`.
pub fn find_full_stop<S: AsRef<str>>(
    text: &str,
    last_token_len: usize,
    stops: &[S],
) -> Option<(usize, usize)> {
    let haystack = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;

    for (index, stop) in stops.iter().enumerate() {
        let needle = stop.as_ref().as_bytes();
        if needle.is_empty() {
            continue;
        }
        let window = needle.len() + last_token_len;
        let from = haystack.len().saturating_sub(window);
        if let Some(pos) = find_bytes(&haystack[from..], needle) {
            let offset = from + pos;
            if best.is_none_or(|(current, _)| offset < current) {
                best = Some((offset, index));
            }
        }
    }
    best
}

/// Earliest offset at which a suffix of `text` equals a prefix of a stop
/// string.
pub fn find_partial_stop<S: AsRef<str>>(text: &str, stops: &[S]) -> Option<usize> {
    let haystack = text.as_bytes();
    let last = *haystack.last()?;
    let mut best: Option<usize> = None;

    for stop in stops {
        let needle = stop.as_ref().as_bytes();
        for char_index in (0..needle.len()).rev() {
            if needle[char_index] == last && haystack.ends_with(&needle[..=char_index]) {
                let offset = haystack.len() - char_index - 1;
                if best.is_none_or(|current| offset < current) {
                    best = Some(offset);
                }
                break;
            }
        }
    }
    best
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
