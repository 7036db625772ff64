//! Text filters for response streams

use sg_core::traits::TextFilter;

/// Withholds a "nothing to say" sentinel reply that follows tool activity.
///
/// After a tool event, an agent may finish with a short sentinel such as
/// `NO_REPLY` instead of prose. While the trimmed reply is still a prefix of
/// the sentinel nothing is streamed, so a sentinel split across chunks never
/// leaks. As soon as the reply diverges the whole text becomes visible. A
/// finished reply is dropped only when it is exactly the sentinel; a reply
/// that stopped at a prefix such as `NO` is released.
#[derive(Debug, Clone)]
pub struct SentinelFilter {
    sentinel: String,
}

impl SentinelFilter {
    /// Create a filter for the given sentinel
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }
}

impl TextFilter for SentinelFilter {
    fn visible_len(&self, accumulated: &str, tool_event_seen: bool, is_final: bool) -> usize {
        if !tool_event_seen || self.sentinel.is_empty() {
            return accumulated.len();
        }
        let trimmed = accumulated.trim();
        let withheld = if is_final {
            trimmed == self.sentinel
        } else {
            !trimmed.is_empty() && self.sentinel.starts_with(trimmed)
        };
        if withheld {
            0
        } else {
            accumulated.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_everything_without_tool_activity() {
        let filter = SentinelFilter::new("NO_REPLY");
        assert_eq!(filter.visible_len("NO_REPLY", false, false), 8);
    }

    #[test]
    fn test_withholds_sentinel_after_tool_activity() {
        let filter = SentinelFilter::new("NO_REPLY");
        assert_eq!(filter.visible_len("NO_REPLY", true, false), 0);
        assert_eq!(filter.visible_len("  NO_REPLY\n", true, false), 0);
    }

    #[test]
    fn test_withholds_partial_sentinel_prefix() {
        let filter = SentinelFilter::new("NO_REPLY");
        assert_eq!(filter.visible_len("NO", true, false), 0);
        assert_eq!(filter.visible_len("NO_RE", true, false), 0);
    }

    #[test]
    fn test_releases_text_once_it_diverges() {
        let filter = SentinelFilter::new("NO_REPLY");
        assert_eq!(filter.visible_len("NOT", true, false), 3);
        assert_eq!(filter.visible_len("No problem", true, false), 10);
    }

    #[test]
    fn test_final_prefix_is_released() {
        let filter = SentinelFilter::new("NO_REPLY");
        assert_eq!(filter.visible_len("NO", true, true), 2);
        assert_eq!(filter.visible_len("NO_REPL", true, true), 7);
    }

    #[test]
    fn test_final_exact_sentinel_is_dropped() {
        let filter = SentinelFilter::new("NO_REPLY");
        assert_eq!(filter.visible_len(" NO_REPLY \n", true, true), 0);
        assert_eq!(filter.visible_len("NO_REPLY", false, true), 8);
    }

    #[test]
    fn test_whitespace_only_is_not_withheld() {
        let filter = SentinelFilter::new("NO_REPLY");
        assert_eq!(filter.visible_len("  ", true, false), 2);
    }
}
