//! Text filtering hook for response streams

/// Decides how much of an accumulated reply may be streamed so far.
///
/// Implementations may withhold a tail (or all) of the text while it is
/// still ambiguous. Withheld text is streamed later once the filter lets
/// it through, so the result must always be a prefix length. The stream
/// asks once more with `is_final` set when the reply finishes; text still
/// withheld then is dropped.
pub trait TextFilter: Send + Sync {
    /// Byte length of the streamable prefix of `accumulated`.
    ///
    /// Must land on a char boundary and never exceed `accumulated.len()`.
    fn visible_len(&self, accumulated: &str, tool_event_seen: bool, is_final: bool) -> usize;
}
