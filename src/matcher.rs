use crate::rules::{ChannelKey, PhraseGroup, RuleSet};

/// Find the first phrase group of `channel` whose words all occur in `text`.
///
/// Matching is case-insensitive substring search; word order in the text
/// does not matter. Groups are tried in configuration order.
pub fn find_match<'a>(
    text: Option<&str>,
    channel: &ChannelKey,
    rules: &'a RuleSet,
) -> Option<&'a PhraseGroup> {
    let text = text.filter(|t| !t.is_empty())?;
    let groups = rules.groups(channel)?;

    let lowered = text.to_lowercase();
    groups.iter().find(|group| group.matches(&lowered))
}
