//! Topic filter matching
//!
//! Filters use the broker wildcards: `+` matches exactly one level and `#`,
//! which may only appear as the last level, matches the remaining levels
//! including none at all (`a/#` matches `a`). Topics beginning with `$` are
//! reserved and never matched by a leading wildcard.

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Returns true if `topic` is matched by `filter`.
///
/// Empty filters and empty topics never match.
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter.is_empty() || topic.is_empty() {
        return false;
    }

    let filter_levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    if topic.starts_with('$')
        && matches!(filter_levels.first().copied(), Some(SINGLE_LEVEL | MULTI_LEVEL))
    {
        return false;
    }

    for (index, level) in filter_levels.iter().enumerate() {
        if *level == MULTI_LEVEL {
            return index + 1 == filter_levels.len();
        }

        match topic_levels.next() {
            Some(topic_level) if *level == SINGLE_LEVEL || *level == topic_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

/// Checks that a subscription filter is well formed.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    levels.iter().enumerate().all(|(index, level)| {
        if level.contains('#') {
            *level == MULTI_LEVEL && index + 1 == levels.len()
        } else if level.contains('+') {
            *level == SINGLE_LEVEL
        } else {
            true
        }
    })
}

/// Checks that a publish topic is non-empty and free of wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}
