//! Topic name and filter validation
//!
//! Rules from the MQTT v3.1.1 topic chapter:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must occupy a whole level and come last
//! - Single-level wildcard (+) must occupy a whole level
//! - Topics starting with $ are shielded from root-level wildcards

use crate::protocol::ProtocolError;

/// Validate a topic name (used in PUBLISH and will topics)
pub fn validate_topic_name(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopic("topic name cannot be empty"));
    }

    if topic.len() > 65535 {
        return Err(ProtocolError::InvalidTopic(
            "topic name exceeds maximum length",
        ));
    }

    if topic.contains('\0') {
        return Err(ProtocolError::InvalidTopic(
            "topic name cannot contain null character",
        ));
    }

    if topic.contains('+') || topic.contains('#') {
        return Err(ProtocolError::InvalidTopic(
            "topic name cannot contain wildcards",
        ));
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), ProtocolError> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidTopicFilter(
            "topic filter cannot be empty",
        ));
    }

    if filter.len() > 65535 {
        return Err(ProtocolError::InvalidTopicFilter(
            "topic filter exceeds maximum length",
        ));
    }

    if filter.contains('\0') {
        return Err(ProtocolError::InvalidTopicFilter(
            "topic filter cannot contain null character",
        ));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err(ProtocolError::InvalidTopicFilter(
                    "multi-level wildcard must occupy entire level",
                ));
            }
            if levels.peek().is_some() {
                return Err(ProtocolError::InvalidTopicFilter(
                    "multi-level wildcard must be last level",
                ));
            }
        }

        if level.contains('+') && level != "+" {
            return Err(ProtocolError::InvalidTopicFilter(
                "single-level wildcard must occupy entire level",
            ));
        }
    }

    Ok(())
}

/// Check whether a single filter covers a topic name.
///
/// Used for retained-message lookup, where stored topics are checked against
/// a newly granted filter. Subscription fan-out goes through the trie
/// instead.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    // Root-level wildcards never see $-topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}
