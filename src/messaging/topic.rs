//! Topic naming.
//!
//! Broker topics take the form `channels.<channel>[.<subtopic>]`. Subtopics
//! are dot-separated after normalization: `/` becomes `.`, empty segments
//! are dropped, and the single-segment MQTT wildcards `+`/`#` become `*`/`>`.
//! Edge devices address the same destination as
//! `channels/<channel>/messages[/<subtopic>]`.

use crate::utils::MessagingError;

pub const CHANNELS_PREFIX: &str = "channels";

/// Filter matching every channel and subtopic.
pub const ALL_CHANNELS: &str = "channels.>";

const SEPARATOR: char = '.';
const EDGE_SUFFIX: &str = "messages";
const WILDCARDS: [char; 4] = ['*', '>', '+', '#'];

/// Maps a channel and optional subtopic to the broker topic.
pub fn to_topic(channel: &str, subtopic: &str) -> Result<String, MessagingError> {
    if channel.is_empty() {
        return Err(MessagingError::EmptyChannel);
    }
    if !is_valid_channel(channel) {
        return Err(MessagingError::MalformedTopic);
    }
    let subtopic = parse_subtopic(subtopic)?;
    if subtopic.is_empty() {
        return Ok(format!("{CHANNELS_PREFIX}{SEPARATOR}{channel}"));
    }
    Ok(format!("{CHANNELS_PREFIX}{SEPARATOR}{channel}{SEPARATOR}{subtopic}"))
}

/// Splits a broker topic back into channel and (normalized) subtopic.
pub fn from_topic(topic: &str) -> Result<(String, String), MessagingError> {
    let rest = topic
        .strip_prefix(CHANNELS_PREFIX)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .ok_or(MessagingError::MalformedTopic)?;
    let (channel, subtopic) = match rest.split_once(SEPARATOR) {
        Some((channel, subtopic)) => (channel, subtopic),
        None => (rest, ""),
    };
    if channel.is_empty() || !is_valid_channel(channel) {
        return Err(MessagingError::MalformedTopic);
    }
    Ok((channel.to_string(), parse_subtopic(subtopic)?))
}

/// Normalizes a raw subtopic.
///
/// A wildcard is only accepted as a whole segment; `temp*` or `a>b` are
/// rejected with `MalformedSubtopic`.
pub fn parse_subtopic(raw: &str) -> Result<String, MessagingError> {
    let mut segments = Vec::new();
    for segment in raw.split(['/', SEPARATOR]) {
        if segment.is_empty() {
            continue;
        }
        let segment = match segment {
            "+" => "*",
            "#" => ">",
            other => other,
        };
        if segment.len() > 1 && segment.contains(WILDCARDS) {
            return Err(MessagingError::MalformedSubtopic);
        }
        segments.push(segment);
    }
    Ok(segments.join("."))
}

/// Parses an edge topic such as `channels/<id>/messages/<sub>`.
pub fn parse_edge_topic(topic: &str) -> Result<(String, String), MessagingError> {
    let topic = topic.split('?').next().unwrap_or_default();
    let topic = topic.strip_prefix('/').unwrap_or(topic);

    let mut parts = topic.splitn(4, '/');
    let (prefix, channel, suffix) = (parts.next(), parts.next(), parts.next());
    if prefix != Some(CHANNELS_PREFIX) || suffix != Some(EDGE_SUFFIX) {
        return Err(MessagingError::MalformedTopic);
    }
    let channel = channel.unwrap_or_default();
    if channel.is_empty() || !is_valid_channel(channel) {
        return Err(MessagingError::MalformedTopic);
    }
    let subtopic = parse_subtopic(parts.next().unwrap_or_default())?;
    Ok((channel.to_string(), subtopic))
}

/// Builds the edge topic a device subscribes on.
pub fn to_edge_topic(channel: &str, subtopic: &str) -> String {
    let mut topic = format!("{CHANNELS_PREFIX}/{channel}/{EDGE_SUFFIX}");
    if !subtopic.is_empty() {
        topic.push('/');
        topic.push_str(&subtopic.replace(SEPARATOR, "/"));
    }
    topic
}

/// Matches a dot-separated topic against a filter.
/// - `*` matches exactly one segment
/// - `>` matches one or more trailing segments
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split(SEPARATOR);
    let mut topic_parts = topic.split(SEPARATOR);

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn is_valid_channel(channel: &str) -> bool {
    channel
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}
