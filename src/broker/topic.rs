use std::collections::{HashMap, HashSet};

pub type SubscriberId = String;

/// A subscription filter and the subscribers bound to it.
///
/// Every embedded broker keeps its subscriptions as a set of filters, each
/// holding the ids that registered it. How a filter matches a concrete topic
/// depends on the broker flavour (see the matcher functions below).
#[derive(Debug, Default)]
pub struct Filter {
    pub pattern: String,
    pub subscribers: HashSet<SubscriberId>,
}

impl Filter {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Returns `false` if the subscriber was already present.
    pub fn subscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.insert(id)
    }

    /// Returns `false` if the subscriber was not present.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }
}

/// Filters keyed by pattern. Empty filters are dropped.
#[derive(Debug, Default)]
pub struct FilterTable {
    filters: HashMap<String, Filter>,
}

impl FilterTable {
    pub fn subscribe(&mut self, pattern: &str, id: SubscriberId) -> bool {
        self.filters
            .entry(pattern.to_string())
            .or_insert_with(|| Filter::new(pattern))
            .subscribe(id)
    }

    pub fn unsubscribe(&mut self, pattern: &str, id: &str) -> bool {
        let Some(filter) = self.filters.get_mut(pattern) else {
            return false;
        };
        let removed = filter.unsubscribe(id);
        if filter.subscribers.is_empty() {
            self.filters.remove(pattern);
        }
        removed
    }

    /// Removes `id` from every filter it is bound to.
    pub fn remove_subscriber(&mut self, id: &str) {
        self.filters.retain(|_, filter| {
            filter.unsubscribe(id);
            !filter.subscribers.is_empty()
        });
    }

    /// (pattern, subscriber) pairs whose pattern matches `topic`.
    pub fn matching<'a>(
        &'a self,
        topic: &'a str,
        matcher: fn(&str, &str) -> bool,
    ) -> impl Iterator<Item = (&'a str, &'a SubscriberId)> + 'a {
        self.filters
            .values()
            .filter(move |filter| matcher(&filter.pattern, topic))
            .flat_map(|filter| {
                filter
                    .subscribers
                    .iter()
                    .map(move |id| (filter.pattern.as_str(), id))
            })
    }

    pub fn contains(&self, pattern: &str, id: &str) -> bool {
        self.filters
            .get(pattern)
            .is_some_and(|filter| filter.subscribers.contains(id))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Check if an MQTT topic filter matches a topic.
/// - `+` matches a single level
/// - `#` matches zero or more levels (must be last)
pub fn mqtt_matches(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    let mut ti = 0;
    for fp in &filter_parts {
        if *fp == "#" {
            return true;
        }
        if ti >= topic_parts.len() {
            return false;
        }
        if *fp != "+" && *fp != topic_parts[ti] {
            return false;
        }
        ti += 1;
    }
    ti == topic_parts.len()
}

/// Whether `filter` is a well-formed MQTT filter: `+` and `#` occupy whole
/// levels and `#` is last.
pub fn is_valid_mqtt_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

/// AMQP topic exchange pattern matching.
/// - `*` matches exactly one word
/// - `#` matches zero or more words
pub fn amqp_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let key_parts: Vec<&str> = routing_key.split('.').collect();
    amqp_matches_from(&pattern_parts, &key_parts)
}

fn amqp_matches_from(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| amqp_matches_from(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((first, key_rest)) if *word == "*" || word == first => {
                amqp_matches_from(rest, key_rest)
            }
            _ => false,
        },
    }
}
