//! Regex-based topic selection for consumers

use regex::Regex;

use crate::error::KafkaClientError;
use crate::Result;

/// Selects topics by a regex matched against the whole topic name.
#[derive(Debug, Clone)]
pub enum TopicFilter {
    /// Keep topics matching the pattern
    Whitelist(Regex),
    /// Keep topics not matching the pattern
    Blacklist(Regex),
}

impl TopicFilter {
    pub fn whitelist(pattern: &str) -> Result<Self> {
        Ok(TopicFilter::Whitelist(anchored(pattern)?))
    }

    pub fn blacklist(pattern: &str) -> Result<Self> {
        Ok(TopicFilter::Blacklist(anchored(pattern)?))
    }

    /// Whitelist matching exactly one topic name
    pub fn topic(name: &str) -> Result<Self> {
        Self::whitelist(&regex::escape(name))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Whitelist(regex) => regex.is_match(topic),
            TopicFilter::Blacklist(regex) => !regex.is_match(topic),
        }
    }

    /// Topics passing the filter, in input order
    pub fn topics<'a, I>(&self, all_topics: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        all_topics
            .into_iter()
            .filter(|topic| self.matches(topic))
            .map(str::to_string)
            .collect()
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
        KafkaClientError::invalid_config(format!("Invalid topic filter `{}`: {}", pattern, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TOPICS: [&str; 7] = [
        "topic",
        "topic1",
        "topic2",
        "topictest",
        "useractivity",
        "pageviews",
        "datasync",
    ];

    fn filtered(filter: TopicFilter) -> Vec<String> {
        filter.topics(TOPICS)
    }

    #[test]
    fn test_whitelist() {
        assert_eq!(
            filtered(TopicFilter::whitelist("topic.").unwrap()),
            vec!["topic1", "topic2"]
        );
        assert_eq!(
            filtered(TopicFilter::whitelist("topic.+").unwrap()),
            vec!["topic1", "topic2", "topictest"]
        );
        assert_eq!(
            filtered(TopicFilter::whitelist("topic.*").unwrap()),
            vec!["topic", "topic1", "topic2", "topictest"]
        );
        assert_eq!(filtered(TopicFilter::whitelist(".*").unwrap()), TOPICS.to_vec());
    }

    #[test]
    fn test_blacklist() {
        assert!(filtered(TopicFilter::blacklist(".*").unwrap()).is_empty());
        assert_eq!(
            filtered(TopicFilter::blacklist("topic.").unwrap()),
            vec!["topic", "topictest", "useractivity", "pageviews", "datasync"]
        );
        assert_eq!(
            filtered(TopicFilter::blacklist("topic.+").unwrap()),
            vec!["topic", "useractivity", "pageviews", "datasync"]
        );
        assert_eq!(
            filtered(TopicFilter::blacklist("topic.*").unwrap()),
            vec!["useractivity", "pageviews", "datasync"]
        );
    }

    #[test]
    fn test_exact_topic() {
        assert_eq!(filtered(TopicFilter::topic("topic").unwrap()), vec!["topic"]);
        assert!(TopicFilter::topic("a.b").unwrap().matches("a.b"));
        assert!(!TopicFilter::topic("a.b").unwrap().matches("axb"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            TopicFilter::whitelist("topic("),
            Err(KafkaClientError::InvalidConfig { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_whitelist_blacklist_partition_topics(
            pattern in "[a-z.]{1,3}[*+?]?",
            topics in proptest::collection::vec("[a-z0-9]{1,8}", 0..16),
        ) {
            let white = TopicFilter::whitelist(&pattern).unwrap();
            let black = TopicFilter::blacklist(&pattern).unwrap();
            let refs = topics.iter().map(String::as_str);
            let kept = white.topics(refs.clone());
            let dropped = black.topics(refs);

            prop_assert_eq!(kept.len() + dropped.len(), topics.len());
            for topic in &topics {
                prop_assert!(kept.contains(topic) != dropped.contains(topic));
            }
        }
    }
}
