use std::collections::BTreeMap;

/// Interest in one topic, optionally narrowed to some top-level fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscribePayload {
    pub topic: String,
    /// Sorted, deduplicated. `None` means the whole message.
    pub fields: Option<Vec<String>>,
}

impl SubscribePayload {
    pub fn whole(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            fields: None,
        }
    }

    pub fn sliced<I, S>(topic: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        fields.sort();
        fields.dedup();
        Self {
            topic: topic.into(),
            fields: Some(fields),
        }
    }

    /// Parse `topic` or `topic:field1,field2`.
    pub fn parse(text: &str) -> Self {
        match text.split_once(':') {
            Some((topic, fields)) => Self::sliced(
                topic,
                fields.split(',').map(str::trim).filter(|f| !f.is_empty()),
            ),
            None => Self::whole(text),
        }
    }

    pub fn is_sliced(&self) -> bool {
        self.fields.is_some()
    }

    /// Subscription hash: equal for equal (topic, field set) pairs, distinct
    /// for different slices of the same topic.
    ///
    /// Encoded as a JSON array, so names containing separators stay distinct.
    pub fn cache_key(&self) -> String {
        serde_json::json!([self.topic, self.fields]).to_string()
    }
}

/// Topic name → subscription. One subscription per topic.
pub type TopicSelection = BTreeMap<String, SubscribePayload>;

/// Build a selection from payloads; a later payload for the same topic wins.
pub fn topic_selection(payloads: impl IntoIterator<Item = SubscribePayload>) -> TopicSelection {
    payloads
        .into_iter()
        .map(|p| (p.topic.clone(), p))
        .collect()
}

/// Topics requested from a source, grouped by the payload form wanted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicsByFormat {
    pub raw: Vec<String>,
    pub parsed: Vec<String>,
}

impl TopicsByFormat {
    pub fn raw<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            raw: topics.into_iter().map(Into::into).collect(),
            parsed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.parsed.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.raw.iter().chain(self.parsed.iter())
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.all().any(|t| t == topic)
    }

    /// Keep only topics accepted by `keep`.
    pub fn filter(&self, mut keep: impl FnMut(&str) -> bool) -> Self {
        Self {
            raw: self.raw.iter().filter(|t| keep(t)).cloned().collect(),
            parsed: self.parsed.iter().filter(|t| keep(t)).cloned().collect(),
        }
    }

    /// Union, keeping each topic once per format.
    pub fn union(&self, other: &TopicsByFormat) -> Self {
        let mut out = self.clone();
        for t in &other.raw {
            if !out.raw.contains(t) {
                out.raw.push(t.clone());
            }
        }
        for t in &other.parsed {
            if !out.parsed.contains(t) {
                out.parsed.push(t.clone());
            }
        }
        out
    }

    /// Every topic of `other` is requested here in the same format.
    pub fn covers(&self, other: &TopicsByFormat) -> bool {
        other.raw.iter().all(|t| self.raw.contains(t))
            && other.parsed.iter().all(|t| self.parsed.contains(t))
    }
}
