use std::fmt;

pub const NODE_PLACEHOLDER: &str = "{nid}";
pub const DEFAULT_TELEMETRY_TOPIC: &str = "kelo/nid/{nid}/telemetry";

/// Publish topic: either a template embedding the node id, or a fixed override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicTemplate {
    PerNode(String),
    Fixed(String),
}

impl TopicTemplate {
    /// A topic containing `{nid}` is a template; anything else is used verbatim.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.contains(NODE_PLACEHOLDER) {
            TopicTemplate::PerNode(raw.to_string())
        } else {
            TopicTemplate::Fixed(raw.to_string())
        }
    }

    pub fn for_node(&self, node_id: &str) -> String {
        match self {
            TopicTemplate::PerNode(pattern) => pattern.replace(NODE_PLACEHOLDER, node_id),
            TopicTemplate::Fixed(topic) => topic.clone(),
        }
    }
}

impl Default for TopicTemplate {
    fn default() -> Self {
        TopicTemplate::PerNode(DEFAULT_TELEMETRY_TOPIC.to_string())
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicTemplate::PerNode(pattern) => f.write_str(pattern),
            TopicTemplate::Fixed(topic) => f.write_str(topic),
        }
    }
}
