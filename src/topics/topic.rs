//! Topic definitions
//!
//! A [`Topic`] is an immutable description of a pub/sub subject: its dotted
//! name, who owns it, and how it is routed. Topics are built with
//! [`define_framework`] or [`define_module`] and only become visible to the
//! rest of the process once registered with a
//! [`TopicManager`](super::TopicManager).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ownership scope of a topic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TopicScope {
    /// Owned by the core runtime, usable by everyone
    Framework,
    /// Owned by one module
    Module,
}

impl fmt::Display for TopicScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicScope::Framework => write!(f, "framework"),
            TopicScope::Module => write!(f, "module"),
        }
    }
}

/// A topic definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    /// Unique dotted name, e.g. `chat.messages`
    pub name: String,
    pub scope: TopicScope,
    /// Owning module; empty for framework topics
    pub module: String,
    pub description: String,
    /// Routing pattern, may contain `{param}` placeholders
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Topic {
    pub fn is_framework(&self) -> bool {
        self.scope == TopicScope::Framework
    }

    /// Placeholder names appearing in the routing pattern
    pub fn pattern_params(&self) -> Vec<&str> {
        let mut params = Vec::new();
        let mut rest = self.pattern.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    params.push(&after[..close]);
                    rest = &after[close + 1..];
                }
                None => break,
            }
        }
        params
    }

    /// Substitute `{param}` placeholders in the routing pattern
    pub fn resolve_pattern<'a, I>(&self, params: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut resolved = self.pattern.clone();
        for (key, value) in params {
            resolved = resolved.replace(&format!("{{{key}}}"), value);
        }
        resolved
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Input for [`define_framework`] and [`define_module`]
///
/// The routing pattern defaults to the topic name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicConfig {
    pub name: String,
    pub module: String,
    pub description: String,
    pub pattern: String,
    pub example: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            pattern: name.clone(),
            name,
            description: description.into(),
            ..Default::default()
        }
    }

    /// Builder method: set the owning module
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Builder method: set the routing pattern
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    /// Builder method: set an example payload
    pub fn example(mut self, example: impl Into<String>) -> Self {
        self.example = Some(example.into());
        self
    }

    /// Builder method: add a metadata entry
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Build a framework-scoped topic (not registered)
///
/// Any module set on the config is carried over so validation can reject it.
pub fn define_framework(config: TopicConfig) -> Topic {
    build(TopicScope::Framework, config)
}

/// Build a module-scoped topic (not registered)
pub fn define_module(config: TopicConfig) -> Topic {
    build(TopicScope::Module, config)
}

fn build(scope: TopicScope, config: TopicConfig) -> Topic {
    Topic {
        name: config.name,
        scope,
        module: config.module,
        description: config.description,
        pattern: config.pattern,
        example: config.example,
        metadata: config.metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_module() {
        let topic = define_module(
            TopicConfig::new("chat.messages", "Chat messages")
                .module("chat")
                .example(r#"{"text":"hi"}"#),
        );
        assert_eq!(topic.scope, TopicScope::Module);
        assert_eq!(topic.module, "chat");
        assert_eq!(topic.pattern, "chat.messages");
        assert!(!topic.is_framework());
    }

    #[test]
    fn test_define_framework() {
        let topic = define_framework(TopicConfig::new("ws.html.broadcast", "Broadcast"));
        assert!(topic.is_framework());
        assert!(topic.module.is_empty());
    }

    #[test]
    fn test_pattern_params() {
        let topic = define_module(
            TopicConfig::new("chat.room", "Room messages")
                .module("chat")
                .pattern("chat.room.{room_id}.{kind}"),
        );
        assert_eq!(topic.pattern_params(), vec!["room_id", "kind"]);
        assert_eq!(
            topic.resolve_pattern([("room_id", "r1"), ("kind", "text")]),
            "chat.room.r1.text"
        );
    }

    #[test]
    fn test_scope_serialization() {
        let json = serde_json::to_string(&TopicScope::Framework).unwrap();
        assert_eq!(json, "\"framework\"");
    }
}
