//! Topic naming and definition rules

use regex::Regex;
use std::sync::LazyLock;

use super::error::{TopicError, TopicErrorKind, TopicResult};
use super::topic::{Topic, TopicConfig, TopicScope};

/// Maximum topic name length
pub const MAX_TOPIC_NAME_LEN: usize = 100;

/// Maximum module name length
pub const MAX_MODULE_NAME_LEN: usize = 50;

/// Prefixes no topic may use
pub const RESERVED_PREFIXES: &[&str] = &["system.", "internal.", "debug."];

/// Prefixes a framework topic must start with
pub const FRAMEWORK_PREFIXES: &[&str] = &["ws.", "presence.", "auth.", "server."];

static TOPIC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*(\.[a-z][a-z0-9]*)*$").unwrap());

static MODULE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

/// Check a topic name against the naming rules
pub fn validate_topic_name(name: &str) -> TopicResult<()> {
    if name.is_empty() {
        return Err(TopicError::new(
            TopicErrorKind::InvalidPattern,
            name,
            "topic name is empty",
        ));
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return Err(TopicError::new(
            TopicErrorKind::InvalidPattern,
            name,
            format!("topic name exceeds {MAX_TOPIC_NAME_LEN} characters"),
        ));
    }
    if let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| name.starts_with(*p)) {
        return Err(TopicError::new(
            TopicErrorKind::InvalidPattern,
            name,
            format!("topic name uses reserved prefix '{prefix}'"),
        ));
    }
    if !TOPIC_NAME.is_match(name) {
        return Err(TopicError::new(
            TopicErrorKind::InvalidPattern,
            name,
            "topic name must be lowercase dot-separated segments starting with a letter",
        ));
    }
    Ok(())
}

/// Check a module name against the naming rules
pub fn validate_module_name(module: &str) -> TopicResult<()> {
    if module.is_empty() || module.len() > MAX_MODULE_NAME_LEN || !MODULE_NAME.is_match(module) {
        return Err(TopicError::new(
            TopicErrorKind::InvalidPattern,
            "",
            format!("invalid module name '{module}'"),
        )
        .module(module));
    }
    Ok(())
}

/// Validate a configuration before it is turned into a topic
///
/// Checks the parts that do not depend on scope.
pub fn validate_configuration(config: &TopicConfig) -> TopicResult<()> {
    validate_common(&config.name, &config.module, &config.description, &config.pattern)?;
    if !config.module.is_empty() {
        validate_module_name(&config.module).map_err(|e| with_topic(e, &config.name))?;
    }
    Ok(())
}

/// Validate a complete topic definition, including scope rules
pub fn validate_topic(topic: &Topic) -> TopicResult<()> {
    validate_common(&topic.name, &topic.module, &topic.description, &topic.pattern)?;

    match topic.scope {
        TopicScope::Framework => {
            if !topic.module.is_empty() {
                return Err(TopicError::new(
                    TopicErrorKind::InvalidScope,
                    topic.name.as_str(),
                    "framework topics must not belong to a module",
                )
                .module(topic.module.as_str()));
            }
            if !FRAMEWORK_PREFIXES.iter().any(|p| topic.name.starts_with(p)) {
                return Err(TopicError::new(
                    TopicErrorKind::InvalidScope,
                    topic.name.as_str(),
                    format!(
                        "framework topics must start with one of {}",
                        FRAMEWORK_PREFIXES.join(", ")
                    ),
                ));
            }
        }
        TopicScope::Module => {
            if topic.module.is_empty() {
                return Err(TopicError::new(
                    TopicErrorKind::InvalidScope,
                    topic.name.as_str(),
                    "module topics must name their module",
                ));
            }
            validate_module_name(&topic.module).map_err(|e| with_topic(e, &topic.name))?;
        }
    }
    Ok(())
}

fn validate_common(name: &str, module: &str, description: &str, pattern: &str) -> TopicResult<()> {
    validate_topic_name(name).map_err(|e| e.module(module))?;

    if description.trim().is_empty() {
        return Err(
            TopicError::new(TopicErrorKind::ValidationFailed, name, "description is required")
                .module(module),
        );
    }
    if pattern.trim().is_empty() {
        return Err(TopicError::new(
            TopicErrorKind::ValidationFailed,
            name,
            "routing pattern is required",
        )
        .module(module));
    }
    Ok(())
}

fn with_topic(mut err: TopicError, topic: &str) -> TopicError {
    err.topic = topic.to_string();
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::topic::{define_framework, define_module};

    #[test]
    fn test_valid_names() {
        for name in ["chat", "chat.messages", "ws.html.broadcast", "a1.b2.c3", "x"] {
            assert!(validate_topic_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in [
            "",
            "Chat",
            "chat.",
            ".chat",
            "chat..messages",
            "1chat",
            "chat.1x",
            "chat-messages",
            "chat_messages",
            "chat messages",
            "system.boot",
            "internal.queue",
            "debug.trace",
        ] {
            let err = validate_topic_name(name).unwrap_err();
            assert_eq!(err.kind, TopicErrorKind::InvalidPattern, "{name}");
        }
    }

    #[test]
    fn test_name_length_limit() {
        let ok = "a".repeat(MAX_TOPIC_NAME_LEN);
        assert!(validate_topic_name(&ok).is_ok());
        let too_long = "a".repeat(MAX_TOPIC_NAME_LEN + 1);
        assert!(validate_topic_name(&too_long).is_err());
    }

    #[test]
    fn test_reserved_prefix_only_at_start() {
        assert!(validate_topic_name("chat.system").is_ok());
        assert!(validate_topic_name("systemd.units").is_ok());
    }

    #[test]
    fn test_module_names() {
        assert!(validate_module_name("chat").is_ok());
        assert!(validate_module_name("war_game2").is_ok());
        assert!(validate_module_name("").is_err());
        assert!(validate_module_name("Chat").is_err());
        assert!(validate_module_name("_chat").is_err());
        assert!(validate_module_name(&"m".repeat(MAX_MODULE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_configuration_requires_description_and_pattern() {
        let config = TopicConfig::new("chat.messages", "  ").module("chat");
        assert_eq!(
            validate_configuration(&config).unwrap_err().kind,
            TopicErrorKind::ValidationFailed
        );

        let config = TopicConfig::new("chat.messages", "Messages")
            .module("chat")
            .pattern("");
        assert!(validate_configuration(&config).is_err());
    }

    #[test]
    fn test_framework_scope_rules() {
        let ok = define_framework(TopicConfig::new("presence.user.online", "Online"));
        assert!(validate_topic(&ok).is_ok());

        let wrong_prefix = define_framework(TopicConfig::new("chat.messages", "Messages"));
        assert_eq!(
            validate_topic(&wrong_prefix).unwrap_err().kind,
            TopicErrorKind::InvalidScope
        );

        let with_module = define_framework(TopicConfig::new("ws.extra", "Extra").module("chat"));
        assert_eq!(
            validate_topic(&with_module).unwrap_err().kind,
            TopicErrorKind::InvalidScope
        );
    }

    #[test]
    fn test_module_scope_rules() {
        let missing_module = define_module(TopicConfig::new("chat.messages", "Messages"));
        assert_eq!(
            validate_topic(&missing_module).unwrap_err().kind,
            TopicErrorKind::InvalidScope
        );

        let bad_module = define_module(TopicConfig::new("chat.messages", "Messages").module("Chat"));
        assert_eq!(
            validate_topic(&bad_module).unwrap_err().kind,
            TopicErrorKind::InvalidPattern
        );
    }
}
