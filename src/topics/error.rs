//! Topic manager error types

use std::fmt;
use thiserror::Error;

/// Classification of topic manager failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicErrorKind {
    /// Lookup of an unregistered topic
    TopicNotFound,
    /// A topic with the same name is already registered
    DuplicateRegistration,
    /// Topic or module name does not match the naming rules
    InvalidPattern,
    /// Definition rejected by validation (the cause carries the reason)
    ValidationFailed,
    /// Scope and module ownership disagree
    InvalidScope,
    /// `start` called on a running manager
    AlreadyStarted,
}

impl TopicErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicErrorKind::TopicNotFound => "topic_not_found",
            TopicErrorKind::DuplicateRegistration => "duplicate_registration",
            TopicErrorKind::InvalidPattern => "invalid_pattern",
            TopicErrorKind::ValidationFailed => "validation_failed",
            TopicErrorKind::InvalidScope => "invalid_scope",
            TopicErrorKind::AlreadyStarted => "already_started",
        }
    }
}

impl fmt::Display for TopicErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured topic error: what failed, for which topic and module, and why
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} [topic={topic:?} module={module:?}]: {message}")]
pub struct TopicError {
    pub kind: TopicErrorKind,
    pub topic: String,
    pub module: String,
    pub message: String,
    #[source]
    pub cause: Option<Box<TopicError>>,
}

impl TopicError {
    pub fn new(kind: TopicErrorKind, topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            module: String::new(),
            message: message.into(),
            cause: None,
        }
    }

    /// Builder method: set the module
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Builder method: attach the underlying error
    pub fn caused_by(mut self, cause: TopicError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn not_found(topic: &str) -> Self {
        Self::new(TopicErrorKind::TopicNotFound, topic, "topic is not registered")
    }

    pub fn is(&self, kind: TopicErrorKind) -> bool {
        self.kind == kind
    }

    /// Kind of the innermost cause (the sub-reason of `validation_failed`)
    pub fn root_kind(&self) -> TopicErrorKind {
        match &self.cause {
            Some(cause) => cause.root_kind(),
            None => self.kind,
        }
    }
}

/// Result type alias for topic operations
pub type TopicResult<T> = Result<T, TopicError>;
