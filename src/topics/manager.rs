//! Topic Manager
//!
//! Registry of validated topic definitions with discovery queries.
//! Reads vastly outnumber writes (topics are registered once at startup),
//! so the entry map sits behind a reader-biased `RwLock`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::error::{TopicError, TopicErrorKind, TopicResult};
use super::topic::{Topic, TopicConfig, TopicScope};
use super::validation;

/// A registered topic with its bookkeeping
#[derive(Debug)]
pub struct RegistryEntry {
    pub topic: Topic,
    pub registered_at: DateTime<Utc>,
    usage: AtomicU64,
}

impl RegistryEntry {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            registered_at: Utc::now(),
            usage: AtomicU64::new(0),
        }
    }

    /// Number of lookups through [`TopicManager::get`]
    pub fn usage_count(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

/// What the caller intends to do with a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Publish,
    Subscribe,
}

/// Outcome of an access check
///
/// Access is never denied; cross-module use of a module topic only carries a
/// warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub warning: Option<String>,
}

/// Snapshot of manager state for observability
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub total_topics: usize,
    pub framework_topics: usize,
    pub module_topics: usize,
    pub modules: usize,
    pub total_usage: u64,
}

/// Registry of typed topic definitions
pub struct TopicManager {
    entries: RwLock<HashMap<String, Arc<RegistryEntry>>>,
    active: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            active: AtomicBool::new(false),
            started_at: Mutex::new(None),
        }
    }

    /// Validate and store a topic
    ///
    /// Fails with `duplicate_registration` when the name is taken and with
    /// `validation_failed` (carrying the specific reason as cause) otherwise.
    pub fn register(&self, topic: Topic) -> TopicResult<()> {
        if let Err(reason) = validation::validate_topic(&topic) {
            return Err(TopicError::new(
                TopicErrorKind::ValidationFailed,
                topic.name.as_str(),
                format!("invalid topic definition: {}", reason.message),
            )
            .module(topic.module.as_str())
            .caused_by(reason));
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&topic.name) {
            return Err(TopicError::new(
                TopicErrorKind::DuplicateRegistration,
                topic.name.as_str(),
                format!(
                    "topic already registered by {}",
                    owner_label(&existing.topic)
                ),
            )
            .module(topic.module.as_str()));
        }

        tracing::debug!(
            topic = %topic.name,
            scope = %topic.scope,
            module = %topic.module,
            "Topic registered"
        );
        entries.insert(topic.name.clone(), Arc::new(RegistryEntry::new(topic)));
        Ok(())
    }

    /// Register several topics, stopping at the first failure
    pub fn register_all(&self, topics: impl IntoIterator<Item = Topic>) -> TopicResult<()> {
        topics.into_iter().try_for_each(|topic| self.register(topic))
    }

    /// Look up a topic by name, counting the lookup
    pub fn get(&self, name: &str) -> TopicResult<Topic> {
        let entry = self.entry(name).ok_or_else(|| TopicError::not_found(name))?;
        entry.usage.fetch_add(1, Ordering::Relaxed);
        Ok(entry.topic.clone())
    }

    /// Registry entry for a topic without counting usage
    pub fn entry(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.entries.read().get(name).cloned()
    }

    /// Whether a topic is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// All topics, sorted by name
    pub fn list(&self) -> Vec<Topic> {
        self.collect(|_| true)
    }

    pub fn list_by_module(&self, module: &str) -> Vec<Topic> {
        self.collect(|t| t.module == module)
    }

    pub fn list_by_scope(&self, scope: TopicScope) -> Vec<Topic> {
        self.collect(|t| t.scope == scope)
    }

    pub fn list_topics_by_prefix(&self, prefix: &str) -> Vec<Topic> {
        self.collect(|t| t.name.starts_with(prefix))
    }

    /// Find topics by name; a trailing `*` matches any suffix
    pub fn find_topics(&self, pattern: &str) -> Vec<Topic> {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.list_topics_by_prefix(prefix),
            None => self.collect(|t| t.name == pattern),
        }
    }

    /// Names of modules owning at least one topic, sorted
    pub fn list_modules(&self) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .values()
            .filter(|e| !e.topic.module.is_empty())
            .map(|e| e.topic.module.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn has_module(&self, module: &str) -> bool {
        !module.is_empty() && self.entries.read().values().any(|e| e.topic.module == module)
    }

    pub fn get_module_topic_count(&self, module: &str) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.topic.module == module)
            .count()
    }

    /// Number of registered topics
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// Check a topic name against the naming rules
    pub fn validate_topic_name(&self, name: &str) -> TopicResult<()> {
        validation::validate_topic_name(name)
    }

    /// Check a topic configuration before defining it
    pub fn validate_configuration(&self, config: &TopicConfig) -> TopicResult<()> {
        validation::validate_configuration(config)
    }

    /// Decide whether `caller_module` may use a topic
    ///
    /// Framework topics are open to everyone. Using another module's topic is
    /// allowed but produces a warning.
    pub fn validate_topic_access(
        &self,
        topic_name: &str,
        caller_module: &str,
        kind: AccessKind,
    ) -> TopicResult<AccessDecision> {
        let entry = self
            .entry(topic_name)
            .ok_or_else(|| TopicError::not_found(topic_name).module(caller_module))?;

        let topic = &entry.topic;
        if topic.is_framework() || topic.module == caller_module {
            return Ok(AccessDecision {
                allowed: true,
                warning: None,
            });
        }

        let warning = format!(
            "module '{}' {} topic '{}' owned by module '{}'",
            caller_module,
            match kind {
                AccessKind::Publish => "publishes to",
                AccessKind::Subscribe => "subscribes to",
            },
            topic.name,
            topic.module
        );
        tracing::warn!(
            topic = %topic.name,
            owner = %topic.module,
            caller = %caller_module,
            "Cross-module topic access"
        );
        Ok(AccessDecision {
            allowed: true,
            warning: Some(warning),
        })
    }

    /// Drop every registered topic
    ///
    /// Only meant for isolating tests that share a manager.
    pub fn reset(&self) {
        self.entries.write().clear();
    }

    /// Mark the manager active
    pub fn start(&self) -> TopicResult<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(TopicError::new(
                TopicErrorKind::AlreadyStarted,
                "",
                "topic manager is already running",
            ));
        }
        *self.started_at.lock() = Some(Utc::now());
        tracing::info!(topics = self.count(), "Topic manager started");
        Ok(())
    }

    /// Mark the manager inactive; stopping an inactive manager is a no-op
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::info!(topics = self.count(), "Topic manager stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TopicStats {
        let entries = self.entries.read();
        let framework_topics = entries.values().filter(|e| e.topic.is_framework()).count();
        let modules = entries
            .values()
            .filter(|e| !e.topic.module.is_empty())
            .map(|e| e.topic.module.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        TopicStats {
            active: self.is_active(),
            started_at: *self.started_at.lock(),
            total_topics: entries.len(),
            framework_topics,
            module_topics: entries.len() - framework_topics,
            modules,
            total_usage: entries.values().map(|e| e.usage_count()).sum(),
        }
    }

    fn collect(&self, predicate: impl Fn(&Topic) -> bool) -> Vec<Topic> {
        let entries = self.entries.read();
        let mut topics: Vec<Topic> = entries
            .values()
            .filter(|e| predicate(&e.topic))
            .map(|e| e.topic.clone())
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }
}

impl Default for TopicManager {
    fn default() -> Self {
        Self::new()
    }
}

fn owner_label(topic: &Topic) -> String {
    if topic.is_framework() {
        "the framework".to_string()
    } else {
        format!("module '{}'", topic.module)
    }
}
