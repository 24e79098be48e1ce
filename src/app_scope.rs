//! # Application Scope
//!
//! Read-mostly, process-wide key/value settings shared by every request on
//! every dispatcher. The scope is assembled once at startup through
//! [`AppScopeBuilder`] and then injected (as `Arc<AppScope>`) into the
//! dispatchers and the cluster supervisor; there is no ambient global.
//!
//! The scope offers no mutation after [`AppScopeBuilder::build`]. State that has
//! to change while serving belongs in an external store or behind the worker
//! pool, not here.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable application-wide settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppScope {
    values: BTreeMap<String, Value>,
}

impl AppScope {
    #[must_use]
    pub fn builder() -> AppScopeBuilder {
        AppScopeBuilder::default()
    }

    /// An empty scope, already shareable.
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Startup-time writer for [`AppScope`].
#[derive(Debug, Default)]
pub struct AppScopeBuilder {
    values: BTreeMap<String, Value>,
}

impl AppScopeBuilder {
    /// Insert or replace a value. Later inserts win.
    #[must_use]
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Merge every entry of a map, e.g. the `app:` section of a config file.
    #[must_use]
    pub fn extend<I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.values.extend(entries);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<AppScope> {
        Arc::new(AppScope {
            values: self.values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_last_insert_wins() {
        let scope = AppScope::builder()
            .insert("site", "one")
            .insert("site", "two")
            .insert("limit", 10)
            .build();
        assert_eq!(scope.get_str("site"), Some("two"));
        assert_eq!(scope.get("limit"), Some(&json!(10)));
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn test_empty_scope() {
        let scope = AppScope::empty();
        assert!(scope.is_empty());
        assert!(!scope.contains("anything"));
    }
}
