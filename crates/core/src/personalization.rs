//! Learner-profile personalization.
//!
//! Personalization is an enhancement, so [`PersonalizationSource::get_context`]
//! cannot fail: any lookup error degrades to a placeholder string.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Injected into prompts when no profile can be loaded.
pub const PROFILE_UNAVAILABLE: &str =
    "LEARNER PROFILE CONTEXT: Profile information not available.";

/// Produces the learner-profile text injected into tutor prompts.
#[async_trait]
pub trait PersonalizationSource: Send + Sync {
    async fn get_context(&self, project_id: &str, topic: &str) -> String;
}

/// Raw profile lookup. Errors are expected and absorbed by [`ProfileStoreContext`].
#[async_trait]
pub trait LearnerProfileStore: Send + Sync {
    async fn learner_profile(&self, project_id: &str) -> Result<Option<String>>;
}

/// Adapts a fallible [`LearnerProfileStore`] into an infallible source.
pub struct ProfileStoreContext {
    store: Arc<dyn LearnerProfileStore>,
}

impl ProfileStoreContext {
    pub fn new(store: Arc<dyn LearnerProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PersonalizationSource for ProfileStoreContext {
    async fn get_context(&self, project_id: &str, topic: &str) -> String {
        match self.store.learner_profile(project_id).await {
            Ok(Some(profile)) if !profile.trim().is_empty() => format!(
                "LEARNER PROFILE CONTEXT (topic: {}):\n{}",
                topic,
                profile.trim()
            ),
            Ok(_) => PROFILE_UNAVAILABLE.to_string(),
            Err(e) => {
                tracing::warn!(project_id, error = %e, "Learner profile lookup failed; continuing without it");
                PROFILE_UNAVAILABLE.to_string()
            }
        }
    }
}

/// A source that never personalizes.
pub struct NoPersonalization;

#[async_trait]
impl PersonalizationSource for NoPersonalization {
    async fn get_context(&self, _project_id: &str, _topic: &str) -> String {
        PROFILE_UNAVAILABLE.to_string()
    }
}

/// Fixed profiles keyed by project id.
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, String>,
}

impl StaticProfiles {
    pub fn with_profile(mut self, project_id: impl Into<String>, profile: impl Into<String>) -> Self {
        self.profiles.insert(project_id.into(), profile.into());
        self
    }
}

#[async_trait]
impl LearnerProfileStore for StaticProfiles {
    async fn learner_profile(&self, project_id: &str) -> Result<Option<String>> {
        Ok(self.profiles.get(project_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl LearnerProfileStore for FailingStore {
        async fn learner_profile(&self, _project_id: &str) -> Result<Option<String>> {
            anyhow::bail!("profile database offline")
        }
    }

    #[tokio::test]
    async fn test_profile_is_wrapped_with_topic() {
        let source = ProfileStoreContext::new(Arc::new(
            StaticProfiles::default().with_profile("p1", "Visual learner. Knows algebra.\n"),
        ));
        assert_eq!(
            source.get_context("p1", "Calculus").await,
            "LEARNER PROFILE CONTEXT (topic: Calculus):\nVisual learner. Knows algebra."
        );
        assert_eq!(source.get_context("p2", "Calculus").await, PROFILE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_store_errors_degrade_to_placeholder() {
        let source = ProfileStoreContext::new(Arc::new(FailingStore));
        assert_eq!(source.get_context("p1", "Calculus").await, PROFILE_UNAVAILABLE);
        assert_eq!(NoPersonalization.get_context("p1", "x").await, PROFILE_UNAVAILABLE);
    }
}
