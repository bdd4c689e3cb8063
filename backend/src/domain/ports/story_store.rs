//! Port for read-only story access.
//!
//! Story authoring lives outside this service; the coordination layer only
//! needs titles and text for pricing and synthesis.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::ids::StoryId;

/// Errors raised by story store adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoryStoreError {
    #[error("story store connection failed: {message}")]
    Connection { message: String },
    #[error("story store query failed: {message}")]
    Query { message: String },
}

impl StoryStoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }
}

/// A bedtime story as the coordination layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    pub text: String,
}

/// Port for story reads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoryStore: Send + Sync {
    async fn find(&self, story_id: StoryId) -> Result<Option<Story>, StoryStoreError>;
}

/// In-memory story fixture.
#[derive(Default)]
pub struct InMemoryStoryStore {
    stories: Mutex<HashMap<StoryId, Story>>,
}

impl InMemoryStoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a story and return its id.
    pub fn insert(&self, story: Story) -> StoryId {
        let id = story.id;
        self.stories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, story);
        id
    }
}

#[async_trait]
impl StoryStore for InMemoryStoryStore {
    async fn find(&self, story_id: StoryId) -> Result<Option<Story>, StoryStoreError> {
        Ok(self
            .stories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&story_id)
            .cloned())
    }
}
