//! PostgreSQL-backed `StoryStore` implementation using Diesel.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::debug;

use crate::domain::ids::StoryId;
use crate::domain::ports::{Story, StoryStore, StoryStoreError};

use super::models::StoryRow;
use super::pool::{DbPool, PoolError};
use super::schema::stories;

/// Diesel-backed implementation of the `StoryStore` port.
#[derive(Clone)]
pub struct DieselStoryStore {
    pool: DbPool,
}

impl DieselStoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn map_pool_error(error: PoolError) -> StoryStoreError {
    match error {
        PoolError::Checkout { message } | PoolError::Build { message } => {
            StoryStoreError::connection(message)
        }
    }
}

#[async_trait]
impl StoryStore for DieselStoryStore {
    async fn find(&self, story_id: StoryId) -> Result<Option<Story>, StoryStoreError> {
        let mut conn = self.pool.get().await.map_err(map_pool_error)?;
        let row: Option<StoryRow> = stories::table
            .find(*story_id.as_uuid())
            .select(StoryRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(|error| {
                debug!(%error, "story lookup failed");
                StoryStoreError::query("database error")
            })?;
        Ok(row.map(Story::from))
    }
}
