//! Internal user operations, reachable only from webhook ingestion.

use log::info;

use crate::error::ApiResult;
use crate::model::{User, UserProfile};
use crate::store::Store;

pub async fn get_by_clerk_id(store: &Store, clerk_id: &str) -> ApiResult<Option<User>> {
    let mut tx = store.begin_read().await?;
    Ok(tx.user_by_clerk_id(clerk_id).await?)
}

/// Insert a user keyed by external identity, or overwrite the profile of the
/// existing one. Re-running with the same profile is a no-op.
pub async fn upsert_by_external_id(store: &Store, profile: &UserProfile) -> ApiResult<User> {
    let mut tx = store.begin().await?;
    let user = tx.upsert_user(profile).await?;
    tx.commit().await?;
    info!("Upserted user {} ({})", user.id, user.clerk_id);
    Ok(user)
}
