//! Named operations. Each one runs in a single store transaction, starts with
//! the caller guard (except the internal user operations), and either commits
//! all of its writes or none of them.

pub mod conversations;
pub mod friends;
pub mod messages;
pub mod requests;
pub mod users;

use crate::error::ApiError;
use crate::store::StoreError;

/// Treat a uniqueness conflict from the store as a failed precondition with
/// the given message; other store failures pass through.
fn conflict_as(msg: &'static str) -> impl FnOnce(StoreError) -> ApiError {
    move |e| match e {
        StoreError::Conflict(_) => ApiError::precondition(msg),
        other => ApiError::from(other),
    }
}
