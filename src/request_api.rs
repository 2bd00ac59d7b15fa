//! Request API: the thin, validated surface producers call through.
//! Both the library entry points here and the HTTP routes in `routes/`
//! are callers of the same `Store` primitives — this module owns
//! validation and id allocation, `Store` owns persistence.

use crate::domain::{PartyId, Subject};
use crate::store::{RequestId, Store, StoreError};

const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum RequestApiError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A caller-submitted notification order, pre-validation.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub party_from: PartyId,
    pub party_to: PartyId,
    pub expand_group: bool,
    pub subject: String,
    pub message: String,
    pub max_retries: Option<i32>,
}

/// Allocate an id and persist `request` as `pending`. Atomic: a validation
/// failure never reaches the Store, and a Store failure leaves no row
/// behind.
#[tracing::instrument(
    name = "Post a new notification request",
    skip(store, request),
    fields(party_from = %request.party_from, party_to = %request.party_to)
)]
pub async fn post_request(store: &Store, request: NewRequest) -> Result<RequestId, RequestApiError> {
    let subject = Subject::parse(request.subject).map_err(RequestApiError::Validation)?;
    let max_retries = request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
    if max_retries < 0 {
        return Err(RequestApiError::Validation(
            "max_retries must be non-negative".into(),
        ));
    }

    let request_id = store
        .insert_request(
            request.party_from,
            request.party_to,
            request.expand_group,
            &subject,
            &request.message,
            max_retries,
        )
        .await?;

    Ok(request_id)
}

/// Cancel a request by id. Delegates entirely to the Store: idempotent,
/// and scoped strictly to the given id.
#[tracing::instrument(name = "Cancel a notification request", skip(store))]
pub async fn cancel_request(store: &Store, request_id: RequestId) -> Result<(), RequestApiError> {
    store.cancel_request(request_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PartyId;

    #[sqlx::test]
    async fn posting_a_request_allocates_an_id_and_persists_it_pending(pool: sqlx::PgPool) {
        let store = Store::new(pool);

        let request_id = post_request(
            &store,
            NewRequest {
                party_from: PartyId::new(10),
                party_to: PartyId::new(20),
                expand_group: false,
                subject: "hi".into(),
                message: "hello".into(),
                max_retries: None,
            },
        )
        .await
        .unwrap();

        let pending = store.pending_requests().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, request_id);
        assert_eq!(pending[0].max_retries, DEFAULT_MAX_RETRIES);
    }

    #[sqlx::test]
    async fn an_oversized_subject_is_rejected_before_touching_the_store(pool: sqlx::PgPool) {
        let store = Store::new(pool);

        let result = post_request(
            &store,
            NewRequest {
                party_from: PartyId::new(10),
                party_to: PartyId::new(20),
                expand_group: false,
                subject: "x".repeat(1001),
                message: "hello".into(),
                max_retries: None,
            },
        )
        .await;

        assert!(matches!(result, Err(RequestApiError::Validation(_))));
        assert!(store.pending_requests().await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn cancel_is_idempotent_and_scoped_to_the_given_id(pool: sqlx::PgPool) {
        let store = Store::new(pool);

        let cancelled = post_request(
            &store,
            NewRequest {
                party_from: PartyId::new(10),
                party_to: PartyId::new(20),
                expand_group: false,
                subject: "hi".into(),
                message: "hello".into(),
                max_retries: Some(5),
            },
        )
        .await
        .unwrap();

        let untouched = post_request(
            &store,
            NewRequest {
                party_from: PartyId::new(11),
                party_to: PartyId::new(21),
                expand_group: false,
                subject: "hi".into(),
                message: "hello".into(),
                max_retries: None,
            },
        )
        .await
        .unwrap();

        cancel_request(&store, cancelled).await.unwrap();
        cancel_request(&store, cancelled).await.unwrap();

        let pending = store.pending_requests().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, untouched);
    }
}
