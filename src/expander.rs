//! Turn `pending` requests into per-recipient queue rows. Runs as the
//! first step of every dispatcher pass, with an open SMTP session already
//! in hand — expansion itself does no SMTP, but the dispatcher only calls
//! it once it knows it has somewhere to deliver to.

use crate::domain::PartyId;
use crate::party_directory::{PartyDirectory, PartyKind};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ExpanderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("directory error while expanding: {0}")]
    Directory(#[from] crate::party_directory::DirectoryError),
}

/// Expand every `pending` request into queue rows, then flip all of them to
/// `sending` in one set operation. Not re-entrant per request: a request
/// that has already left `pending` is never revisited.
#[tracing::instrument(name = "Expand pending requests", skip(store, directory))]
pub async fn expand(store: &Store, directory: &dyn PartyDirectory) -> Result<(), ExpanderError> {
    let pending = store.pending_requests().await?;

    if pending.is_empty() {
        return Ok(());
    }

    let mut transaction = store.begin().await?;

    for request in &pending {
        let recipients = recipients_for(directory, request.party_to, request.expand_group).await?;
        store
            .insert_queue_entries(&mut transaction, request.request_id, &recipients)
            .await?;
    }

    store.mark_pending_as_sending(&mut transaction).await?;
    transaction.commit().await.map_err(StoreError::from)?;

    Ok(())
}

/// The set of queue recipients for one request:
/// - `expand_group=no` → the target itself, one row.
/// - `expand_group=yes` and a group with members → one row per member.
/// - `expand_group=yes` and a group with no members (or a non-group target)
///   → one row addressed to the target itself (outer-join semantics).
async fn recipients_for(
    directory: &dyn PartyDirectory,
    party_to: PartyId,
    expand_group: bool,
) -> Result<Vec<PartyId>, ExpanderError> {
    if !expand_group {
        return Ok(vec![party_to]);
    }

    let party = directory.resolve(party_to).await?;
    if party.kind != PartyKind::Group {
        return Ok(vec![party_to]);
    }

    let members = directory.members_of(party_to).await?;
    if members.is_empty() {
        return Ok(vec![party_to]);
    }

    Ok(members)
}
