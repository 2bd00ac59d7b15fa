//! Deliver queued rows in sender/recipient-grouped batches. This is
//! where the request/queue state machine, the Expander, and the SMTP
//! client meet: `process_queue` is the dispatcher's single entry point,
//! invoked by the scheduler hook or directly in tests.

use crate::domain::PartyId;
use crate::expander::{self, ExpanderError};
use crate::party_directory::PartyDirectory;
use crate::smtp::{SmtpClient, SmtpError, SmtpReply, SmtpSession};
use crate::store::{DeliverableRow, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Expander(#[from] ExpanderError),
    #[error("directory error during dispatch: {0}")]
    Directory(#[from] crate::party_directory::DirectoryError),
}

const UNKNOWN_SENDER: &str = "unknown@unknown.com";

/// Memoizes party → email resolution for the lifetime of one dispatch pass,
/// since the same sender/recipient typically recurs across many rows.
#[derive(Default)]
struct EmailCache {
    resolved: std::collections::HashMap<PartyId, Option<String>>,
}

impl EmailCache {
    async fn email_of(
        &mut self,
        directory: &dyn PartyDirectory,
        party_id: PartyId,
    ) -> Result<Option<String>, crate::party_directory::DirectoryError> {
        if let Some(email) = self.resolved.get(&party_id) {
            return Ok(email.clone());
        }

        let email = match directory.resolve(party_id).await {
            Ok(party) => party.email,
            // A party the directory doesn't recognize is, for delivery
            // purposes, indistinguishable from one with no email on file.
            Err(crate::party_directory::DirectoryError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        self.resolved.insert(party_id, email.clone());
        Ok(email)
    }
}

/// The coalescing state machine's state: either idle, or a DATA section is
/// open for a given `(party_from, party_to)` pair.
#[derive(PartialEq, Eq)]
enum BatchState {
    Idle,
    DataOpen {
        from: PartyId,
        to: PartyId,
        /// The reply that accepted this envelope, recorded against every
        /// row folded into it.
        accepted_reply: SmtpReply,
    },
}

/// Run one dispatch pass: expand pending requests, stream deliverable rows
/// through a single SMTP session, and reconcile request status from the
/// resulting queue state.
#[tracing::instrument(name = "Process the notification queue", skip(store, directory, smtp, host))]
pub async fn process_queue(
    store: &Store,
    directory: &dyn PartyDirectory,
    smtp: &SmtpClient,
    host: &str,
    port: u16,
) -> Result<(), DispatcherError> {
    store.touch_job_last_run().await?;

    if !store.has_active_requests().await? {
        return Ok(());
    }

    let mut session = match smtp.open(host, port).await {
        Ok((session, _)) => session,
        Err(e) => {
            let (code, message) = classify(&e);
            store
                .bulk_retry_on_connection_failure(code, &message)
                .await?;
            store.reconcile().await?;
            return Ok(());
        }
    };

    expander::expand(store, directory).await?;

    let rows = store.deliverable_rows().await?;
    let mut emails = EmailCache::default();
    let mut state = BatchState::Idle;

    for row in rows {
        // a row whose
        // recipient the directory can't address is out of scope for this
        // pass entirely — skipped, not charged a retry.
        let Some(to_email) = emails.email_of(directory, row.party_to).await? else {
            continue;
        };
        let from_email = emails
            .email_of(directory, row.party_from)
            .await?
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());

        if let BatchState::DataOpen { from, to, .. } = &state {
            if *from != row.party_from || *to != row.party_to {
                let _ = smtp.close_data(&mut session).await;
                state = BatchState::Idle;
            }
        }

        let accepted_reply = match &state {
            BatchState::DataOpen { accepted_reply, .. } => accepted_reply.clone(),
            BatchState::Idle => {
                match open_envelope(smtp, &mut session, &row, &from_email, &to_email).await {
                    Ok(reply) => {
                        state = BatchState::DataOpen {
                            from: row.party_from,
                            to: row.party_to,
                            accepted_reply: reply.clone(),
                        };
                        reply
                    }
                    Err(e) => {
                        record_failure(store, &row, &e).await?;
                        continue;
                    }
                }
            }
        };

        match append_body(smtp, &mut session, &row).await {
            Ok(()) => {
                store
                    .record_row_success(
                        row.request_id,
                        row.party_to,
                        accepted_reply.code as i32,
                        &accepted_reply.text,
                    )
                    .await?;
            }
            Err(e) => {
                let _ = smtp.close_data(&mut session).await;
                state = BatchState::Idle;
                record_failure(store, &row, &e).await?;
            }
        }
    }

    store.reconcile().await?;

    if matches!(state, BatchState::DataOpen { .. }) {
        let _ = smtp.close_data(&mut session).await;
    }
    smtp.close(&mut session).await;

    Ok(())
}

/// `MAIL FROM` / `RCPT TO` / `DATA` / headers for a new `(from, to)`
/// envelope. Returns the reply that accepted the envelope (used as the
/// recorded reply for every row folded into it).
async fn open_envelope(
    smtp: &SmtpClient,
    session: &mut SmtpSession,
    row: &DeliverableRow,
    from_email: &str,
    to_email: &str,
) -> Result<SmtpReply, SmtpError> {
    smtp.mail_from(session, from_email).await?;
    let rcpt_reply = smtp.rcpt_to(session, to_email).await?;
    smtp.open_data(session).await?;
    smtp.write_headers(session, from_email, to_email, &row.subject, row.request_date)
        .await?;

    Ok(rcpt_reply)
}

/// Append one row's body to the currently-open DATA section: the
/// `Message sent on ... regarding ...` marker line, then the body in
/// chunks.
async fn append_body(
    smtp: &SmtpClient,
    session: &mut SmtpSession,
    row: &DeliverableRow,
) -> Result<(), SmtpError> {
    let pretty_date = row.request_date.format("%a, %d %b %Y %H:%M:%S");
    smtp.write_string(
        session,
        &format!("\n\nMessage sent on {} regarding {}\n\n", pretty_date, row.subject),
    )
    .await?;
    smtp.write_chunks(session, &row.message).await
}

async fn record_failure(
    store: &Store,
    row: &DeliverableRow,
    error: &SmtpError,
) -> Result<(), StoreError> {
    let (code, message) = classify(error);
    store
        .record_row_failure(row.request_id, row.party_to, code, &message)
        .await
}

fn classify(error: &SmtpError) -> (Option<i32>, String) {
    match error {
        SmtpError::Transient(reply) | SmtpError::Permanent(reply) => {
            (Some(reply.code as i32), reply.text.clone())
        }
        SmtpError::Local(message) => (None, message.clone()),
    }
}
