//! Party directory adapter. The directory itself is an external
//! collaborator the core only consumes through this trait; the Postgres
//! implementation below is a thin, swappable default so the crate runs
//! end to end without a real directory service wired in.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::domain::PartyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyKind {
    Individual,
    Group,
}

#[derive(Debug, Clone)]
pub struct Party {
    pub name: String,
    pub email: Option<String>,
    pub kind: PartyKind,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("party {0} is not known to the directory")]
    NotFound(PartyId),
    #[error("directory lookup failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Resolve party ids to display/contact information, and enumerate a
/// group's approved members. No side effects.
#[async_trait]
pub trait PartyDirectory: Send + Sync {
    async fn resolve(&self, party_id: PartyId) -> Result<Party, DirectoryError>;

    /// The approved members of a group, snapshotted at call time. Empty for
    /// a group with no members, or for an individual party id.
    async fn members_of(&self, group_id: PartyId) -> Result<Vec<PartyId>, DirectoryError>;
}

pub struct PostgresPartyDirectory {
    pool: PgPool,
}

impl PostgresPartyDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PartyDirectory for PostgresPartyDirectory {
    #[tracing::instrument(name = "Resolve a party", skip(self))]
    async fn resolve(&self, party_id: PartyId) -> Result<Party, DirectoryError> {
        let record = sqlx::query!(
            r#"SELECT name, email, is_group FROM parties WHERE party_id = $1"#,
            party_id.get(),
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DirectoryError::NotFound(party_id))?;

        Ok(Party {
            name: record.name,
            email: record.email,
            kind: if record.is_group {
                PartyKind::Group
            } else {
                PartyKind::Individual
            },
        })
    }

    #[tracing::instrument(name = "List a group's approved members", skip(self))]
    async fn members_of(&self, group_id: PartyId) -> Result<Vec<PartyId>, DirectoryError> {
        let records = sqlx::query!(
            r#"SELECT member_id FROM party_members WHERE group_id = $1"#,
            group_id.get(),
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(|r| PartyId::new(r.member_id)).collect())
    }
}

/// An in-memory double of the directory, for unit tests that exercise the
/// Expander/Dispatcher without a database-backed directory.
#[derive(Default)]
pub struct InMemoryPartyDirectory {
    parties: HashMap<PartyId, Party>,
    members: HashMap<PartyId, Vec<PartyId>>,
}

impl InMemoryPartyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_individual(mut self, id: PartyId, name: &str, email: Option<&str>) -> Self {
        self.parties.insert(
            id,
            Party {
                name: name.to_string(),
                email: email.map(str::to_string),
                kind: PartyKind::Individual,
            },
        );
        self
    }

    pub fn with_group(mut self, id: PartyId, name: &str, members: Vec<PartyId>) -> Self {
        self.parties.insert(
            id,
            Party {
                name: name.to_string(),
                email: None,
                kind: PartyKind::Group,
            },
        );
        self.members.insert(id, members);
        self
    }
}

#[async_trait]
impl PartyDirectory for InMemoryPartyDirectory {
    async fn resolve(&self, party_id: PartyId) -> Result<Party, DirectoryError> {
        self.parties
            .get(&party_id)
            .cloned()
            .ok_or(DirectoryError::NotFound(party_id))
    }

    async fn members_of(&self, group_id: PartyId) -> Result<Vec<PartyId>, DirectoryError> {
        Ok(self.members.get(&group_id).cloned().unwrap_or_default())
    }
}
