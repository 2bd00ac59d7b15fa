mod party_id;
mod subject;

pub use party_id::PartyId;
pub use subject::Subject;
