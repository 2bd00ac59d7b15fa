//! A hand-rolled SMTP client wrapper: just enough of the protocol to
//! drive outbound deliveries the way the dispatcher needs them — HELO,
//! MAIL FROM, RCPT TO with 551-forward chasing, chunked DATA, QUIT. No
//! AUTH/STARTTLS, no MIME, no VRFY/EXPN.

mod client;
mod error;
mod reply;

pub use client::{SmtpClient, SmtpSession, CHUNK_SIZE};
pub use error::SmtpError;
pub use reply::SmtpReply;
