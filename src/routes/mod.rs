mod health_check;
mod requests;

pub use health_check::health_check;
pub use requests::{cancel_request, post_request};

/// Render an error alongside its full `source()` chain.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;

    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }

    Ok(())
}
