//! Process entry point for the periodic dispatcher: one function the
//! binary spawns once, wiring configuration into the Store, party
//! directory, and SMTP client, then running until stopped.

use std::sync::Arc;

use crate::configuration::Settings;
use crate::party_directory::{PartyDirectory, PostgresPartyDirectory};
use crate::scheduler::Scheduler;
use crate::smtp::SmtpClient;
use crate::startup::get_connection_pool;
use crate::store::Store;

pub async fn run_worker_until_stopped(configuration: Settings) -> Result<(), anyhow::Error> {
    let connection_pool = get_connection_pool(&configuration.database);
    let store = Arc::new(Store::new(connection_pool.clone()));
    let directory: Arc<dyn PartyDirectory> =
        Arc::new(PostgresPartyDirectory::new(connection_pool));
    let smtp = Arc::new(SmtpClient::new(
        configuration.smtp.helo_identity.clone(),
        std::time::Duration::from_millis(configuration.smtp.connect_timeout_ms),
        std::time::Duration::from_millis(configuration.smtp.io_timeout_ms),
    ));

    let scheduler = Scheduler::new();
    scheduler
        .schedule_process(
            store,
            directory,
            smtp,
            configuration.smtp.host.clone(),
            configuration.smtp.port,
            configuration.scheduler.interval_minutes,
        )
        .await?;

    match scheduler.take_handle().await {
        Some(handle) => {
            handle.await?;
            Ok(())
        }
        // `interval_minutes = None`: nothing was registered to run.
        None => std::future::pending().await,
    }
}
