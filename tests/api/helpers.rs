use std::time::Duration;

use notify_dispatch::configuration::{get_configuration, DatabaseSettings};
use notify_dispatch::startup::{get_connection_pool, Application};
use notify_dispatch::store::Store;
use notify_dispatch::telemetry::{get_subscriber, init_subscriber};
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

// Initializes tracing once per process, except the default is silent:
// these tests only need the subscriber when `TEST_LOG` is set.
static TRACING: std::sync::Once = std::sync::Once::new();

pub struct TestApp {
    pub address: String,
    pub db_pool: PgPool,
    pub store: Store,
    pub api_client: reqwest::Client,
}

impl TestApp {
    pub async fn post_request(&self, body: serde_json::Value) -> reqwest::Response {
        self.api_client
            .post(format!("{}/requests", &self.address))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn cancel_request(&self, request_id: i64) -> reqwest::Response {
        self.api_client
            .post(format!("{}/requests/{}/cancel", &self.address, request_id))
            .send()
            .await
            .expect("Failed to execute request")
    }
}

pub async fn spawn_app() -> TestApp {
    TRACING.call_once(|| {
        if std::env::var("TEST_LOG").is_ok() {
            let subscriber = get_subscriber("test".into(), "debug".into(), std::io::stdout);
            init_subscriber(subscriber);
        }
    });

    let configuration = {
        let mut c = get_configuration().expect("Failed to read configuration");
        c.database.database_name = Uuid::new_v4().to_string();
        c.application.port = 0;
        // The scheduler is never wired up in these tests: the dispatcher is
        // invoked directly against a scripted fake SMTP server instead.
        c.scheduler.interval_minutes = None;
        c
    };

    configure_database(&configuration.database).await;

    let application = Application::build(configuration.clone())
        .await
        .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", application.port());
    tokio::spawn(application.run_until_stopped());

    let db_pool = get_connection_pool(&configuration.database);

    TestApp {
        address,
        store: Store::new(db_pool.clone()),
        db_pool,
        api_client: reqwest::Client::new(),
    }
}

async fn configure_database(config: &DatabaseSettings) {
    let mut connection = PgConnection::connect_with(&config.without_db())
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(format!(r#"CREATE DATABASE "{}";"#, config.database_name).as_str())
        .await
        .expect("Failed to create database");

    let connection_pool = PgPool::connect_with(config.with_db())
        .await
        .expect("Failed to connect to Postgres");
    sqlx::migrate!("./migrations")
        .run(&connection_pool)
        .await
        .expect("Failed to migrate the database");
}

/// A scripted fake SMTP server, for driving the dispatcher end to end
/// without a real MTA: it writes each line in `script` in order, reading
/// (and discarding) one command before every reply after the greeting.
pub async fn fake_smtp_server(script: Vec<&'static str>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut script = script.into_iter();

        if let Some(greeting) = script.next() {
            socket.write_all(greeting.as_bytes()).await.unwrap();
        }

        let mut buf = vec![0u8; 65536];
        for reply in script {
            let _ = socket.read(&mut buf).await;
            socket.write_all(reply.as_bytes()).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    });

    addr
}
