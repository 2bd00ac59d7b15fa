use crate::helpers::{fake_smtp_server, spawn_app};
use notify_dispatch::dispatcher::process_queue;
use notify_dispatch::party_directory::PostgresPartyDirectory;
use notify_dispatch::smtp::SmtpClient;
use std::time::Duration;

fn smtp_client() -> SmtpClient {
    SmtpClient::new("me".into(), Duration::from_secs(5), Duration::from_secs(5))
}

async fn seed_individual(pool: &sqlx::PgPool, id: i64, name: &str, email: Option<&str>) {
    sqlx::query!(
        r#"INSERT INTO parties (party_id, name, email, is_group) VALUES ($1, $2, $3, false)"#,
        id,
        name,
        email,
    )
    .execute(pool)
    .await
    .unwrap();
}

async fn seed_group(pool: &sqlx::PgPool, id: i64, name: &str, members: &[i64]) {
    sqlx::query!(
        r#"INSERT INTO parties (party_id, name, email, is_group) VALUES ($1, $2, NULL, true)"#,
        id,
        name,
    )
    .execute(pool)
    .await
    .unwrap();

    for member in members {
        sqlx::query!(
            r#"INSERT INTO party_members (group_id, member_id) VALUES ($1, $2)"#,
            id,
            member,
        )
        .execute(pool)
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn posting_a_request_returns_200_and_an_allocated_id() {
    let app = spawn_app().await;

    let response = app
        .post_request(serde_json::json!({
            "party_from": 10,
            "party_to": 20,
            "expand_group": false,
            "subject": "hi",
            "message": "hello there",
        }))
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["request_id"].as_i64().unwrap() >= 1000);
}

#[tokio::test]
async fn an_oversized_subject_is_rejected_with_400() {
    let app = spawn_app().await;

    let response = app
        .post_request(serde_json::json!({
            "party_from": 10,
            "party_to": 20,
            "expand_group": false,
            "subject": "x".repeat(1001),
            "message": "hello",
        }))
        .await;

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn end_to_end_happy_path_delivers_to_a_single_individual() {
    let app = spawn_app().await;
    seed_individual(&app.db_pool, 10, "bob", Some("bob@b")).await;
    seed_individual(&app.db_pool, 20, "alice", Some("alice@a")).await;

    let response = app
        .post_request(serde_json::json!({
            "party_from": 10,
            "party_to": 20,
            "expand_group": false,
            "subject": "hi",
            "message": "x".repeat(100),
        }))
        .await;
    let body: serde_json::Value = response.json().await.unwrap();
    let request_id = body["request_id"].as_i64().unwrap();

    let addr = fake_smtp_server(vec![
        "220 hello\r\n",
        "250 hi\r\n",
        "250 sender ok\r\n",
        "251 recipient ok\r\n",
        "354 go ahead\r\n",
        "250 message accepted\r\n",
        "221 bye\r\n",
    ])
    .await;

    let directory = PostgresPartyDirectory::new(app.db_pool.clone());
    process_queue(&app.store, &directory, &smtp_client(), &addr.ip().to_string(), addr.port())
        .await
        .unwrap();

    let request = sqlx::query!(
        r#"SELECT status AS "status: String", fulfill_date FROM requests WHERE request_id = $1"#,
        request_id,
    )
    .fetch_one(&app.db_pool)
    .await
    .unwrap();
    assert_eq!(request.status, "sent");
    assert!(request.fulfill_date.is_some());
}

#[tokio::test]
async fn group_expansion_delivers_to_every_member() {
    let app = spawn_app().await;
    seed_individual(&app.db_pool, 10, "bob", Some("bob@b")).await;
    seed_individual(&app.db_pool, 40, "carl", Some("carl@c")).await;
    seed_individual(&app.db_pool, 50, "dana", Some("dana@d")).await;
    seed_group(&app.db_pool, 30, "team", &[40, 50]).await;

    let response = app
        .post_request(serde_json::json!({
            "party_from": 10,
            "party_to": 30,
            "expand_group": true,
            "subject": "hi team",
            "message": "announcement",
        }))
        .await;
    let body: serde_json::Value = response.json().await.unwrap();
    let request_id = body["request_id"].as_i64().unwrap();

    // Two recipients, one coalesced DATA section each: HELO + two full
    // MAIL/RCPT/DATA/body cycles.
    let addr = fake_smtp_server(vec![
        "220 hello\r\n",
        "250 hi\r\n",
        "250 sender ok\r\n",
        "251 recipient ok\r\n",
        "354 go ahead\r\n",
        "250 message accepted\r\n",
        "250 sender ok\r\n",
        "251 recipient ok\r\n",
        "354 go ahead\r\n",
        "250 message accepted\r\n",
        "221 bye\r\n",
    ])
    .await;

    let directory = PostgresPartyDirectory::new(app.db_pool.clone());
    process_queue(&app.store, &directory, &smtp_client(), &addr.ip().to_string(), addr.port())
        .await
        .unwrap();

    let rows = sqlx::query!(
        r#"SELECT is_successful FROM queue_entries WHERE request_id = $1"#,
        request_id,
    )
    .fetch_all(&app.db_pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.is_successful));

    let request = sqlx::query!(
        r#"SELECT status AS "status: String" FROM requests WHERE request_id = $1"#,
        request_id,
    )
    .fetch_one(&app.db_pool)
    .await
    .unwrap();
    assert_eq!(request.status, "sent");
}

#[tokio::test]
async fn cancelling_before_any_dispatch_leaves_the_request_cancelled_forever() {
    let app = spawn_app().await;
    seed_individual(&app.db_pool, 10, "bob", Some("bob@b")).await;
    seed_individual(&app.db_pool, 20, "alice", Some("alice@a")).await;

    let response = app
        .post_request(serde_json::json!({
            "party_from": 10,
            "party_to": 20,
            "expand_group": false,
            "subject": "hi",
            "message": "hello",
            "max_retries": 5,
        }))
        .await;
    let body: serde_json::Value = response.json().await.unwrap();
    let request_id = body["request_id"].as_i64().unwrap();

    let cancel_response = app.cancel_request(request_id).await;
    assert_eq!(cancel_response.status().as_u16(), 200);

    // Idempotent: a second cancel is still a no-op on an already-terminal
    // request.
    let second_cancel = app.cancel_request(request_id).await;
    assert_eq!(second_cancel.status().as_u16(), 200);

    let directory = PostgresPartyDirectory::new(app.db_pool.clone());
    // No fake server is even listening: a cancelled request must never
    // reach the expansion/delivery path.
    process_queue(
        &app.store,
        &directory,
        &smtp_client(),
        "127.0.0.1",
        1,
    )
    .await
    .unwrap();

    let request = sqlx::query!(
        r#"SELECT status AS "status: String" FROM requests WHERE request_id = $1"#,
        request_id,
    )
    .fetch_one(&app.db_pool)
    .await
    .unwrap();
    assert_eq!(request.status, "cancelled");
}
