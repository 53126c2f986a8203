//! Database helpers: pool, migrations and the `form_submissions` table.

use chrono::{DateTime, FixedOffset, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::geo::GeoLocation;
use crate::submission::EmailSubmission;

/// A stored contact form entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FormSubmission {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
    pub sent_ts: DateTime<FixedOffset>,
    pub client_ip: String,
    pub ip_city: String,
    pub ip_region: String,
    pub ip_country: String,
}

/// A submission that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub struct NewFormSubmission {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
    pub sent_ts: DateTime<FixedOffset>,
    pub client_ip: String,
    pub ip_city: String,
    pub ip_region: String,
    pub ip_country: String,
}

impl NewFormSubmission {
    /// Stamps `sent_ts` with the current time in `offset`.
    pub fn new(
        submission: &EmailSubmission,
        client_ip: String,
        location: GeoLocation,
        offset: FixedOffset,
    ) -> NewFormSubmission {
        NewFormSubmission {
            name: submission.name.clone(),
            email: submission.email.to_string(),
            subject: submission.subject.clone(),
            message: submission.message.clone(),
            sent_ts: Utc::now().with_timezone(&offset),
            client_ip,
            ip_city: location.city,
            ip_region: location.region,
            ip_country: location.country,
        }
    }
}

/// Opens the pool. File databases are created when missing; in-memory ones
/// keep exactly one connection alive for the life of the pool, because the
/// database disappears with it.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    if database_url.contains(":memory:") {
        return SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await;
    }

    if let Some(parent) = options.clone().get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Creates the table and its indexes if absent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS form_submissions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            subject TEXT NOT NULL,
            message TEXT NOT NULL,
            sent_ts TEXT NOT NULL,
            client_ip TEXT NOT NULL,
            ip_city TEXT NOT NULL,
            ip_region TEXT NOT NULL,
            ip_country TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_form_submissions_email ON form_submissions (email)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_form_submissions_client_ip ON form_submissions (client_ip)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Inserts `record` in its own transaction and returns the assigned id.
///
/// The transaction rolls back when dropped before commit, so every early
/// return releases the connection.
pub async fn insert(pool: &SqlitePool, record: &NewFormSubmission) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let id = sqlx::query(
        "INSERT INTO form_submissions (name, email, subject, message, sent_ts, client_ip, ip_city, ip_region, ip_country) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.name)
    .bind(&record.email)
    .bind(&record.subject)
    .bind(&record.message)
    .bind(record.sent_ts)
    .bind(&record.client_ip)
    .bind(&record.ip_city)
    .bind(&record.ip_region)
    .bind(&record.ip_country)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();
    tx.commit().await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::EmailAddress;

    async fn memory_pool() -> SqlitePool {
        let pool = connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn record(name: &str) -> NewFormSubmission {
        let submission = EmailSubmission {
            name: name.into(),
            email: EmailAddress::parse("ann@example.com").unwrap(),
            subject: "Hi".into(),
            message: "Hello there".into(),
        };
        NewFormSubmission::new(
            &submission,
            "203.0.113.7".into(),
            GeoLocation {
                city: "Pune".into(),
                region: "Maharashtra".into(),
                country: "IN".into(),
            },
            FixedOffset::east_opt(19800).unwrap(),
        )
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_keeps_fields() {
        let pool = memory_pool().await;
        let first = insert(&pool, &record("Ann")).await.unwrap();
        let second = insert(&pool, &record("Bob")).await.unwrap();
        assert_ne!(first, second);

        let rows: Vec<FormSubmission> =
            sqlx::query_as("SELECT * FROM form_submissions ORDER BY id")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, first);
        assert_eq!(rows[0].name, "Ann");
        assert_eq!(rows[0].email, "ann@example.com");
        assert_eq!(rows[0].client_ip, "203.0.113.7");
        assert_eq!(rows[0].ip_region, "Maharashtra");
        assert_eq!(rows[0].sent_ts.offset().local_minus_utc(), 19800);
        assert_eq!(rows[1].name, "Bob");
    }

    #[tokio::test]
    async fn file_database_and_parent_dir_are_created() {
        let dir = std::env::temp_dir().join(format!(
            "form-mailer-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path = dir.join("nested").join("submissions.db");
        let pool = connect(&format!("sqlite://{}", path.display())).await.unwrap();
        run_migrations(&pool).await.unwrap();
        insert(&pool, &record("Ann")).await.unwrap();
        pool.close().await;

        assert!(path.exists());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn memory_pool_keeps_its_only_connection() {
        let pool = memory_pool().await;
        let options = pool.options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);

        insert(&pool, &record("Ann")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        insert(&pool, &record("Bob")).await.unwrap();
    }

    #[tokio::test]
    async fn insert_fails_on_closed_pool() {
        let pool = memory_pool().await;
        pool.close().await;
        assert!(insert(&pool, &record("Ann")).await.is_err());
    }
}
