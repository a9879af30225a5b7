use crate::models::{File, FileId};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

pub async fn create_file(
    pool: &Pool<Sqlite>,
    filename: &str,
    total_chunks: i64,
    created_at: DateTime<Utc>,
) -> Result<File, sqlx::Error> {
    sqlx::query_as::<_, File>(
        r#"
        INSERT INTO files (filename, total_chunks, created_at)
        VALUES (?, ?, ?)
        RETURNING id, filename, total_chunks, created_at
        "#,
    )
    .bind(filename)
    .bind(total_chunks)
    .bind(created_at)
    .fetch_one(pool)
    .await
}

pub async fn get_file_by_id(pool: &Pool<Sqlite>, file_id: FileId) -> Result<Option<File>, sqlx::Error> {
    sqlx::query_as::<_, File>(
        r#"
        SELECT id, filename, total_chunks, created_at
        FROM files
        WHERE id = ?
        "#,
    )
    .bind(file_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_all_files(pool: &Pool<Sqlite>) -> Result<Vec<File>, sqlx::Error> {
    sqlx::query_as::<_, File>(
        r#"
        SELECT id, filename, total_chunks, created_at
        FROM files
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await
}
