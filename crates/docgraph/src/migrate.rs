use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL UNIQUE,
            page_count INTEGER NOT NULL,
            doc_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            processed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS concepts (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            term TEXT NOT NULL,
            definition TEXT NOT NULL DEFAULT '',
            confidence REAL NOT NULL,
            methods_json TEXT NOT NULL DEFAULT '[]',
            chunk_ids_json TEXT NOT NULL DEFAULT '[]',
            page_number INTEGER NOT NULL,
            embedding BLOB,
            merged_into TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            from_concept TEXT NOT NULL,
            to_concept TEXT NOT NULL,
            kind TEXT NOT NULL,
            strength REAL NOT NULL,
            structural TEXT NOT NULL,
            UNIQUE(document_id, from_concept, to_concept),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cost_records (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            service TEXT NOT NULL,
            input_units INTEGER NOT NULL,
            output_units INTEGER NOT NULL,
            cost REAL NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            content_hash TEXT PRIMARY KEY,
            result_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_concepts_document_id ON concepts(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relationships_document_id ON relationships(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cost_records_document_id ON cost_records(document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
