//! Persistence of final pipeline output.
//!
//! Write contract: upsert by document id, idempotent on replay. Concepts
//! and relationships for a document are replaced in one transaction; cost
//! records are append-only.

use anyhow::Result;
use sqlx::SqlitePool;

use docgraph_core::models::{
    Concept, CostRecord, Document, PipelineResult, RelationKind, Relationship, Structural,
};
use docgraph_core::similarity::{blob_to_vec, vec_to_blob};

/// Upsert the document row, keyed by content hash.
pub async fn upsert_document(pool: &SqlitePool, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, content_hash, page_count, doc_type, created_at, processed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(content_hash) DO UPDATE SET
            page_count = excluded.page_count,
            doc_type = excluded.doc_type,
            processed_at = excluded.processed_at
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.content_hash)
    .bind(doc.page_count)
    .bind(doc.doc_type.as_str())
    .bind(doc.created_at)
    .bind(doc.processed_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Look up the stored document id for a content hash.
pub async fn document_id_for_hash(pool: &SqlitePool, hash: &str) -> Result<Option<String>> {
    let id: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE content_hash = ?")
        .bind(hash)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Append cost records. Called for failed runs too: the spend happened
/// either way and the ledger is append-only.
pub async fn append_cost_records(pool: &SqlitePool, records: &[CostRecord]) -> Result<()> {
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO cost_records
                (id, document_id, service, input_units, output_units, cost, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.document_id)
        .bind(&record.service)
        .bind(record.input_units)
        .bind(record.output_units)
        .bind(record.cost)
        .bind(record.created_at)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Replace a document's concepts and relationships in one transaction.
/// Replaying the same result is a no-op-equivalent.
pub async fn persist_result(pool: &SqlitePool, result: &PipelineResult) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM relationships WHERE document_id = ?")
        .bind(&result.document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM concepts WHERE document_id = ?")
        .bind(&result.document_id)
        .execute(&mut *tx)
        .await?;

    for concept in &result.concepts {
        sqlx::query(
            r#"
            INSERT INTO concepts
                (id, document_id, term, definition, confidence, methods_json,
                 chunk_ids_json, page_number, embedding, merged_into, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&concept.id)
        .bind(&result.document_id)
        .bind(&concept.term)
        .bind(&concept.definition)
        .bind(concept.confidence)
        .bind(serde_json::to_string(&concept.methods_found)?)
        .bind(serde_json::to_string(&concept.chunk_ids)?)
        .bind(concept.page_number)
        .bind(concept.embedding.as_deref().map(vec_to_blob))
        .bind(&concept.merged_into)
        .bind(concept.created_at)
        .execute(&mut *tx)
        .await?;
    }

    for rel in &result.relationships {
        sqlx::query(
            r#"
            INSERT INTO relationships
                (id, document_id, from_concept, to_concept, kind, strength, structural)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rel.id)
        .bind(&result.document_id)
        .bind(&rel.from_concept)
        .bind(&rel.to_concept)
        .bind(rel.kind.as_str())
        .bind(rel.strength)
        .bind(rel.structural.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Load a document's concepts, canonical first, strongest first.
pub async fn concepts_for_document(pool: &SqlitePool, document_id: &str) -> Result<Vec<Concept>> {
    let rows: Vec<(
        String,
        String,
        String,
        f64,
        String,
        String,
        i64,
        Option<Vec<u8>>,
        Option<String>,
        i64,
    )> = sqlx::query_as(
        r#"
        SELECT id, term, definition, confidence, methods_json, chunk_ids_json,
               page_number, embedding, merged_into, created_at
        FROM concepts
        WHERE document_id = ?
        ORDER BY (merged_into IS NOT NULL), confidence DESC, term ASC
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    let mut concepts = Vec::with_capacity(rows.len());
    for (
        id,
        term,
        definition,
        confidence,
        methods_json,
        chunk_ids_json,
        page_number,
        embedding,
        merged_into,
        created_at,
    ) in rows
    {
        concepts.push(Concept {
            id,
            term,
            definition,
            confidence,
            methods_found: serde_json::from_str(&methods_json).unwrap_or_default(),
            chunk_ids: serde_json::from_str(&chunk_ids_json).unwrap_or_default(),
            page_number,
            embedding: embedding.as_deref().map(blob_to_vec),
            merged_into,
            created_at,
        });
    }
    Ok(concepts)
}

/// Load a document's relationships.
pub async fn relationships_for_document(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<Relationship>> {
    let rows: Vec<(String, String, String, String, f64, String)> = sqlx::query_as(
        r#"
        SELECT id, from_concept, to_concept, kind, strength, structural
        FROM relationships
        WHERE document_id = ?
        ORDER BY strength DESC
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, from_concept, to_concept, kind, strength, structural)| {
            Some(Relationship {
                id,
                from_concept,
                to_concept,
                kind: RelationKind::parse(&kind)?,
                strength,
                structural: Structural::parse(&structural),
            })
        })
        .collect())
}

/// Total recorded spend per service, most expensive first.
pub async fn cost_summary(pool: &SqlitePool) -> Result<Vec<(String, i64, f64)>> {
    let rows: Vec<(String, i64, f64)> = sqlx::query_as(
        r#"
        SELECT service, COUNT(*), SUM(cost)
        FROM cost_records
        GROUP BY service
        ORDER BY SUM(cost) DESC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
