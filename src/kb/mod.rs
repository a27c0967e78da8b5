use crate::billing::usage::{self, Metric};
use crate::shared::context::TenantContext;
use crate::shared::error::ServiceError;
use crate::shared::models::schema::{document_chunks, documents};
use crate::shared::models::{Document, DocumentChunk, DocumentStatus};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: [&str; 6] = ["pdf", "txt", "md", "docx", "html", "csv"];
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const CHUNK_CHARS: usize = 1200;
const MIN_EXTRACTABLE_CHARS: usize = 32;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/kb/documents", post(upload_document))
        .route("/api/kb/documents", get(list_documents))
        .route("/api/kb/documents/:id", delete(archive_document))
        .route("/api/kb/search", get(search))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkHit {
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub score: usize,
}

/// Upload gate: extension whitelist first, then the size cap. Violations
/// surface the supported list so widget authors can self-serve.
pub fn validate_upload(file_name: &str, size: usize) -> Result<(), ServiceError> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ServiceError::Validation(format!(
            "unsupported file type .{}; supported: {}",
            extension,
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(ServiceError::Validation(format!(
            "file exceeds the {} MB limit",
            MAX_UPLOAD_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

/// Splits extracted text into ~CHUNK_CHARS chunks on word boundaries.
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + word.len() + 1 > chunk_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn upload_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Document>), ServiceError> {
    let mut file_name = None;
    let mut content_type = "application/octet-stream".to_string();
    let mut bytes = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::Validation(format!("malformed multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            file_name = field.file_name().map(|s| s.to_string());
            if let Some(ct) = field.content_type() {
                content_type = ct.to_string();
            }
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::Validation(format!("upload truncated: {}", e)))?,
            );
        }
    }

    let file_name = file_name
        .ok_or_else(|| ServiceError::Validation("multipart field 'file' is required".into()))?;
    let bytes = bytes
        .ok_or_else(|| ServiceError::Validation("multipart field 'file' is required".into()))?;

    validate_upload(&file_name, bytes.len())?;

    let conn = state.conn.clone();
    let tenant_id = ctx.tenant_id;
    let name_for_row = file_name.clone();
    let size = bytes.len() as i64;
    let ct = content_type.clone();
    let document = run_blocking(move || {
        let mut db = conn.get()?;
        usage::check_quota(&mut db, tenant_id, Metric::Documents)?;

        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4(),
            tenant_id,
            file_name: name_for_row,
            content_type: ct,
            size_bytes: size,
            status: DocumentStatus::Uploaded.as_str().to_string(),
            chunk_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(documents::table)
            .values(&document)
            .execute(&mut db)?;
        usage::record_usage(&mut db, tenant_id, Metric::Documents)?;
        Ok(document)
    })
    .await?;

    info!(
        "document {} ({} bytes) uploaded for tenant {}",
        document.id, size, tenant_id
    );

    // Chunking runs off-request; status moves uploaded -> processing ->
    // processed/failed.
    let state_for_job = state.clone();
    let document_id = document.id;
    tokio::spawn(async move {
        process_document(state_for_job, tenant_id, document_id, bytes.to_vec()).await;
    });

    Ok((StatusCode::CREATED, Json(document)))
}

pub async fn process_document(
    state: Arc<AppState>,
    tenant_id: Uuid,
    document_id: Uuid,
    raw: Vec<u8>,
) {
    let conn = state.conn.clone();
    let outcome = run_blocking(move || {
        let mut db = conn.get()?;

        diesel::update(documents::table.filter(documents::id.eq(document_id)))
            .set((
                documents::status.eq(DocumentStatus::Processing.as_str()),
                documents::updated_at.eq(Utc::now()),
            ))
            .execute(&mut db)?;

        let text = String::from_utf8_lossy(&raw)
            .chars()
            .filter(|c| !c.is_control() || c.is_whitespace())
            .collect::<String>();
        if text.trim().len() < MIN_EXTRACTABLE_CHARS {
            return Err(ServiceError::Validation(
                "no extractable text in document".into(),
            ));
        }

        let chunks = chunk_text(&text, CHUNK_CHARS);
        db.transaction::<(), ServiceError, _>(|db| {
            for (i, content) in chunks.iter().enumerate() {
                let chunk = DocumentChunk {
                    id: Uuid::new_v4(),
                    document_id,
                    tenant_id,
                    chunk_index: i as i32,
                    content: content.clone(),
                };
                diesel::insert_into(document_chunks::table)
                    .values(&chunk)
                    .execute(db)?;
            }
            diesel::update(documents::table.filter(documents::id.eq(document_id)))
                .set((
                    documents::status.eq(DocumentStatus::Processed.as_str()),
                    documents::chunk_count.eq(chunks.len() as i32),
                    documents::updated_at.eq(Utc::now()),
                ))
                .execute(db)?;
            Ok(())
        })?;

        Ok(chunks.len())
    })
    .await;

    match outcome {
        Ok(count) => info!("document {} processed into {} chunks", document_id, count),
        Err(e) => {
            error!("document {} processing failed: {}", document_id, e);
            let conn = state.conn.clone();
            let reason = e.to_string();
            let _ = run_blocking(move || {
                let mut db = conn.get()?;
                diesel::update(documents::table.filter(documents::id.eq(document_id)))
                    .set((
                        documents::status.eq(DocumentStatus::Failed.as_str()),
                        documents::error_message.eq(Some(reason)),
                        documents::updated_at.eq(Utc::now()),
                    ))
                    .execute(&mut db)
                    .map_err(ServiceError::from)
            })
            .await;
        }
    }
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<Json<Vec<Document>>, ServiceError> {
    let conn = state.conn.clone();
    let list = run_blocking(move || {
        let mut db = conn.get()?;
        let list = documents::table
            .filter(documents::tenant_id.eq(ctx.tenant_id))
            .filter(documents::status.ne(DocumentStatus::Archived.as_str()))
            .order(documents::created_at.desc())
            .load::<Document>(&mut db)?;
        Ok(list)
    })
    .await?;
    Ok(Json(list))
}

async fn archive_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let conn = state.conn.clone();
    run_blocking(move || {
        let mut db = conn.get()?;
        let archived = diesel::update(
            documents::table
                .filter(documents::id.eq(id))
                .filter(documents::tenant_id.eq(ctx.tenant_id)),
        )
        .set((
            documents::status.eq(DocumentStatus::Archived.as_str()),
            documents::updated_at.eq(Utc::now()),
        ))
        .execute(&mut db)?;
        if archived == 0 {
            return Err(ServiceError::NotFound);
        }
        Ok(())
    })
    .await?;
    Ok(Json(serde_json::json!({ "archived": id })))
}

async fn search(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<ChunkHit>>, ServiceError> {
    if params.q.trim().is_empty() {
        return Err(ServiceError::Validation("query parameter q is required".into()));
    }
    let limit = params.limit.unwrap_or(5).min(20);

    let conn = state.conn.clone();
    let query = params.q.clone();
    let hits = run_blocking(move || {
        let mut db = conn.get()?;
        search_chunks(&mut db, ctx.tenant_id, &query, limit)
    })
    .await?;
    Ok(Json(hits))
}

/// Term-overlap ranking over processed chunks. Candidate rows come from an
/// ILIKE prefilter on the longest query terms; scoring happens here.
pub fn search_chunks(
    db: &mut PgConnection,
    tenant_id: Uuid,
    query: &str,
    limit: usize,
) -> Result<Vec<ChunkHit>, ServiceError> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let mut patterns = terms
        .iter()
        .take(3)
        .map(|t| format!("%{}%", t))
        .collect::<Vec<_>>();
    while patterns.len() < 3 {
        patterns.push(patterns[0].clone());
    }

    let candidates: Vec<DocumentChunk> = document_chunks::table
        .inner_join(documents::table)
        .filter(document_chunks::tenant_id.eq(tenant_id))
        .filter(documents::status.eq(DocumentStatus::Processed.as_str()))
        .filter(
            document_chunks::content
                .ilike(patterns[0].clone())
                .or(document_chunks::content.ilike(patterns[1].clone()))
                .or(document_chunks::content.ilike(patterns[2].clone())),
        )
        .select(DocumentChunk::as_select())
        .limit(200)
        .load(db)?;

    let mut hits: Vec<ChunkHit> = candidates
        .into_iter()
        .map(|chunk| {
            let score = score_chunk(&chunk.content, &terms);
            ChunkHit {
                document_id: chunk.document_id,
                chunk_index: chunk.chunk_index,
                content: chunk.content,
                score,
            }
        })
        .filter(|h| h.score > 0)
        .collect();

    hits.sort_by(|a, b| b.score.cmp(&a.score));
    hits.truncate(limit);
    Ok(hits)
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_string())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    // Longest terms carry the most signal and feed the ILIKE prefilter.
    terms.sort_by(|a, b| b.len().cmp(&a.len()));
    terms
}

fn score_chunk(content: &str, terms: &[String]) -> usize {
    let lower = content.to_lowercase();
    terms.iter().filter(|t| lower.contains(t.as_str())).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_extension_with_list() {
        let err = validate_upload("malware.exe", 100).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(".exe"));
        for ext in ALLOWED_EXTENSIONS {
            assert!(message.contains(ext), "missing {} in {}", ext, message);
        }
    }

    #[test]
    fn rejects_oversized_pdf() {
        let err = validate_upload("handbook.pdf", 15 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(err.to_string().contains("10 MB"));
    }

    #[test]
    fn accepts_supported_upload() {
        assert!(validate_upload("notes.md", 1024).is_ok());
        assert!(validate_upload("NOTES.MD", 1024).is_ok());
    }

    #[test]
    fn missing_extension_is_rejected() {
        assert!(validate_upload("README", 10).is_err());
    }

    #[test]
    fn chunks_respect_word_boundaries() {
        let text = "alpha beta gamma delta epsilon";
        let chunks = chunk_text(text, 12);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 12, "chunk too long: {:?}", chunk);
            assert!(!chunk.starts_with(' ') && !chunk.ends_with(' '));
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn single_word_longer_than_chunk_is_kept_whole() {
        let chunks = chunk_text("supercalifragilistic", 5);
        assert_eq!(chunks, vec!["supercalifragilistic".to_string()]);
    }

    #[test]
    fn query_terms_dedupe_and_drop_stubs() {
        let terms = query_terms("How do I reset my reset PIN?");
        assert!(terms.contains(&"reset".to_string()));
        assert!(!terms.iter().any(|t| t == "do" || t == "i"));
        assert_eq!(terms.iter().filter(|t| *t == "reset").count(), 1);
    }

    #[test]
    fn scoring_counts_distinct_terms() {
        let terms = vec!["reset".to_string(), "password".to_string()];
        assert_eq!(score_chunk("To reset your password, open settings", &terms), 2);
        assert_eq!(score_chunk("reset reset reset", &terms), 1);
        assert_eq!(score_chunk("unrelated text", &terms), 0);
    }
}
