//! JSON-RPC 2.0 HTTP transport.
//!
//! Three JSON-RPC methods over three fixed routes plus a plain health check,
//! per §6's wire contract. Unlike the teacher's `server.rs` (a plain REST
//! shape with a `{error: {code, message}}` body), every response here is a
//! JSON-RPC envelope — the route determines which method is accepted, the
//! envelope's `method` field must still name it, and errors use the
//! spec's fixed numeric codes instead of HTTP status/string codes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use markdownkeeper_core::error::CoreError;
use markdownkeeper_core::embedding::EmbeddingProvider;
use markdownkeeper_core::search::SearchMode;
use markdownkeeper_core::store::{DocumentView, GetDocumentOptions};

use crate::config::Config;
use crate::retriever::{self, SearchRequest};
use crate::sqlite_store::SqliteStore;
use crate::vector_index::BruteForceIndex;

const MAX_BODY_BYTES: usize = 1_048_576;

const PARSE_ERROR: i32 = -32700;
// §6 glosses this as "body too large"; used here for any malformed/invalid
// request per JSON-RPC 2.0's own standard meaning of -32600 ("Invalid Request").
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const DOCUMENT_NOT_FOUND: i32 = -32004;
const INTERNAL_ERROR: i32 = -32603;

#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_index: Option<Arc<BruteForceIndex>>,
    config: Arc<Config>,
}

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

fn success(id: Value, result: Value) -> Response {
    Json(json!({ "jsonrpc": "2.0", "result": result, "id": id })).into_response()
}

fn failure(id: Value, code: i32, message: impl Into<String>) -> Response {
    Json(json!({ "jsonrpc": "2.0", "error": JsonRpcError { code, message: message.into() }, "id": id }))
        .into_response()
}

fn core_error_response(id: Value, err: CoreError) -> Response {
    match err {
        CoreError::NotFound(msg) => failure(id, DOCUMENT_NOT_FOUND, msg),
        CoreError::Invalid(msg) => failure(id, INVALID_REQUEST, msg),
        other => failure(id, INTERNAL_ERROR, other.to_string()),
    }
}

/// Parses the envelope and confirms `expected_method`, or returns a
/// `Response` carrying the matching JSON-RPC error already.
fn parse_envelope(bytes: &Bytes, expected_method: &str) -> Result<JsonRpcRequest, Response> {
    if bytes.len() > MAX_BODY_BYTES {
        return Err(failure(Value::Null, INVALID_REQUEST, "request body exceeds 1 MiB limit"));
    }

    let request: JsonRpcRequest = serde_json::from_slice(bytes)
        .map_err(|e| failure(Value::Null, PARSE_ERROR, format!("invalid JSON-RPC request: {e}")))?;

    if request.method != expected_method {
        return Err(failure(
            request.id.clone(),
            METHOD_NOT_FOUND,
            format!("unknown method '{}', expected '{expected_method}'", request.method),
        ));
    }

    Ok(request)
}

pub(crate) fn document_view_json(view: &DocumentView) -> Value {
    json!({
        "id": view.document.id,
        "path": view.document.path,
        "title": view.document.title,
        "summary": view.document.summary,
        "category": view.document.category,
        "token_estimate": view.document.token_estimate,
        "content_hash": view.document.content_hash,
        "created_at": view.document.created_at,
        "updated_at": view.document.updated_at,
        "headings": view.headings,
        "tags": view.tags,
        "concepts": view.concepts,
        "chunks": view.chunks.as_ref().map(|chunks| {
            chunks
                .iter()
                .map(|c| json!({ "heading_path": c.heading_path, "content": c.content }))
                .collect::<Vec<_>>()
        }),
    })
}

// ============ POST /api/v1/query (semantic_query) ============

#[derive(Deserialize)]
struct SemanticQueryParams {
    query: String,
    #[serde(default = "default_max_results")]
    max_results: usize,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    include_content: bool,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    section: Option<String>,
}

fn default_max_results() -> usize {
    10
}

async fn handle_query(State(state): State<AppState>, bytes: Bytes) -> Response {
    let request = match parse_envelope(&bytes, "semantic_query") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let params: SemanticQueryParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(e) => return failure(request.id, INVALID_REQUEST, format!("invalid params: {e}")),
    };
    if params.query.trim().is_empty() {
        return failure(request.id, INVALID_REQUEST, "query must not be empty");
    }

    let mode = params
        .mode
        .as_deref()
        .and_then(SearchMode::parse)
        .unwrap_or(SearchMode::Semantic);

    let search_request = SearchRequest {
        query: params.query,
        limit: params.max_results,
        mode,
        include_content: params.include_content,
        max_tokens: params.max_tokens,
        section: params.section,
    };

    let result = retriever::search(
        &state.store,
        state.embedder.as_ref(),
        state.vector_index.as_deref(),
        &state.config.cache,
        &state.config.retrieval,
        search_request,
    )
    .await;

    match result {
        Ok(r) => success(
            request.id,
            json!({
                "documents": r.documents.iter().map(document_view_json).collect::<Vec<_>>(),
                "cache_hit": r.cache_hit,
            }),
        ),
        Err(e) => core_error_response(request.id, e),
    }
}

// ============ POST /api/v1/get_doc (get_document) ============

#[derive(Deserialize)]
struct GetDocumentParams {
    document_id: i64,
    #[serde(default)]
    include_content: bool,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    section: Option<String>,
}

async fn handle_get_doc(State(state): State<AppState>, bytes: Bytes) -> Response {
    let request = match parse_envelope(&bytes, "get_document") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let params: GetDocumentParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(e) => return failure(request.id, INVALID_REQUEST, format!("invalid params: {e}")),
    };

    let options = GetDocumentOptions {
        include_content: params.include_content,
        max_tokens: params.max_tokens,
        section: params.section,
    };

    match state.store.get_document(params.document_id, options).await {
        Ok(Some(view)) => success(request.id, document_view_json(&view)),
        Ok(None) => failure(request.id, DOCUMENT_NOT_FOUND, format!("no document with id {}", params.document_id)),
        Err(e) => core_error_response(request.id, e),
    }
}

// ============ POST /api/v1/find_concept (find_by_concept) ============

#[derive(Deserialize)]
struct FindConceptParams {
    concept: String,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

async fn handle_find_concept(State(state): State<AppState>, bytes: Bytes) -> Response {
    let request = match parse_envelope(&bytes, "find_by_concept") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let params: FindConceptParams = match serde_json::from_value(request.params) {
        Ok(p) => p,
        Err(e) => return failure(request.id, INVALID_REQUEST, format!("invalid params: {e}")),
    };

    match state.store.list_by_concept(&params.concept, params.max_results).await {
        Ok(documents) => success(request.id, json!({ "documents": documents })),
        Err(e) => core_error_response(request.id, e),
    }
}

// ============ GET /health ============

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Starts the JSON-RPC HTTP server. Runs until the process is terminated.
pub async fn run_server(
    config: Arc<Config>,
    store: Arc<SqliteStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_index: Option<Arc<BruteForceIndex>>,
) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", config.api.host, config.api.port);
    let state = AppState { store, embedder, vector_index, config };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/query", post(handle_query))
        .route("/api/v1/get_doc", post(handle_get_doc))
        .route("/api/v1/find_concept", post(handle_find_concept))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!("serving JSON-RPC API on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_envelope_rejects_oversized_body() {
        let bytes = Bytes::from(vec![0u8; MAX_BODY_BYTES + 1]);
        let err = parse_envelope(&bytes, "semantic_query").unwrap_err();
        assert_eq!(err.into_response().status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn parse_envelope_rejects_malformed_json() {
        let bytes = Bytes::from_static(b"not json");
        assert!(parse_envelope(&bytes, "semantic_query").is_err());
    }

    #[test]
    fn parse_envelope_rejects_mismatched_method() {
        let body = json!({"jsonrpc": "2.0", "method": "wrong_method", "params": {}, "id": 1});
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
        assert!(parse_envelope(&bytes, "semantic_query").is_err());
    }

    #[test]
    fn parse_envelope_accepts_matching_method() {
        let body = json!({"jsonrpc": "2.0", "method": "semantic_query", "params": {"query": "x"}, "id": 1});
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
        let request = parse_envelope(&bytes, "semantic_query").unwrap();
        assert_eq!(request.method, "semantic_query");
    }
}
