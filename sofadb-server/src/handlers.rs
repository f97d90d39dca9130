use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use sofadb::{Document, Engine, SofaError};
use std::collections::HashMap;

type Query = web::Query<HashMap<String, String>>;

/// Register all routes. Literal segments (`_all_dbs`, `_changes`, …) are
/// registered before the `{docid}` catch-alls so they take precedence.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(info))
        .route("/_all_dbs", web::get().to(all_databases))
        .route("/_uuids", web::get().to(uuids))
        .route("/{db}/_all_docs", web::get().to(all_docs))
        .route("/{db}/_bulk_docs", web::post().to(bulk_documents))
        .route("/{db}/_bulk_gets", web::post().to(bulk_get_documents))
        .route("/{db}/_changes", web::get().to(changes))
        .route("/{db}/_compact", web::post().to(compact))
        .route("/{db}/_design/{docid}/{view}/{select}", web::get().to(select_view_named))
        .route("/{db}/_design/{docid}/{view}", web::get().to(select_view))
        .route("/{db}/_design/{docid}", web::get().to(get_design_document))
        .route("/{db}/_design/{docid}", web::head().to(head_design_document))
        .route("/{db}/_design/{docid}", web::put().to(put_design_document))
        .route("/{db}/_design/{docid}", web::delete().to(delete_design_document))
        .route("/{db}/{docid}", web::get().to(get_document))
        .route("/{db}/{docid}", web::head().to(head_document))
        .route("/{db}/{docid}", web::put().to(put_document))
        .route("/{db}/{docid}", web::delete().to(delete_document))
        .route("/{db}", web::get().to(get_database))
        .route("/{db}", web::put().to(put_database))
        .route("/{db}", web::post().to(post_document))
        .route("/{db}", web::delete().to(delete_database));
}

// ── Helpers ─────────────────────────────────────────────────────────

fn error_status(e: &SofaError) -> StatusCode {
    match e.code() {
        "db_not_found" | "doc_not_found" | "view_not_found" | "view_select_not_found" => {
            StatusCode::NOT_FOUND
        }
        "db_exists" | "doc_conflict" => StatusCode::CONFLICT,
        "internal_error" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_response(e: &SofaError) -> HttpResponse {
    if e.code() == "internal_error" {
        log::error!("internal error: {e}");
    }
    HttpResponse::build(error_status(e)).json(e.to_response())
}

fn json_bytes(body: Vec<u8>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/json")
        .body(body)
}

fn ok_true() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "ok": true }))
}

fn parse_bool(value: Option<&String>) -> bool {
    value.map(|v| v == "true" || v == "1").unwrap_or(false)
}

// ── Server ──────────────────────────────────────────────────────────

async fn info(state: web::Data<Engine>) -> HttpResponse {
    match state.info() {
        Ok(body) => json_bytes(body),
        Err(e) => error_response(&e),
    }
}

async fn all_databases(state: web::Data<Engine>) -> HttpResponse {
    match state.list_databases() {
        Ok(list) => HttpResponse::Ok().json(list),
        Err(e) => error_response(&e),
    }
}

async fn uuids(state: web::Data<Engine>, query: Query) -> HttpResponse {
    let count = query
        .get("count")
        .and_then(|c| c.parse().ok())
        .unwrap_or(1);
    HttpResponse::Ok().json(state.uuids(count))
}

// ── Databases ───────────────────────────────────────────────────────

async fn get_database(state: web::Data<Engine>, path: web::Path<String>) -> HttpResponse {
    let db = path.into_inner();
    if let Err(e) = state.open(&db, false) {
        return error_response(&e);
    }
    match state.stat(&db) {
        Ok(stat) => HttpResponse::Ok().json(stat),
        Err(e) => error_response(&e),
    }
}

async fn put_database(state: web::Data<Engine>, path: web::Path<String>) -> HttpResponse {
    match state.open(&path.into_inner(), true) {
        Ok(()) => ok_true(),
        Err(e) => error_response(&e),
    }
}

async fn delete_database(state: web::Data<Engine>, path: web::Path<String>) -> HttpResponse {
    match state.delete(&path.into_inner()) {
        Ok(()) => ok_true(),
        Err(e) => error_response(&e),
    }
}

async fn compact(state: web::Data<Engine>, path: web::Path<String>) -> HttpResponse {
    match state.vacuum(&path.into_inner()) {
        Ok(()) => ok_true(),
        Err(e) => error_response(&e),
    }
}

async fn changes(state: web::Data<Engine>, path: web::Path<String>, query: Query) -> HttpResponse {
    let since = query.get("since").map(|s| s.as_str());
    let limit = query
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(0);
    match state.changes(&path.into_inner(), since, limit) {
        Ok(body) => json_bytes(body),
        Err(e) => error_response(&e),
    }
}

async fn all_docs(state: web::Data<Engine>, path: web::Path<String>, query: Query) -> HttpResponse {
    let select_name = if parse_bool(query.get("include_docs")) {
        "with_docs"
    } else {
        "default"
    };
    match state.select_view(
        &path.into_inner(),
        "_design/_views",
        "_all_docs",
        select_name,
        &query,
        false,
    ) {
        Ok(body) => json_bytes(body),
        Err(e) => error_response(&e),
    }
}

// ── Documents ───────────────────────────────────────────────────────

fn put_document_inner(
    state: &Engine,
    db: &str,
    docid: &str,
    body: &[u8],
) -> Result<Document, SofaError> {
    let doc = Document::parse(body)?;
    if !docid.is_empty() && docid != doc.id {
        return Err(SofaError::MismatchId);
    }
    state.put_document(db, doc)
}

fn document_response(doc: Document) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "id": doc.id,
        "version": doc.version,
        "deleted": doc.deleted,
    }))
}

fn get_document_inner(state: &Engine, db: &str, docid: &str, query: &Query) -> HttpResponse {
    let version = query
        .get("version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    match state.get_document(db, &Document::from_parts(docid, version, false), true) {
        Ok(doc) => json_bytes(doc.to_json().into_bytes()),
        Err(e) => error_response(&e),
    }
}

fn delete_document_inner(
    state: &Engine,
    db: &str,
    docid: &str,
    query: &Query,
    req: &HttpRequest,
) -> HttpResponse {
    let version = match query.get("version").cloned().or_else(|| {
        req.headers()
            .get("If-Match")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
    }) {
        Some(v) => v.parse().unwrap_or(0),
        None => return error_response(&SofaError::VersionMissing),
    };
    match state.delete_document(db, Document::from_parts(docid, version, true)) {
        Ok(_) => ok_true(),
        Err(e) => error_response(&e),
    }
}

async fn get_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    query: Query,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    get_document_inner(&state, &db, &docid, &query)
}

async fn head_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    query: Query,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    let version = query
        .get("version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    match state.get_document(&db, &Document::from_parts(docid, version, false), false) {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(e) => HttpResponse::build(error_status(&e)).finish(),
    }
}

async fn put_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    match put_document_inner(&state, &db, &docid, &body) {
        Ok(doc) => document_response(doc),
        Err(e) => error_response(&e),
    }
}

async fn post_document(
    state: web::Data<Engine>,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    match put_document_inner(&state, &path.into_inner(), "", &body) {
        Ok(doc) => document_response(doc),
        Err(e) => error_response(&e),
    }
}

async fn delete_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    query: Query,
    req: HttpRequest,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    delete_document_inner(&state, &db, &docid, &query, &req)
}

async fn bulk_documents(
    state: web::Data<Engine>,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    match state.bulk_documents(&path.into_inner(), &body) {
        Ok(output) => json_bytes(output),
        Err(e) => error_response(&e),
    }
}

async fn bulk_get_documents(
    state: web::Data<Engine>,
    path: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    match state.bulk_get_documents(&path.into_inner(), &body) {
        Ok(output) => json_bytes(output),
        Err(e) => error_response(&e),
    }
}

// ── Design documents and views ──────────────────────────────────────

async fn get_design_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    query: Query,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    get_document_inner(&state, &db, &format!("_design/{docid}"), &query)
}

async fn head_design_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    query: Query,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    let version = query
        .get("version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let stub = Document::from_parts(format!("_design/{docid}"), version, false);
    match state.get_document(&db, &stub, false) {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(e) => HttpResponse::build(error_status(&e)).finish(),
    }
}

async fn put_design_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    match put_document_inner(&state, &db, &format!("_design/{docid}"), &body) {
        Ok(doc) => document_response(doc),
        Err(e) => error_response(&e),
    }
}

async fn delete_design_document(
    state: web::Data<Engine>,
    path: web::Path<(String, String)>,
    query: Query,
    req: HttpRequest,
) -> HttpResponse {
    let (db, docid) = path.into_inner();
    delete_document_inner(&state, &db, &format!("_design/{docid}"), &query, &req)
}

fn select_view_inner(
    state: &Engine,
    db: &str,
    docid: &str,
    view: &str,
    select_name: &str,
    query: &Query,
) -> HttpResponse {
    let mut select_name = select_name.to_string();
    if parse_bool(query.get("include_docs")) {
        select_name.push_str("_with_docs");
    }
    let stale = parse_bool(query.get("stale"));
    match state.select_view(
        db,
        &format!("_design/{docid}"),
        view,
        &select_name,
        query,
        stale,
    ) {
        Ok(body) => json_bytes(body),
        Err(e) => error_response(&e),
    }
}

async fn select_view(
    state: web::Data<Engine>,
    path: web::Path<(String, String, String)>,
    query: Query,
) -> HttpResponse {
    let (db, docid, view) = path.into_inner();
    select_view_inner(&state, &db, &docid, &view, "default", &query)
}

async fn select_view_named(
    state: web::Data<Engine>,
    path: web::Path<(String, String, String, String)>,
    query: Query,
) -> HttpResponse {
    let (db, docid, view, select) = path.into_inner();
    select_view_inner(&state, &db, &docid, &view, &select, &query)
}
