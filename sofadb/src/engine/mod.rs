use crate::database::{Database, DbStat, DB_EXT};
use crate::document::{validate_doc_id, DesignDocument, Document};
use crate::error::{Result, SofaError};
use crate::sequence::SequenceIdGenerator;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// Process-level registry of databases. The lock is held shared for every
/// per-database operation and exclusive only to open or delete a database.
pub struct Engine {
    db_dir: PathBuf,
    view_dir: PathBuf,
    dbs: RwLock<HashMap<String, Database>>,
    uuids: Mutex<SequenceIdGenerator>,
}

/// Database names become file names: reject separators, the view-file
/// delimiter, and the reserved underscore prefix.
pub fn validate_db_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('_')
        || name.contains('$')
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(SofaError::DbInvalidName(name.to_string()));
    }
    Ok(())
}

impl Engine {
    /// Open the engine over a data directory: databases live under
    /// `<data>/dbs`, view files under `<data>/views`. Every database file
    /// already present is opened.
    pub fn new(data_dir: &Path) -> Result<Engine> {
        let db_dir = data_dir.join("dbs");
        let view_dir = data_dir.join("views");
        std::fs::create_dir_all(&db_dir)?;
        std::fs::create_dir_all(&view_dir)?;

        let engine = Engine {
            db_dir,
            view_dir,
            dbs: RwLock::new(HashMap::new()),
            uuids: Mutex::new(SequenceIdGenerator::new()),
        };

        for name in engine.list_databases()? {
            engine.open(&name, false)?;
        }
        log::info!(
            "engine opened with {} database(s)",
            engine.dbs.read().unwrap().len()
        );
        Ok(engine)
    }

    /// Database files on disk, by name.
    pub fn list_databases(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.db_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(DB_EXT) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Open a database, creating it when `create_if_not_exists`. Opening an
    /// already-open database without the create flag is a no-op.
    pub fn open(&self, name: &str, create_if_not_exists: bool) -> Result<()> {
        validate_db_name(name)?;

        let mut dbs = self.dbs.write().unwrap();
        if dbs.contains_key(name) {
            if !create_if_not_exists {
                return Ok(());
            }
            return Err(SofaError::DbExists);
        }

        let db = Database::open(name, &self.db_dir, &self.view_dir, create_if_not_exists)?;
        dbs.insert(name.to_string(), db);
        Ok(())
    }

    /// Close and delete a database: its file, the WAL side files, and every
    /// view file carrying its prefix.
    pub fn delete(&self, name: &str) -> Result<()> {
        let mut dbs = self.dbs.write().unwrap();
        let db = dbs.remove(name).ok_or(SofaError::DbNotFound)?;
        db.close();
        drop(db);

        let prefix = format!("{name}$");
        for entry in std::fs::read_dir(&self.view_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&prefix) && file_name.ends_with(DB_EXT) {
                let _ = std::fs::remove_file(entry.path());
            }
        }

        let file_name = format!("{name}{DB_EXT}");
        let _ = std::fs::remove_file(self.db_dir.join(format!("{file_name}-shm")));
        let _ = std::fs::remove_file(self.db_dir.join(format!("{file_name}-wal")));
        std::fs::remove_file(self.db_dir.join(&file_name))?;
        Ok(())
    }

    pub fn put_document(&self, name: &str, mut doc: Document) -> Result<Document> {
        validate_doc_id(&doc.id)?;
        if doc.is_design() {
            // Malformed design documents never reach storage.
            DesignDocument::parse(doc.to_json().as_bytes())?;
        }

        let dbs = self.dbs.read().unwrap();
        let db = dbs.get(name).ok_or(SofaError::DbNotFound)?;
        doc = db.put_document(doc)?;
        Ok(doc)
    }

    pub fn get_document(&self, name: &str, doc: &Document, include_data: bool) -> Result<Document> {
        let dbs = self.dbs.read().unwrap();
        let db = dbs.get(name).ok_or(SofaError::DbNotFound)?;
        db.get_document(doc, include_data)
    }

    pub fn delete_document(&self, name: &str, mut doc: Document) -> Result<Document> {
        doc.deleted = true;
        self.put_document(name, doc)
    }

    /// Apply each document of a `{"_docs":[...]}` body in order, collecting
    /// per-document results or `{"error","reason"}` objects by position.
    pub fn bulk_documents(&self, name: &str, body: &[u8]) -> Result<Vec<u8>> {
        let docs = parse_bulk_body(body)?;
        let mut outputs = Vec::with_capacity(docs.len());
        for item in docs {
            let output = Document::from_value(item)
                .and_then(|doc| self.put_document(name, doc))
                .map(|doc| {
                    serde_json::json!({
                        "id": doc.id,
                        "version": doc.version,
                        "deleted": doc.deleted,
                    })
                })
                .unwrap_or_else(|e| e.to_response());
            outputs.push(output);
        }
        Ok(serde_json::to_vec(&Value::Array(outputs))?)
    }

    /// Fetch each document of a `{"_docs":[...]}` body, returning a
    /// `{"results":[...]}` envelope of bodies or error objects.
    pub fn bulk_get_documents(&self, name: &str, body: &[u8]) -> Result<Vec<u8>> {
        let docs = parse_bulk_body(body)?;
        let mut outputs = Vec::with_capacity(docs.len());
        for item in docs {
            let output = Document::from_value(item)
                .and_then(|doc| self.get_document(name, &doc, true))
                .map(|doc| doc.to_value())
                .unwrap_or_else(|e| e.to_response());
            outputs.push(output);
        }
        Ok(serde_json::to_vec(
            &serde_json::json!({ "results": outputs }),
        )?)
    }

    pub fn stat(&self, name: &str) -> Result<DbStat> {
        let dbs = self.dbs.read().unwrap();
        let db = dbs.get(name).ok_or(SofaError::DbNotFound)?;
        db.stat()
    }

    pub fn vacuum(&self, name: &str) -> Result<()> {
        let dbs = self.dbs.read().unwrap();
        let db = dbs.get(name).ok_or(SofaError::DbNotFound)?;
        db.vacuum()
    }

    pub fn changes(&self, name: &str, since: Option<&str>, limit: i64) -> Result<Vec<u8>> {
        let dbs = self.dbs.read().unwrap();
        let db = dbs.get(name).ok_or(SofaError::DbNotFound)?;
        db.changes(since, limit)
    }

    pub fn select_view(
        &self,
        name: &str,
        ddoc_id: &str,
        view_name: &str,
        select_name: &str,
        query_params: &HashMap<String, String>,
        stale: bool,
    ) -> Result<Vec<u8>> {
        let dbs = self.dbs.read().unwrap();
        let db = dbs.get(name).ok_or(SofaError::DbNotFound)?;
        db.select_view(ddoc_id, view_name, select_name, query_params, stale)
    }

    /// Server info: `{name, version:{sqlite_version, sqlite_source_id}}`.
    pub fn info(&self) -> Result<Vec<u8>> {
        let conn = Connection::open_in_memory()?;
        let (version, source_id): (String, String) = conn.query_row(
            "SELECT sqlite_version(), sqlite_source_id()",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(serde_json::to_vec(&serde_json::json!({
            "name": "sofadb",
            "version": { "sqlite_version": version, "sqlite_source_id": source_id },
        }))?)
    }

    /// A batch of fresh ids from the process-wide generator.
    pub fn uuids(&self, count: usize) -> Vec<String> {
        let count = count.max(1);
        let mut gen = self.uuids.lock().unwrap();
        (0..count).map(|_| gen.next()).collect()
    }
}

fn parse_bulk_body(body: &[u8]) -> Result<Vec<Value>> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| SofaError::BadJson(e.to_string()))?;
    match value.get("_docs") {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err(SofaError::BadJson(
            "_docs must be an array of documents".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Engine {
        Engine::new(dir.path()).unwrap()
    }

    #[test]
    fn test_database_name_validation() {
        assert!(validate_db_name("x").is_ok());
        assert!(validate_db_name("my-db0").is_ok());
        assert!(validate_db_name("").is_err());
        assert!(validate_db_name("_system").is_err());
        assert!(validate_db_name("a$b").is_err());
        assert!(validate_db_name("a/b").is_err());
    }

    #[test]
    fn test_open_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);

        kdb.open("x", true).unwrap();
        assert_eq!(kdb.list_databases().unwrap(), vec!["x"]);

        // Opening an open database without create is a no-op.
        kdb.open("x", false).unwrap();
        // Creating it again conflicts.
        assert!(matches!(kdb.open("x", true), Err(SofaError::DbExists)));
        assert!(matches!(kdb.open("y", false), Err(SofaError::DbNotFound)));
    }

    #[test]
    fn test_engine_bootstrap_opens_existing_databases() {
        let dir = TempDir::new().unwrap();
        {
            let kdb = engine(&dir);
            kdb.open("x", true).unwrap();
            kdb.put_document("x", Document::parse(br#"{"_id":"a","_version":0}"#).unwrap())
                .unwrap();
        }

        let kdb = engine(&dir);
        assert_eq!(kdb.list_databases().unwrap(), vec!["x"]);
        let doc = kdb
            .get_document("x", &Document::from_parts("a", 0, false), true)
            .unwrap();
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn test_delete_removes_all_files() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);
        kdb.open("x", true).unwrap();
        kdb.put_document("x", Document::parse(br#"{"_id":"a","_version":0}"#).unwrap())
            .unwrap();
        // Materialize a view file.
        kdb.select_view("x", "_design/_views", "_all_docs", "default", &HashMap::new(), false)
            .unwrap();
        assert!(std::fs::read_dir(dir.path().join("views")).unwrap().count() > 0);

        kdb.delete("x").unwrap();
        assert!(kdb.list_databases().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path().join("views")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("dbs")).unwrap().count(), 0);
        assert!(matches!(kdb.delete("x"), Err(SofaError::DbNotFound)));
    }

    #[test]
    fn test_reserved_doc_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);
        kdb.open("x", true).unwrap();

        let err = kdb
            .put_document("x", Document::parse(br#"{"_id":"_reserved","_version":0}"#).unwrap())
            .unwrap_err();
        assert_eq!(err.code(), "doc_invalid_id");
    }

    #[test]
    fn test_invalid_design_document_fails_the_write() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);
        kdb.open("x", true).unwrap();

        let doc = Document::parse(br#"{"_id":"_design/bad","_version":0,"views":[1]}"#).unwrap();
        let err = kdb.put_document("x", doc).unwrap_err();
        assert_eq!(err.code(), "invalid_design_document");

        // Nothing was stored.
        let err = kdb
            .get_document("x", &Document::from_parts("_design/bad", 0, false), false)
            .unwrap_err();
        assert_eq!(err.code(), "doc_not_found");
    }

    #[test]
    fn test_bulk_documents_preserves_positions() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);
        kdb.open("x", true).unwrap();
        kdb.put_document("x", Document::parse(br#"{"_id":"a","_version":0}"#).unwrap())
            .unwrap();

        let body = br#"{"_docs":[{"_id":"a","_version":999},{"_id":"b","_version":0}]}"#;
        let output = kdb.bulk_documents("x", body).unwrap();
        let parsed: Value = serde_json::from_slice(&output).unwrap();
        let items = parsed.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["error"], "doc_conflict");
        assert_eq!(items[1]["id"], "b");
        assert_eq!(items[1]["version"], 1);
    }

    #[test]
    fn test_bulk_get_documents() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);
        kdb.open("x", true).unwrap();
        kdb.put_document("x", Document::parse(br#"{"_id":"a","_version":0,"v":7}"#).unwrap())
            .unwrap();

        let body = br#"{"_docs":[{"_id":"a"},{"_id":"missing"}]}"#;
        let output = kdb.bulk_get_documents("x", body).unwrap();
        let parsed: Value = serde_json::from_slice(&output).unwrap();
        let results = parsed["results"].as_array().unwrap();
        assert_eq!(results[0]["v"], 7);
        assert_eq!(results[1]["error"], "doc_not_found");
    }

    #[test]
    fn test_bulk_rejects_bad_envelope() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);
        kdb.open("x", true).unwrap();

        assert_eq!(
            kdb.bulk_documents("x", b"not json").unwrap_err().code(),
            "bad_json"
        );
        assert_eq!(
            kdb.bulk_documents("x", br#"{"_docs":{}}"#).unwrap_err().code(),
            "bad_json"
        );
    }

    #[test]
    fn test_info_and_uuids() {
        let dir = TempDir::new().unwrap();
        let kdb = engine(&dir);

        let info: Value = serde_json::from_slice(&kdb.info().unwrap()).unwrap();
        assert_eq!(info["name"], "sofadb");
        assert!(info["version"]["sqlite_version"].is_string());

        let ids = kdb.uuids(3);
        assert_eq!(ids.len(), 3);
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
        assert_eq!(kdb.uuids(0).len(), 1);
    }
}
