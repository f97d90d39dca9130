use crate::document::Document;
use crate::error::{Result, SofaError};
use rusqlite::{params, Connection, OptionalExtension};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Builds the `{"results":[...]}` change-feed envelope in SQL. Rows are
/// wrapped in `JSON()` so the aggregated array holds objects rather than
/// re-encoded strings.
const CHANGES_SQL: &str = "
    WITH window (seq, version, doc_id, deleted) AS (
        SELECT printf('%d-%s', seq_number, seq_id), version, doc_id, deleted
        FROM changes
        WHERE seq_number > ?1 OR (seq_number = ?1 AND seq_id > ?2)
        ORDER BY seq_id DESC
        LIMIT ?3
    ),
    objects (obj) AS (
        SELECT CASE WHEN deleted != 1
            THEN JSON_OBJECT('seq', seq, 'version', version, 'id', doc_id)
            ELSE JSON_OBJECT('seq', seq, 'version', version, 'id', doc_id, 'deleted', JSON('true'))
        END FROM window
    )
    SELECT JSON_OBJECT('results', JSON_GROUP_ARRAY(JSON(obj))) FROM objects";

/// A read-only handle on a database file. Callers wrap each operation in
/// `begin`/`commit`; the pool hands the connection back out afterwards.
pub struct DatabaseReader {
    conn: Connection,
}

impl DatabaseReader {
    pub fn open(path: &Path) -> Result<DatabaseReader> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(DatabaseReader { conn })
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Latest revision metadata. Tombstones are not visible to point reads.
    pub fn get_revision(&self, doc_id: &str) -> Result<Document> {
        let doc = self
            .conn
            .query_row(
                "SELECT doc_id, version, deleted FROM changes
                 WHERE doc_id = ?1 ORDER BY version DESC LIMIT 1",
                params![doc_id],
                |row| {
                    Ok(Document::from_parts(
                        row.get::<_, String>(0)?,
                        row.get(1)?,
                        row.get(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or(SofaError::DocNotFound)?;
        if doc.deleted {
            return Err(SofaError::DocNotFound);
        }
        Ok(doc)
    }

    /// Metadata of one exact `(id, version)` revision.
    pub fn get_revision_by_version(&self, doc_id: &str, version: i64) -> Result<Document> {
        let doc = self
            .conn
            .query_row(
                "SELECT doc_id, version, deleted FROM changes
                 WHERE doc_id = ?1 AND version = ?2 LIMIT 1",
                params![doc_id, version],
                |row| {
                    Ok(Document::from_parts(
                        row.get::<_, String>(0)?,
                        row.get(1)?,
                        row.get(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or(SofaError::DocNotFound)?;
        if doc.deleted {
            return Err(SofaError::DocNotFound);
        }
        Ok(doc)
    }

    /// Latest revision including the stored body.
    pub fn get_document(&self, doc_id: &str) -> Result<Document> {
        let row = self
            .conn
            .query_row(
                "SELECT doc_id, version, deleted,
                        (SELECT data FROM documents WHERE doc_id = ?1)
                 FROM changes WHERE doc_id = ?1 ORDER BY version DESC LIMIT 1",
                params![doc_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or(SofaError::DocNotFound)?;
        document_from_row(row)
    }

    /// One exact `(id, version)` revision, with the live body.
    pub fn get_document_by_version(&self, doc_id: &str, version: i64) -> Result<Document> {
        let row = self
            .conn
            .query_row(
                "SELECT doc_id, version, deleted,
                        (SELECT data FROM documents WHERE doc_id = ?1)
                 FROM changes WHERE doc_id = ?1 AND version = ?2 LIMIT 1",
                params![doc_id, version],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or(SofaError::DocNotFound)?;
        document_from_row(row)
    }

    /// All live design documents, bodies included.
    pub fn get_design_documents(&self) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT doc_id, version, deleted, data FROM documents
             WHERE kind = 'design' AND deleted = 0 ORDER BY doc_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(document_from_row(row?)?);
        }
        Ok(docs)
    }

    /// The change feed as a JSON envelope, newest seq_id first.
    pub fn get_changes(&self, since_number: i64, since_id: &str, limit: i64) -> Result<Vec<u8>> {
        let envelope: String = self.conn.query_row(
            CHANGES_SQL,
            params![since_number, since_id, limit],
            |row| row.get(0),
        )?;
        Ok(envelope.into_bytes())
    }

    /// The maximum `(seq_number, seq_id)` in the change log, or `(0, "")`
    /// for an empty database.
    pub fn last_sequence(&self) -> Result<(i64, String)> {
        let seq = self
            .conn
            .query_row(
                "SELECT seq_number, seq_id FROM changes
                 ORDER BY seq_number DESC, seq_id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(seq.unwrap_or((0, String::new())))
    }

    pub fn document_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(1) FROM documents", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn document_from_row(row: (String, i64, bool, Option<String>)) -> Result<Document> {
    let (id, version, deleted, data) = row;
    if deleted {
        return Err(SofaError::DocNotFound);
    }
    let data = data.ok_or(SofaError::DocNotFound)?;
    let parsed = Document::parse(data.as_bytes())?;
    Ok(Document {
        id,
        version,
        deleted,
        kind: parsed.kind,
        body: parsed.body,
    })
}

/// A bounded pool of idle readers over one database file. `borrow` hands out
/// an idle reader or opens a fresh one; the capacity bounds only the idle
/// set, not the number of concurrent readers.
pub struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<DatabaseReader>>,
    capacity: usize,
}

impl ReaderPool {
    pub fn new(path: PathBuf, capacity: usize) -> ReaderPool {
        ReaderPool {
            path,
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn borrow(&self) -> Result<PooledReader<'_>> {
        let idle = self.idle.lock().unwrap().pop();
        let reader = match idle {
            Some(reader) => reader,
            None => DatabaseReader::open(&self.path)?,
        };
        Ok(PooledReader {
            pool: self,
            reader: Some(reader),
        })
    }

    fn give_back(&self, reader: DatabaseReader) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.capacity {
            idle.push(reader);
        }
        // Over capacity: the reader is dropped and its connection closed.
    }

    /// Drain and close every idle reader.
    pub fn close(&self) {
        self.idle.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// A borrowed reader; returns itself to the pool on drop.
pub struct PooledReader<'a> {
    pool: &'a ReaderPool,
    reader: Option<DatabaseReader>,
}

impl Deref for PooledReader<'_> {
    type Target = DatabaseReader;

    fn deref(&self) -> &DatabaseReader {
        self.reader.as_ref().expect("reader taken")
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.give_back(reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DatabaseWriter;
    use tempfile::TempDir;

    fn seed_db(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("test.db");
        let writer = DatabaseWriter::open(&path).unwrap();
        writer.begin().unwrap();
        writer.exec_build_script().unwrap();
        for (seq, id, version) in [(1, "a", 1), (2, "b", 1), (3, "a", 2)] {
            let body = format!(r#"{{"_id":"{id}","_version":{version},"n":{seq}}}"#);
            let doc = Document::parse(body.as_bytes()).unwrap();
            let current = writer.get_revision(id).unwrap();
            writer
                .put_document(seq, &format!("seq-{seq:03}"), &doc, current.as_ref())
                .unwrap();
        }
        writer.commit().unwrap();
        path
    }

    #[test]
    fn test_point_lookups() {
        let dir = TempDir::new().unwrap();
        let path = seed_db(&dir);
        let reader = DatabaseReader::open(&path).unwrap();

        let latest = reader.get_revision("a").unwrap();
        assert_eq!(latest.version, 2);

        let exact = reader.get_revision_by_version("a", 1).unwrap();
        assert_eq!(exact.version, 1);

        let with_data = reader.get_document("a").unwrap();
        assert_eq!(with_data.version, 2);
        assert_eq!(with_data.body["n"], 3);

        assert!(matches!(
            reader.get_revision("missing"),
            Err(SofaError::DocNotFound)
        ));
        assert!(matches!(
            reader.get_revision_by_version("a", 9),
            Err(SofaError::DocNotFound)
        ));
    }

    #[test]
    fn test_deleted_latest_revision_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = seed_db(&dir);

        let writer = DatabaseWriter::open(&path).unwrap();
        writer.begin().unwrap();
        let mut tombstone = Document::from_parts("b", 2, true);
        tombstone.body.insert("n".to_string(), 4.into());
        let current = writer.get_revision("b").unwrap();
        writer
            .put_document(4, "seq-004", &tombstone, current.as_ref())
            .unwrap();
        writer.commit().unwrap();

        let reader = DatabaseReader::open(&path).unwrap();
        assert!(matches!(
            reader.get_document("b"),
            Err(SofaError::DocNotFound)
        ));
        assert!(matches!(
            reader.get_revision("b"),
            Err(SofaError::DocNotFound)
        ));
    }

    #[test]
    fn test_last_sequence_and_count() {
        let dir = TempDir::new().unwrap();
        let path = seed_db(&dir);
        let reader = DatabaseReader::open(&path).unwrap();

        assert_eq!(reader.last_sequence().unwrap(), (3, "seq-003".to_string()));
        assert_eq!(reader.document_count().unwrap(), 2);

        let empty = dir.path().join("empty.db");
        let writer = DatabaseWriter::open(&empty).unwrap();
        writer.begin().unwrap();
        writer.exec_build_script().unwrap();
        writer.commit().unwrap();
        let reader = DatabaseReader::open(&empty).unwrap();
        assert_eq!(reader.last_sequence().unwrap(), (0, String::new()));
    }

    #[test]
    fn test_changes_envelope() {
        let dir = TempDir::new().unwrap();
        let path = seed_db(&dir);
        let reader = DatabaseReader::open(&path).unwrap();

        let envelope = reader.get_changes(0, "", 10_000).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
        let results = parsed["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        // Descending by seq_id.
        assert_eq!(results[0]["seq"], "3-seq-003");
        assert_eq!(results[0]["id"], "a");
        assert_eq!(results[2]["seq"], "1-seq-001");

        // since filters to strictly-greater sequences.
        let envelope = reader.get_changes(2, "seq-002", 10_000).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
        assert_eq!(parsed["results"].as_array().unwrap().len(), 1);

        // limit caps the window.
        let envelope = reader.get_changes(0, "", 2).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
        assert_eq!(parsed["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_reader_pool_bounds_idle_set() {
        let dir = TempDir::new().unwrap();
        let path = seed_db(&dir);
        let pool = ReaderPool::new(path, 2);

        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        let c = pool.borrow().unwrap();
        assert_eq!(pool.idle_count(), 0);

        drop(a);
        drop(b);
        drop(c);
        // The third return overflows the cap and is closed instead.
        assert_eq!(pool.idle_count(), 2);

        pool.close();
        assert_eq!(pool.idle_count(), 0);

        // Borrowing after close lazily opens a fresh reader.
        let reader = pool.borrow().unwrap();
        assert_eq!(reader.document_count().unwrap(), 2);
    }
}
