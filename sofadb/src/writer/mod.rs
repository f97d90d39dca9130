use crate::document::Document;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Schema bootstrap for a database file: the live `documents` table plus the
/// append-only `changes` log, written atomically with every upsert.
const BUILD_SQL: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        doc_id      TEXT,
        version     INTEGER NOT NULL,
        kind        TEXT,
        deleted     BOOL NOT NULL,
        data        TEXT,
        seq_id      TEXT,
        PRIMARY KEY (doc_id)
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_metadata ON documents
        (doc_id, version, kind, deleted);

    CREATE INDEX IF NOT EXISTS idx_changes ON documents
        (doc_id, seq_id, deleted);

    CREATE INDEX IF NOT EXISTS idx_kind ON documents
        (doc_id, kind) WHERE kind IS NOT NULL;

    CREATE TABLE IF NOT EXISTS changes (
        seq_number  INTEGER NOT NULL,
        seq_id      TEXT NOT NULL,
        doc_id      TEXT NOT NULL,
        version     INTEGER NOT NULL,
        deleted     BOOL NOT NULL,
        PRIMARY KEY (seq_number, seq_id)
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_changes_doc ON changes
        (doc_id, version);
    ";

/// The single exclusive write handle of a database. At most one transaction
/// is ever in flight; the owning [`crate::database::Database`] serializes
/// callers with its write lock.
pub struct DatabaseWriter {
    conn: Connection,
}

impl DatabaseWriter {
    pub fn open(path: &Path) -> Result<DatabaseWriter> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(DatabaseWriter { conn })
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Create the document and change-log schema. Runs inside the caller's
    /// transaction; idempotent.
    pub fn exec_build_script(&self) -> Result<()> {
        self.conn.execute_batch(BUILD_SQL)?;
        Ok(())
    }

    /// VACUUM the database file. Must not be called with a transaction open.
    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Latest known revision of a document, read inside the current
    /// transaction so the conflict check sees uncommitted state.
    pub fn get_revision(&self, doc_id: &str) -> Result<Option<Document>> {
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
            .optional()?;
        Ok(doc)
    }

    /// Upsert the live document row and append exactly one change record,
    /// inside the current transaction.
    pub fn put_document(
        &self,
        seq_number: i64,
        seq_id: &str,
        new: &Document,
        current: Option<&Document>,
    ) -> Result<()> {
        let data = new.to_json();
        match current {
            Some(_) => {
                self.conn.execute(
                    "UPDATE documents
                     SET version = ?2, kind = ?3, deleted = ?4, data = ?5, seq_id = ?6
                     WHERE doc_id = ?1",
                    params![new.id, new.version, new.kind, new.deleted, data, seq_id],
                )?;
            }
            None => {
                self.conn.execute(
                    "INSERT INTO documents (doc_id, version, kind, deleted, data, seq_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![new.id, new.version, new.kind, new.deleted, data, seq_id],
                )?;
            }
        }

        self.conn.execute(
            "INSERT INTO changes (seq_number, seq_id, doc_id, version, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![seq_number, seq_id, new.id, new.version, new.deleted],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_writer(dir: &TempDir) -> DatabaseWriter {
        let writer = DatabaseWriter::open(&dir.path().join("test.db")).unwrap();
        writer.begin().unwrap();
        writer.exec_build_script().unwrap();
        writer.commit().unwrap();
        writer
    }

    #[test]
    fn test_build_script_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let writer = open_writer(&dir);
        writer.begin().unwrap();
        writer.exec_build_script().unwrap();
        writer.commit().unwrap();
    }

    #[test]
    fn test_put_and_get_revision() {
        let dir = TempDir::new().unwrap();
        let writer = open_writer(&dir);

        let doc = Document::parse(br#"{"_id":"a","_version":1,"v":1}"#).unwrap();
        writer.begin().unwrap();
        assert!(writer.get_revision("a").unwrap().is_none());
        writer.put_document(1, "seq-001", &doc, None).unwrap();

        // Visible inside the same transaction.
        let current = writer.get_revision("a").unwrap().unwrap();
        assert_eq!(current.version, 1);
        assert!(!current.deleted);
        writer.commit().unwrap();
    }

    #[test]
    fn test_rollback_discards_the_upsert() {
        let dir = TempDir::new().unwrap();
        let writer = open_writer(&dir);

        let doc = Document::parse(br#"{"_id":"a","_version":1}"#).unwrap();
        writer.begin().unwrap();
        writer.put_document(1, "seq-001", &doc, None).unwrap();
        writer.rollback().unwrap();

        writer.begin().unwrap();
        assert!(writer.get_revision("a").unwrap().is_none());
        writer.commit().unwrap();
    }

    #[test]
    fn test_revision_reflects_latest_change() {
        let dir = TempDir::new().unwrap();
        let writer = open_writer(&dir);

        let v1 = Document::parse(br#"{"_id":"a","_version":1}"#).unwrap();
        let mut v2 = Document::parse(br#"{"_id":"a","_version":2}"#).unwrap();
        v2.deleted = true;

        writer.begin().unwrap();
        writer.put_document(1, "seq-001", &v1, None).unwrap();
        writer.put_document(2, "seq-002", &v2, Some(&v1)).unwrap();
        writer.commit().unwrap();

        writer.begin().unwrap();
        let current = writer.get_revision("a").unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert!(current.deleted);
        writer.commit().unwrap();
    }
}
