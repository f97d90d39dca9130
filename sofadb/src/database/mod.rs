use crate::document::Document;
use crate::error::{Result, SofaError};
use crate::reader::{DatabaseReader, ReaderPool};
use crate::sequence::{self, ChangeSequenceGenerator, SequenceIdGenerator};
use crate::view::{builtin_design_document, ViewManager};
use crate::writer::DatabaseWriter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Extension shared by database and view files.
pub const DB_EXT: &str = ".db";

/// Idle readers kept per database.
const READER_POOL_SIZE: usize = 4;

/// Default `limit` for the change feed.
const DEFAULT_CHANGES_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStat {
    pub db_name: String,
    pub update_seq: String,
    pub doc_count: i64,
}

/// The mutable write half of a database. The enclosing mutex is the
/// database write lock: it serializes transactions and sequence allocation.
struct WriteHalf {
    writer: DatabaseWriter,
    change_seq: ChangeSequenceGenerator,
    id_gen: SequenceIdGenerator,
}

impl WriteHalf {
    fn put_in_tx(&mut self, doc: &mut Document) -> Result<(i64, String)> {
        if doc.id.is_empty() {
            doc.id = self.id_gen.next();
        }

        let current = self.writer.get_revision(&doc.id)?;
        if let Some(cur) = &current {
            // A live revision conflicts unless the caller supplies its exact
            // version. Tombstones accept any version so documents can be
            // resurrected.
            if !cur.deleted && cur.version != doc.version {
                return Err(SofaError::DocConflict);
            }
        }

        // The new revision continues the chain: existing version + 1, or 1
        // for a fresh document.
        doc.version = current.as_ref().map_or(0, |cur| cur.version) + 1;

        let (seq_number, seq_id) = self.change_seq.next();
        self.writer
            .put_document(seq_number, &seq_id, doc, current.as_ref())?;
        Ok((seq_number, seq_id))
    }
}

/// One named document database: a single writer behind the write lock, a
/// pool of readers, the sequence generators, and the view manager.
pub struct Database {
    name: String,
    write: Mutex<WriteHalf>,
    last_seq: Mutex<(i64, String)>,
    readers: ReaderPool,
    views: Mutex<ViewManager>,
}

impl Database {
    /// Open a database file under `db_dir`. With `create_if_not_exists` the
    /// file must not exist yet: the schema is bootstrapped and the built-in
    /// `_design/_views` document installed. Without it the file must exist,
    /// and the last change sequence is recovered from the change log.
    pub fn open(
        name: &str,
        db_dir: &Path,
        view_dir: &Path,
        create_if_not_exists: bool,
    ) -> Result<Database> {
        let file_name = format!("{name}{DB_EXT}");
        let exists = db_dir.join(&file_name).exists();
        if !exists && !create_if_not_exists {
            return Err(SofaError::DbNotFound);
        }
        if exists && create_if_not_exists {
            return Err(SofaError::DbExists);
        }

        // View files attach the database by path, so it must be absolute.
        let file_path = db_dir.canonicalize()?.join(&file_name);

        let writer = DatabaseWriter::open(&file_path)?;
        if create_if_not_exists {
            writer.begin()?;
            match writer.exec_build_script() {
                Ok(()) => writer.commit()?,
                Err(e) => {
                    let _ = writer.rollback();
                    return Err(e);
                }
            }
        }

        let readers = ReaderPool::new(file_path.clone(), READER_POOL_SIZE);
        let (last_number, last_id) = {
            let reader = readers.borrow()?;
            reader.begin()?;
            let seq = reader.last_sequence();
            let commit = reader.commit();
            let seq = seq?;
            commit?;
            seq
        };

        let db = Database {
            name: name.to_string(),
            write: Mutex::new(WriteHalf {
                writer,
                change_seq: ChangeSequenceGenerator::new(last_number, last_id.clone()),
                id_gen: SequenceIdGenerator::new(),
            }),
            last_seq: Mutex::new((last_number, last_id)),
            readers,
            views: Mutex::new(ViewManager::new(name, file_path, view_dir.to_path_buf())),
        };

        if create_if_not_exists {
            let ddoc = builtin_design_document();
            let doc = Document::from_value(serde_json::to_value(&ddoc)?)?;
            db.put_document(doc)?;
        }

        let design_docs = db.get_design_documents()?;
        db.views.lock().unwrap().initialize(&design_docs)?;

        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last committed `(seq_number, seq_id)`.
    pub fn last_sequence(&self) -> (i64, String) {
        self.last_seq.lock().unwrap().clone()
    }

    /// Store a new document revision. Runs under the write lock in a single
    /// transaction: conflict check, version computation, change-sequence
    /// allocation, upsert and change-log append. Design-document writes
    /// additionally reconcile the view catalog after commit; reconciliation
    /// failures are logged and repaired on next open, not propagated.
    pub fn put_document(&self, mut doc: Document) -> Result<Document> {
        let mut write = self.write.lock().unwrap();

        write.writer.begin()?;
        let (seq_number, seq_id) = match write.put_in_tx(&mut doc) {
            Ok(seq) => seq,
            Err(e) => {
                let _ = write.writer.rollback();
                return Err(e);
            }
        };
        if let Err(e) = write.writer.commit() {
            let _ = write.writer.rollback();
            return Err(e);
        }

        *self.last_seq.lock().unwrap() = (seq_number, seq_id);

        if doc.is_design() {
            let result = {
                let mut views = self.views.lock().unwrap();
                if doc.deleted {
                    views.remove_design_document(&doc.id)
                } else {
                    views.update_design_document(&doc.id, doc.to_json().as_bytes())
                }
            };
            if let Err(e) = result {
                log::error!("view reconciliation failed for {}: {e}", doc.id);
            }
        }

        Ok(Document::from_parts(doc.id, doc.version, doc.deleted))
    }

    /// Look up a document. `version = 0` means the latest live revision; a
    /// deleted latest revision reads as not found.
    pub fn get_document(&self, doc: &Document, include_data: bool) -> Result<Document> {
        self.with_reader(|reader| {
            if include_data {
                if doc.version > 0 {
                    reader.get_document_by_version(&doc.id, doc.version)
                } else {
                    reader.get_document(&doc.id)
                }
            } else if doc.version > 0 {
                reader.get_revision_by_version(&doc.id, doc.version)
            } else {
                reader.get_revision(&doc.id)
            }
        })
    }

    /// Delete is an upsert of a tombstone; the caller must supply the
    /// current version.
    pub fn delete_document(&self, mut doc: Document) -> Result<Document> {
        doc.deleted = true;
        self.put_document(doc)
    }

    pub fn get_design_documents(&self) -> Result<Vec<Document>> {
        self.with_reader(|reader| reader.get_design_documents())
    }

    /// The change feed envelope, filtered to sequences after `since` and
    /// capped at `limit` (default 10000).
    pub fn changes(&self, since: Option<&str>, limit: i64) -> Result<Vec<u8>> {
        let (since_number, since_id) = match since {
            Some(s) => sequence::parse_seq(s),
            None => (0, String::new()),
        };
        let limit = if limit <= 0 { DEFAULT_CHANGES_LIMIT } else { limit };
        self.with_reader(|reader| reader.get_changes(since_number, &since_id, limit))
    }

    pub fn stat(&self) -> Result<DbStat> {
        let (number, id) = self.last_sequence();
        let doc_count = self.with_reader(|reader| reader.document_count())?;
        Ok(DbStat {
            db_name: self.name.clone(),
            update_seq: sequence::format_seq(number, &id),
            doc_count,
        })
    }

    /// Vacuum every open view file, then the database file itself.
    pub fn vacuum(&self) -> Result<()> {
        let write = self.write.lock().unwrap();
        self.views.lock().unwrap().vacuum()?;
        write.writer.vacuum()
    }

    /// Select from a view, bringing it current first unless `stale`.
    pub fn select_view(
        &self,
        ddoc_id: &str,
        view_name: &str,
        select_name: &str,
        query_params: &HashMap<String, String>,
        stale: bool,
    ) -> Result<Vec<u8>> {
        let last_seq = self.last_sequence();
        self.views.lock().unwrap().select_view(
            last_seq,
            ddoc_id,
            view_name,
            select_name,
            query_params,
            stale,
        )
    }

    /// Tear down views, then readers. The writer closes on drop.
    pub fn close(&self) {
        self.views.lock().unwrap().close();
        self.readers.close();
    }

    fn with_reader<T>(&self, f: impl FnOnce(&DatabaseReader) -> Result<T>) -> Result<T> {
        let reader = self.readers.borrow()?;
        reader.begin()?;
        let result = f(&reader);
        match reader.commit() {
            Ok(()) => result,
            Err(commit_err) => result.and(Err(commit_err)),
        }
    }
}
