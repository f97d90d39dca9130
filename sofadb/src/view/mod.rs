use crate::database::DB_EXT;
use crate::document::{DesignDocument, DesignDocumentView, Document};
use crate::error::{Result, SofaError};
use crc::{Algorithm, Crc};
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// CRC-32 used for view-file signatures. Reflected form of the polynomial
/// 0xD5828281 (normal form 0x814141AB).
const SIGNATURE_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x814141ab,
    init: 0xffffffff,
    refin: true,
    refout: true,
    xorout: 0xffffffff,
    check: 0xa9cc8179,
    residue: 0x00000000,
};

/// Signature of a view definition: CRC-32 over the concatenated setup,
/// update and delete scripts, in declared order, rendered in decimal.
/// Definitions with identical scripts share one view file.
pub fn signature(def: &DesignDocumentView) -> String {
    let crc = Crc::<u32>::new(&SIGNATURE_ALGORITHM);
    let mut digest = crc.digest();
    for script in &def.setup {
        digest.update(script.as_bytes());
    }
    for script in &def.update {
        digest.update(script.as_bytes());
    }
    for script in &def.delete {
        digest.update(script.as_bytes());
    }
    digest.finalize().to_string()
}

/// A script with `${name}` placeholders rewritten to positional markers,
/// plus the placeholder names in order of appearance (repeats included).
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub text: String,
    pub params: Vec<String>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{(.*?)\}").expect("placeholder pattern"))
}

pub fn compile_query(query: &str) -> CompiledQuery {
    let re = placeholder_regex();
    let params = re
        .captures_iter(query)
        .map(|caps| caps[1].to_string())
        .collect();
    let text = re.replace_all(query, "?").into_owned();
    CompiledQuery { text, params }
}

/// One materialized index: an open view file with the parent database
/// attached as `docsdb`, plus the compiled scripts of its definition and the
/// last `(seq_number, seq_id)` applied to it.
pub struct View {
    ddoc_id: String,
    name: String,
    last_seq_number: i64,
    last_seq_id: String,
    conn: Connection,
    delete_scripts: Vec<CompiledQuery>,
    update_scripts: Vec<CompiledQuery>,
    select_scripts: HashMap<String, CompiledQuery>,
}

const VIEW_META_SQL: &str = "
    CREATE TABLE IF NOT EXISTS view_meta (
        id                  INTEGER PRIMARY KEY,
        seq_number          INTEGER,
        seq_id              TEXT,
        design_doc_updated  INTEGER
    ) WITHOUT ROWID;

    INSERT INTO view_meta (id, seq_number, seq_id, design_doc_updated)
        SELECT 1, 0, '', 0 WHERE NOT EXISTS (SELECT 1 FROM view_meta WHERE id = 1);
    ";

impl View {
    /// Open (creating if necessary) the view file, attach the parent
    /// database, run the idempotent setup scripts, and load the last
    /// applied sequence from `view_meta`.
    pub fn open(
        db_file_path: &Path,
        view_file_path: &Path,
        view_name: &str,
        ddoc: &DesignDocument,
    ) -> Result<View> {
        let def = ddoc.views.get(view_name).ok_or(SofaError::ViewNotFound)?;

        let conn = Connection::open(view_file_path)?;
        conn.execute_batch("PRAGMA journal_mode = MEMORY;")?;
        conn.execute_batch(VIEW_META_SQL)?;
        conn.execute(
            "ATTACH DATABASE ?1 AS docsdb",
            params![db_file_path.to_string_lossy()],
        )?;

        for script in &def.setup {
            conn.execute_batch(&compile_query(script).text)?;
        }

        let (last_seq_number, last_seq_id) = conn.query_row(
            "SELECT seq_number, seq_id FROM view_meta WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(View {
            ddoc_id: ddoc.id.clone(),
            name: view_name.to_string(),
            last_seq_number,
            last_seq_id,
            conn,
            delete_scripts: def.delete.iter().map(|s| compile_query(s)).collect(),
            update_scripts: def.update.iter().map(|s| compile_query(s)).collect(),
            select_scripts: def
                .select
                .iter()
                .map(|(k, v)| (k.clone(), compile_query(v)))
                .collect(),
        })
    }

    pub fn last_sequence(&self) -> (i64, &str) {
        (self.last_seq_number, &self.last_seq_id)
    }

    /// Bring the view current up to `(target_number, target_id)`: clear the
    /// stale window, materialize the new one, and advance `view_meta`, all
    /// in one transaction on the view file. Idempotent for equal targets.
    pub fn build(&mut self, target_number: i64, target_id: &str) -> Result<()> {
        if self.last_seq_number == target_number && self.last_seq_id == target_id {
            return Ok(());
        }
        log::debug!(
            "building view {}${} from {} to {}",
            self.ddoc_id,
            self.name,
            self.last_seq_number,
            target_number
        );

        self.conn.execute_batch("BEGIN TRANSACTION")?;
        match self.build_window(target_number, target_id) {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                self.last_seq_number = target_number;
                self.last_seq_id = target_id.to_string();
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn build_window(&self, target_number: i64, target_id: &str) -> Result<()> {
        for script in self.delete_scripts.iter().chain(&self.update_scripts) {
            let values = self.window_values(script, target_number, target_id);
            self.conn
                .execute(&script.text, params_from_iter(values))?;
        }
        self.conn.execute(
            "UPDATE view_meta SET seq_number = ?1, seq_id = ?2 WHERE id = 1",
            params![target_number, target_id],
        )?;
        Ok(())
    }

    fn window_values(
        &self,
        script: &CompiledQuery,
        target_number: i64,
        target_id: &str,
    ) -> Vec<SqlValue> {
        script
            .params
            .iter()
            .map(|name| match name.as_str() {
                "begin_seq_number" => SqlValue::Integer(self.last_seq_number),
                "end_seq_number" => SqlValue::Integer(target_number),
                "begin_seq_id" => SqlValue::Text(self.last_seq_id.clone()),
                "end_seq_id" => SqlValue::Text(target_id.to_string()),
                _ => SqlValue::Null,
            })
            .collect()
    }

    /// Run one named select. Each placeholder binds the matching query
    /// parameter; absent or empty parameters bind null. The query returns a
    /// single JSON text column, passed through verbatim.
    pub fn select(&self, name: &str, query_params: &HashMap<String, String>) -> Result<Vec<u8>> {
        let script = self
            .select_scripts
            .get(name)
            .ok_or(SofaError::ViewSelectNotFound)?;

        let values: Vec<SqlValue> = script
            .params
            .iter()
            .map(|name| match query_params.get(name) {
                Some(v) if !v.is_empty() => SqlValue::Text(v.clone()),
                _ => SqlValue::Null,
            })
            .collect();

        let result: String =
            self.conn
                .query_row(&script.text, params_from_iter(values), |row| row.get(0))?;
        Ok(result.into_bytes())
    }

    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }
}

/// The built-in `_design/_views` document, installed on database creation.
/// Its `_all_docs` view materializes one row per live document.
pub fn builtin_design_document() -> DesignDocument {
    let mut select = HashMap::new();
    select.insert(
        "default".to_string(),
        "SELECT JSON_OBJECT('offset', 0, \
            'rows', JSON_GROUP_ARRAY(JSON_OBJECT('key', key, 'value', JSON(value), 'id', doc_id)), \
            'total_rows', (SELECT COUNT(1) FROM all_docs)) AS rs \
         FROM (SELECT * FROM all_docs ORDER BY key) \
         WHERE (${key} IS NULL OR key = ${key})"
            .to_string(),
    );
    select.insert(
        "with_docs".to_string(),
        "SELECT JSON_OBJECT('offset', 0, \
            'rows', JSON_GROUP_ARRAY(JSON_OBJECT('key', a.key, 'value', JSON(a.value), 'id', a.doc_id, 'doc', JSON(d.data))), \
            'total_rows', (SELECT COUNT(1) FROM all_docs)) AS rs \
         FROM (SELECT * FROM all_docs ORDER BY key) a \
         JOIN docsdb.documents d USING (doc_id) \
         WHERE (${key} IS NULL OR a.key = ${key})"
            .to_string(),
    );

    let all_docs = DesignDocumentView {
        setup: vec![
            "CREATE TABLE IF NOT EXISTS all_docs (key TEXT PRIMARY KEY, value TEXT, doc_id TEXT)"
                .to_string(),
        ],
        delete: vec![
            "DELETE FROM all_docs WHERE doc_id IN (\
                SELECT DISTINCT doc_id FROM docsdb.changes \
                WHERE seq_number > ${begin_seq_number} AND seq_id > ${begin_seq_id} \
                  AND seq_number <= ${end_seq_number} AND seq_id <= ${end_seq_id})"
                .to_string(),
        ],
        update: vec![
            "INSERT INTO all_docs (key, value, doc_id) \
             SELECT d.doc_id, JSON_OBJECT('version', JSON_EXTRACT(d.data, '$._version')), d.doc_id \
             FROM docsdb.documents d \
             JOIN (SELECT DISTINCT doc_id FROM docsdb.changes \
                   WHERE seq_number > ${begin_seq_number} AND seq_id > ${begin_seq_id} \
                     AND seq_number <= ${end_seq_number} AND seq_id <= ${end_seq_id}) c \
             USING (doc_id) \
             WHERE d.deleted = 0"
                .to_string(),
        ],
        select,
    };

    let mut views = HashMap::new();
    views.insert("_all_docs".to_string(), all_docs);
    DesignDocument {
        id: "_design/_views".to_string(),
        version: 0,
        views,
    }
}

/// Per-database catalog of design documents and open views. View files are
/// shared by content signature and reference-counted through `view_files`;
/// a file with no remaining referrers is deleted from disk.
pub struct ViewManager {
    db_name: String,
    db_file_path: PathBuf,
    view_dir: PathBuf,
    views: HashMap<String, View>,
    ddocs: HashMap<String, DesignDocument>,
    view_files: HashMap<String, HashSet<String>>,
}

impl ViewManager {
    pub fn new(db_name: impl Into<String>, db_file_path: PathBuf, view_dir: PathBuf) -> ViewManager {
        ViewManager {
            db_name: db_name.into(),
            db_file_path,
            view_dir,
            views: HashMap::new(),
            ddocs: HashMap::new(),
            view_files: HashMap::new(),
        }
    }

    fn file_stem(&self, def: &DesignDocumentView) -> String {
        format!("{}${}", self.db_name, signature(def))
    }

    fn file_path(&self, stem: &str) -> PathBuf {
        self.view_dir.join(format!("{stem}{DB_EXT}"))
    }

    /// (Re)build the catalog from the given design documents and the view
    /// directory: seed referrer sets for files present on disk and remove
    /// files nothing references any more.
    pub fn initialize(&mut self, design_docs: &[Document]) -> Result<()> {
        self.views.clear();
        self.ddocs.clear();
        self.view_files.clear();

        for doc in design_docs {
            match DesignDocument::parse(doc.to_json().as_bytes()) {
                Ok(ddoc) => {
                    self.ddocs.insert(doc.id.clone(), ddoc);
                }
                Err(e) => log::error!("skipping malformed design document {}: {e}", doc.id),
            }
        }

        for stem in self.list_view_files()? {
            self.view_files.insert(stem, HashSet::new());
        }

        let mut references = Vec::new();
        for (id, ddoc) in &self.ddocs {
            for (view_name, def) in &ddoc.views {
                references.push((self.file_stem(def), format!("{id}${view_name}")));
            }
        }
        for (stem, qualified) in references {
            // Files not on disk get no back-reference; they are created
            // lazily on first use.
            if let Some(refs) = self.view_files.get_mut(&stem) {
                refs.insert(qualified);
            }
        }

        let orphans: Vec<String> = self
            .view_files
            .iter()
            .filter(|(_, refs)| refs.is_empty())
            .map(|(stem, _)| stem.clone())
            .collect();
        for stem in orphans {
            self.view_files.remove(&stem);
            let _ = std::fs::remove_file(self.file_path(&stem));
        }

        log::debug!(
            "view catalog for {}: {} design documents, {} view files",
            self.db_name,
            self.ddocs.len(),
            self.view_files.len()
        );
        Ok(())
    }

    /// View files on disk belonging to this database: `<dbName>$*.db`.
    pub fn list_view_files(&self) -> Result<Vec<String>> {
        let prefix = format!("{}$", self.db_name);
        let mut stems = Vec::new();
        for entry in std::fs::read_dir(&self.view_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(DB_EXT) {
                stems.push(name.trim_end_matches(DB_EXT).to_string());
            }
        }
        Ok(stems)
    }

    fn open_view(&mut self, view_name: &str, ddoc: &DesignDocument) -> Result<()> {
        let def = ddoc.views.get(view_name).ok_or(SofaError::ViewNotFound)?;
        let stem = self.file_stem(def);
        let qualified = format!("{}${}", ddoc.id, view_name);

        let view = View::open(&self.db_file_path, &self.file_path(&stem), view_name, ddoc)?;
        self.views.insert(qualified.clone(), view);
        self.view_files.entry(stem).or_default().insert(qualified);
        Ok(())
    }

    /// Locate (opening lazily) the view and run one of its selects. Unless
    /// `stale` is set, the view is first built up to `last_seq`.
    pub fn select_view(
        &mut self,
        last_seq: (i64, String),
        ddoc_id: &str,
        view_name: &str,
        select_name: &str,
        query_params: &HashMap<String, String>,
        stale: bool,
    ) -> Result<Vec<u8>> {
        let qualified = format!("{ddoc_id}${view_name}");

        if !self.views.contains_key(&qualified) {
            let ddoc = self
                .ddocs
                .get(ddoc_id)
                .cloned()
                .ok_or(SofaError::DocNotFound)?;
            if !ddoc.views.contains_key(view_name) {
                return Err(SofaError::ViewNotFound);
            }
            self.open_view(view_name, &ddoc)?;
        }

        let view = self
            .views
            .get_mut(&qualified)
            .ok_or(SofaError::ViewNotFound)?;
        if !stale {
            view.build(last_seq.0, &last_seq.1)?;
        }
        view.select(select_name, query_params)
    }

    /// Reconcile the catalog after a design-document write: re-point each
    /// view at the file matching its new signature, close views whose
    /// signature changed, and garbage-collect files left without referrers.
    pub fn update_design_document(&mut self, ddoc_id: &str, body: &[u8]) -> Result<()> {
        let new_ddoc = DesignDocument::parse(body)?;
        let current = self.ddocs.get(ddoc_id).cloned();

        if let Some(current_ddoc) = current {
            for (view_name, new_def) in &new_ddoc.views {
                let qualified = format!("{ddoc_id}${view_name}");
                let current_stem = current_ddoc.views.get(view_name).map(|d| self.file_stem(d));
                let new_stem = self.file_stem(new_def);

                if current_stem.as_deref() != Some(new_stem.as_str()) {
                    self.views.remove(&qualified);
                    if let Some(stem) = &current_stem {
                        if let Some(refs) = self.view_files.get_mut(stem) {
                            refs.remove(&qualified);
                        }
                    }
                }

                self.view_files
                    .entry(new_stem)
                    .or_default()
                    .insert(qualified);

                if let Some(stem) = current_stem {
                    self.remove_if_unreferenced(&stem);
                }
            }

            for (view_name, old_def) in &current_ddoc.views {
                if new_ddoc.views.contains_key(view_name) {
                    continue;
                }
                let qualified = format!("{ddoc_id}${view_name}");
                self.views.remove(&qualified);
                let stem = self.file_stem(old_def);
                if let Some(refs) = self.view_files.get_mut(&stem) {
                    refs.remove(&qualified);
                }
                self.remove_if_unreferenced(&stem);
            }
        } else {
            for (view_name, def) in &new_ddoc.views {
                let stem = self.file_stem(def);
                self.view_files
                    .entry(stem)
                    .or_default()
                    .insert(format!("{ddoc_id}${view_name}"));
            }
        }

        self.ddocs.insert(ddoc_id.to_string(), new_ddoc);
        Ok(())
    }

    /// Tear down a deleted design document: close its views, drop its
    /// referrers, and garbage-collect its files.
    pub fn remove_design_document(&mut self, ddoc_id: &str) -> Result<()> {
        let Some(ddoc) = self.ddocs.remove(ddoc_id) else {
            return Ok(());
        };
        for (view_name, def) in &ddoc.views {
            let qualified = format!("{ddoc_id}${view_name}");
            self.views.remove(&qualified);
            let stem = self.file_stem(def);
            if let Some(refs) = self.view_files.get_mut(&stem) {
                refs.remove(&qualified);
            }
            self.remove_if_unreferenced(&stem);
        }
        Ok(())
    }

    fn remove_if_unreferenced(&mut self, stem: &str) {
        let empty = self
            .view_files
            .get(stem)
            .map(|refs| refs.is_empty())
            .unwrap_or(false);
        if empty {
            self.view_files.remove(stem);
            let _ = std::fs::remove_file(self.file_path(stem));
        }
    }

    pub fn vacuum(&mut self) -> Result<()> {
        for view in self.views.values() {
            view.vacuum()?;
        }
        Ok(())
    }

    /// Close every open view, dropping their connections.
    pub fn close(&mut self) {
        self.views.clear();
    }

    #[cfg(test)]
    pub(crate) fn view_file_refs(&self) -> &HashMap<String, HashSet<String>> {
        &self.view_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_def(update: &str) -> DesignDocumentView {
        DesignDocumentView {
            setup: vec!["CREATE TABLE IF NOT EXISTS t (k TEXT)".to_string()],
            delete: vec!["DELETE FROM t".to_string()],
            update: vec![update.to_string()],
            select: HashMap::new(),
        }
    }

    #[test]
    fn test_signature_is_stable_and_content_addressed() {
        let a = sample_def("INSERT INTO t VALUES (1)");
        let b = sample_def("INSERT INTO t VALUES (1)");
        let c = sample_def("INSERT INTO t VALUES (2)");

        assert_eq!(signature(&a), signature(&b));
        assert_ne!(signature(&a), signature(&c));
    }

    #[test]
    fn test_signature_known_value() {
        // CRC-32(poly 0xD5828281) over "abc", decimal-rendered.
        let def = DesignDocumentView {
            setup: vec!["a".to_string()],
            update: vec!["b".to_string()],
            delete: vec!["c".to_string()],
            select: HashMap::new(),
        };
        assert_eq!(signature(&def), "1569688397");
    }

    #[test]
    fn test_signature_ignores_select_scripts() {
        let mut a = sample_def("INSERT INTO t VALUES (1)");
        let mut b = sample_def("INSERT INTO t VALUES (1)");
        a.select.insert("default".to_string(), "SELECT 1".to_string());
        b.select.insert("default".to_string(), "SELECT 2".to_string());
        assert_eq!(signature(&a), signature(&b));
    }

    #[test]
    fn test_compile_query_rewrites_placeholders() {
        let q = compile_query("SELECT * FROM t WHERE a = ${x} AND b = ${y} AND c = ${x}");
        assert_eq!(q.text, "SELECT * FROM t WHERE a = ? AND b = ? AND c = ?");
        assert_eq!(q.params, vec!["x", "y", "x"]);

        let q = compile_query("SELECT 1");
        assert_eq!(q.text, "SELECT 1");
        assert!(q.params.is_empty());
    }

    mod view_file {
        use super::super::*;
        use crate::writer::DatabaseWriter;
        use tempfile::TempDir;

        fn seed_database(dir: &TempDir) -> PathBuf {
            let path = dir.path().canonicalize().unwrap().join("x.db");
            let writer = DatabaseWriter::open(&path).unwrap();
            writer.begin().unwrap();
            writer.exec_build_script().unwrap();
            for (seq, id) in [(1, "a"), (2, "b")] {
                let body = format!(r#"{{"_id":"{id}","_version":1}}"#);
                let doc = Document::parse(body.as_bytes()).unwrap();
                writer
                    .put_document(seq, &format!("seq-{seq:03}"), &doc, None)
                    .unwrap();
            }
            writer.commit().unwrap();
            path
        }

        #[test]
        fn test_open_build_and_select() {
            let dir = TempDir::new().unwrap();
            let db_path = seed_database(&dir);
            let view_path = dir.path().join("x$sig.db");

            let ddoc = builtin_design_document();
            let mut view = View::open(&db_path, &view_path, "_all_docs", &ddoc).unwrap();
            assert_eq!(view.last_sequence(), (0, ""));

            view.build(2, "seq-002").unwrap();
            assert_eq!(view.last_sequence(), (2, "seq-002"));

            let result = view.select("default", &HashMap::new()).unwrap();
            let parsed: serde_json::Value = serde_json::from_slice(&result).unwrap();
            assert_eq!(parsed["total_rows"], 2);

            let err = view.select("missing", &HashMap::new()).unwrap_err();
            assert_eq!(err.code(), "view_select_not_found");
        }

        #[test]
        fn test_meta_sequence_survives_reopen() {
            let dir = TempDir::new().unwrap();
            let db_path = seed_database(&dir);
            let view_path = dir.path().join("x$sig.db");

            let ddoc = builtin_design_document();
            let mut view = View::open(&db_path, &view_path, "_all_docs", &ddoc).unwrap();
            view.build(2, "seq-002").unwrap();
            drop(view);

            let view = View::open(&db_path, &view_path, "_all_docs", &ddoc).unwrap();
            assert_eq!(view.last_sequence(), (2, "seq-002"));
        }

        #[test]
        fn test_build_with_equal_target_is_a_no_op() {
            let dir = TempDir::new().unwrap();
            let db_path = seed_database(&dir);
            let view_path = dir.path().join("x$sig.db");

            let ddoc = builtin_design_document();
            let mut view = View::open(&db_path, &view_path, "_all_docs", &ddoc).unwrap();
            view.build(2, "seq-002").unwrap();
            // A second build with the same target must not re-run the update
            // scripts: re-inserting would violate the all_docs primary key.
            view.build(2, "seq-002").unwrap();
            let result = view.select("default", &HashMap::new()).unwrap();
            let parsed: serde_json::Value = serde_json::from_slice(&result).unwrap();
            assert_eq!(parsed["total_rows"], 2);
        }
    }

    mod catalog {
        use super::super::*;
        use tempfile::TempDir;

        fn ddoc_with(id: &str, update: &str) -> Vec<u8> {
            let mut views = HashMap::new();
            views.insert(
                "v".to_string(),
                DesignDocumentView {
                    update: vec![update.to_string()],
                    ..Default::default()
                },
            );
            let ddoc = DesignDocument {
                id: id.to_string(),
                version: 0,
                views,
            };
            serde_json::to_vec(&ddoc).unwrap()
        }

        fn manager(dir: &TempDir) -> ViewManager {
            ViewManager::new("x", dir.path().join("x.db"), dir.path().to_path_buf())
        }

        #[test]
        fn test_identical_definitions_share_a_referrer_set() {
            let dir = TempDir::new().unwrap();
            let mut mgr = manager(&dir);

            mgr.update_design_document("_design/d", &ddoc_with("_design/d", "INSERT 1"))
                .unwrap();
            mgr.update_design_document("_design/d2", &ddoc_with("_design/d2", "INSERT 1"))
                .unwrap();

            let refs = mgr.view_file_refs();
            assert_eq!(refs.len(), 1);
            let shared = refs.values().next().unwrap();
            assert!(shared.contains("_design/d$v"));
            assert!(shared.contains("_design/d2$v"));
        }

        #[test]
        fn test_signature_change_repoints_one_referrer() {
            let dir = TempDir::new().unwrap();
            let mut mgr = manager(&dir);
            mgr.update_design_document("_design/d", &ddoc_with("_design/d", "INSERT 1"))
                .unwrap();
            mgr.update_design_document("_design/d2", &ddoc_with("_design/d2", "INSERT 1"))
                .unwrap();

            mgr.update_design_document("_design/d", &ddoc_with("_design/d", "INSERT 2"))
                .unwrap();

            let refs = mgr.view_file_refs();
            assert_eq!(refs.len(), 2);
            for referrers in refs.values() {
                assert_eq!(referrers.len(), 1);
            }
        }

        #[test]
        fn test_removed_views_are_garbage_collected() {
            let dir = TempDir::new().unwrap();
            let mut mgr = manager(&dir);
            mgr.update_design_document("_design/d", &ddoc_with("_design/d", "INSERT 1"))
                .unwrap();
            mgr.update_design_document("_design/d2", &ddoc_with("_design/d2", "INSERT 1"))
                .unwrap();

            mgr.remove_design_document("_design/d2").unwrap();
            let refs = mgr.view_file_refs();
            assert_eq!(refs.len(), 1);
            assert!(refs.values().next().unwrap().contains("_design/d$v"));

            mgr.remove_design_document("_design/d").unwrap();
            assert!(mgr.view_file_refs().is_empty());
        }

        #[test]
        fn test_malformed_design_document_is_rejected() {
            let dir = TempDir::new().unwrap();
            let mut mgr = manager(&dir);
            let err = mgr
                .update_design_document("_design/bad", br#"{"_id":"_design/bad","views":[]}"#)
                .unwrap_err();
            assert_eq!(err.code(), "invalid_design_document");
        }
    }
}
