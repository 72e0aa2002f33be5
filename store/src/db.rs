//! SQLite-backed storage for the entity graph.
//!
//! One connection, serialized behind a mutex; foreign keys are enforced at
//! the SQLite level. Rows handed out are value snapshots, so callers cannot
//! mutate stored state except through [`Storage::save_row`] and
//! [`Storage::update_row`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};

use crate::entity::Row;
use crate::filter::{CompareOp, Filter, FilterStringError, FilterValue};
use crate::object_store::{FileObjectStore, InMemoryObjectStore, ObjectStore};
use crate::{StoreError, StoreResult};

const DB_FILENAME: &str = "storage.sqlite";
const OBJECTS_DIRNAME: &str = "objects";

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    objects: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// In-memory storage, for tests and scratch work.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            objects: Arc::new(InMemoryObjectStore::new()),
        })
    }

    /// Open a project directory holding `storage.sqlite` and `objects/`.
    ///
    /// With `init` set, the directory and both stores are created as needed;
    /// without it, anything missing is an error.
    pub fn from_path(dir: impl AsRef<Path>, init: bool) -> StoreResult<Self> {
        let dir = dir.as_ref();
        let objects_dir = dir.join(OBJECTS_DIRNAME);
        let db_path = dir.join(DB_FILENAME);
        if init {
            std::fs::create_dir_all(&objects_dir)?;
        } else {
            if !dir.is_dir() {
                return Err(StoreError::Validation(format!(
                    "storage path not found (initialize it first): {}",
                    dir.display()
                )));
            }
            if !objects_dir.is_dir() {
                return Err(StoreError::Validation(format!(
                    "object store path not found: {}",
                    objects_dir.display()
                )));
            }
            if !db_path.is_file() {
                return Err(StoreError::Validation(format!(
                    "database path not found: {}",
                    db_path.display()
                )));
            }
        }
        let conn = if db_path.exists() {
            open_db(&db_path)?
        } else {
            let conn = create_db(&db_path)?;
            create_tables(&conn)?;
            conn
        };
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            objects: Arc::new(FileObjectStore::new(objects_dir)?),
        })
    }

    /// The object store living alongside the database.
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("storage mutex is never poisoned")
    }

    /// Insert a new row, assigning its primary key.
    ///
    /// Rows that already carry a pk are snapshots of stored state and are
    /// rejected; saving a calcjob also creates its process row in the same
    /// transaction.
    pub fn save_row<R: Row>(&self, row: &mut R) -> StoreResult<i64> {
        if row.pk().is_some() {
            return Err(StoreError::AlreadySaved(row.display_name()));
        }
        row.validate(self.objects.as_ref())?;
        tracing::debug!(table = R::TABLE, "saving row");
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let pk = insert_row(&tx, row)?;
        tx.commit()?;
        Ok(pk)
    }

    /// Delete a row. Rows referenced by other rows report as undeletable.
    pub fn delete_row<R: Row>(&self, row: &R) -> StoreResult<()> {
        let Some(pk) = row.pk() else {
            return Err(StoreError::Validation(format!(
                "{} not saved",
                row.display_name()
            )));
        };
        let conn = self.lock();
        let sql = format!("DELETE FROM {} WHERE pk = ?1", R::TABLE);
        match conn.execute(&sql, [pk]) {
            Ok(0) => Err(StoreError::RowNotFound {
                entity: R::TABLE,
                pk,
            }),
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => {
                Err(StoreError::Undeletable(row.display_name()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_row<R: Row>(&self, pk: i64) -> StoreResult<R> {
        let conn = self.lock();
        get_row(&conn, pk)
    }

    pub fn has_row<R: Row>(&self, pk: i64) -> StoreResult<bool> {
        let conn = self.lock();
        let sql = format!("SELECT 1 FROM {} WHERE pk = ?1", R::TABLE);
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.exists([pk])?)
    }

    /// Fetch a single column of a row, converted to `T`.
    pub fn get_column<R: Row, T: rusqlite::types::FromSql>(
        &self,
        column: &str,
        pk: i64,
    ) -> StoreResult<T> {
        check_column::<R>(column, column)?;
        let conn = self.lock();
        let sql = format!("SELECT {column} FROM {} WHERE pk = ?1", R::TABLE);
        conn.query_row(&sql, [pk], |row| row.get(0)).map_err(|err| {
            if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
                StoreError::RowNotFound {
                    entity: R::TABLE,
                    pk,
                }
            } else {
                err.into()
            }
        })
    }

    /// Count rows, with optional filters joined by AND.
    pub fn count_rows<R: Row>(&self, where_: &[Filter]) -> StoreResult<u64> {
        let (clause, params) = render_where::<R>(where_)?;
        let conn = self.lock();
        let sql = format!("SELECT COUNT(*) FROM {}{clause}", R::TABLE);
        let count =
            conn.query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?;
        Ok(count)
    }

    /// Page through rows ordered by pk. `page` is 1-based; a `page_size` of
    /// `None` returns everything.
    pub fn iter_rows<R: Row>(
        &self,
        page: usize,
        page_size: Option<usize>,
        where_: &[Filter],
    ) -> StoreResult<Vec<R>> {
        let (clause, params) = render_where::<R>(where_)?;
        let mut sql = format!(
            "SELECT pk, {} FROM {}{clause} ORDER BY pk",
            R::COLUMNS.join(", "),
            R::TABLE
        );
        if let Some(size) = page_size {
            let offset = page.saturating_sub(1) * size;
            sql.push_str(&format!(" LIMIT {size} OFFSET {offset}"));
        }
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params), |row| R::from_sql(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Write a mutated snapshot back. Engine-internal: step transitions and
    /// ingestion fixups go through here, user code should save new rows.
    pub fn update_row<R: Row>(&self, row: &R) -> StoreResult<()> {
        let conn = self.lock();
        update_row(&conn, row)
    }
}

fn open_db(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    set_pragmas(&conn)?;
    Ok(conn)
}

fn create_db(path: &Path) -> StoreResult<Connection> {
    let _file = std::fs::File::options()
        .write(true)
        .read(true)
        .create_new(true)
        .open(path)?;
    open_db(path)
}

fn set_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS client(
          pk INTEGER PRIMARY KEY,
          label TEXT UNIQUE NOT NULL,
          client_url TEXT NOT NULL,
          client_id TEXT NOT NULL,
          client_secret TEXT NOT NULL,
          token_uri TEXT NOT NULL,
          machine_name TEXT NOT NULL,
          work_dir TEXT NOT NULL,
          fsystem TEXT NOT NULL DEFAULT 'posix',
          small_file_size_mb INTEGER NOT NULL DEFAULT 5
        );

        CREATE TABLE IF NOT EXISTS code(
          pk INTEGER PRIMARY KEY,
          label TEXT NOT NULL,
          client_pk INTEGER NOT NULL,
          script TEXT NOT NULL,
          upload_paths TEXT NOT NULL DEFAULT '{}',
          FOREIGN KEY(client_pk) REFERENCES client(pk),
          UNIQUE (client_pk, label)
        );

        CREATE TABLE IF NOT EXISTS calcjob(
          pk INTEGER PRIMARY KEY,
          label TEXT NOT NULL DEFAULT '',
          uuid TEXT NOT NULL,
          code_pk INTEGER NOT NULL,
          parameters TEXT NOT NULL DEFAULT '{}',
          upload_paths TEXT NOT NULL DEFAULT '{}',
          download_globs TEXT NOT NULL DEFAULT '[]',
          FOREIGN KEY(code_pk) REFERENCES code(pk)
        );

        CREATE TABLE IF NOT EXISTS process(
          pk INTEGER PRIMARY KEY,
          calcjob_pk INTEGER UNIQUE NOT NULL,
          step TEXT NOT NULL DEFAULT 'created',
          state TEXT NOT NULL DEFAULT 'playing',
          job_id TEXT,
          exception TEXT,
          retrieved_paths TEXT NOT NULL DEFAULT '{}',
          FOREIGN KEY(calcjob_pk) REFERENCES calcjob(pk) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS datanode(
          pk INTEGER PRIMARY KEY,
          creator_pk INTEGER NOT NULL,
          attributes TEXT NOT NULL DEFAULT '{}',
          FOREIGN KEY(creator_pk) REFERENCES calcjob(pk) ON DELETE CASCADE
        );
        "#,
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Insert within an already-open transaction.
pub(crate) fn insert_row<R: Row>(conn: &Connection, row: &mut R) -> StoreResult<i64> {
    let placeholders = (1..=R::COLUMNS.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {}({}) VALUES ({placeholders})",
        R::TABLE,
        R::COLUMNS.join(", ")
    );
    conn.execute(&sql, rusqlite::params_from_iter(row.to_sql()))?;
    let pk = conn.last_insert_rowid();
    row.set_pk(pk);
    row.on_saved(conn, pk)?;
    Ok(pk)
}

pub(crate) fn get_row<R: Row>(conn: &Connection, pk: i64) -> StoreResult<R> {
    let sql = format!(
        "SELECT pk, {} FROM {} WHERE pk = ?1",
        R::COLUMNS.join(", "),
        R::TABLE
    );
    conn.query_row(&sql, [pk], |row| R::from_sql(row))
        .map_err(|err| {
            if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
                StoreError::RowNotFound {
                    entity: R::TABLE,
                    pk,
                }
            } else {
                err.into()
            }
        })
}

pub(crate) fn update_row<R: Row>(conn: &Connection, row: &R) -> StoreResult<()> {
    let Some(pk) = row.pk() else {
        return Err(StoreError::Validation(format!(
            "{} not saved",
            row.display_name()
        )));
    };
    let assignments = R::COLUMNS
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments} WHERE pk = ?{}",
        R::TABLE,
        R::COLUMNS.len() + 1
    );
    let mut params = row.to_sql();
    params.push(SqlValue::Integer(pk));
    let changed = conn.execute(&sql, rusqlite::params_from_iter(params))?;
    if changed == 0 {
        return Err(StoreError::RowNotFound {
            entity: R::TABLE,
            pk,
        });
    }
    Ok(())
}

fn check_column<R: Row>(column: &str, filter_string: &str) -> Result<(), FilterStringError> {
    if column == "pk" || R::COLUMNS.contains(&column) {
        Ok(())
    } else {
        Err(FilterStringError::new(
            filter_string,
            format!("Unknown column {column:?}"),
            format!("{} has no column {column:?}", R::TABLE),
        ))
    }
}

fn push_value(value: &FilterValue, params: &mut Vec<SqlValue>) {
    params.push(match value {
        FilterValue::Int(v) => SqlValue::Integer(*v),
        FilterValue::Float(v) => SqlValue::Real(*v),
        FilterValue::Str(v) => SqlValue::Text(v.clone()),
        FilterValue::Bool(v) => SqlValue::Integer(*v as i64),
        FilterValue::Null | FilterValue::List(_) => unreachable!("handled by caller"),
    });
}

/// Render filters to a `WHERE` clause; an empty slice renders nothing.
/// Filters in the slice are joined by AND, the chain inside each filter
/// left-associatively as written.
fn render_where<R: Row>(filters: &[Filter]) -> StoreResult<(String, Vec<SqlValue>)> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut params = Vec::new();
    let mut rendered = Vec::new();
    for filter in filters {
        let mut sql = render_comparison::<R>(&filter.first, filter.raw(), &mut params)?;
        for (bool_op, comp) in &filter.rest {
            let next = render_comparison::<R>(comp, filter.raw(), &mut params)?;
            sql = format!("({sql} {} {next})", bool_op.sql());
        }
        rendered.push(sql);
    }
    Ok((format!(" WHERE {}", rendered.join(" AND ")), params))
}

fn render_comparison<R: Row>(
    comp: &crate::filter::Comparison,
    filter_string: &str,
    params: &mut Vec<SqlValue>,
) -> StoreResult<String> {
    check_column::<R>(&comp.column, filter_string)?;
    let column = &comp.column;
    match (&comp.op, &comp.value) {
        (CompareOp::In | CompareOp::NotIn, FilterValue::List(values)) => {
            let mut holes = Vec::with_capacity(values.len());
            for value in values {
                if matches!(value, FilterValue::Null | FilterValue::List(_)) {
                    return Err(FilterStringError::new(
                        filter_string,
                        "unknown right comparison",
                        "IN lists must contain scalar values",
                    )
                    .into());
                }
                push_value(value, params);
                holes.push(format!("?{}", params.len()));
            }
            Ok(format!("{column} {} ({})", comp.op.sql(), holes.join(", ")))
        }
        (CompareOp::In | CompareOp::NotIn, _) => Err(FilterStringError::new(
            filter_string,
            "unknown right comparison",
            "IN requires a list value",
        )
        .into()),
        (CompareOp::Eq, FilterValue::Null) => Ok(format!("{column} IS NULL")),
        (CompareOp::Ne, FilterValue::Null) => Ok(format!("{column} IS NOT NULL")),
        (_, FilterValue::Null) => Err(FilterStringError::new(
            filter_string,
            "unknown right comparison",
            "NULL only supports == and !=",
        )
        .into()),
        (_, FilterValue::List(_)) => Err(FilterStringError::new(
            filter_string,
            "unknown right comparison",
            "lists are only valid with IN",
        )
        .into()),
        (op, value) => {
            push_value(value, params);
            Ok(format!("{column} {} ?{}", op.sql(), params.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CalcJob, Client, Code, DataNode, FileSystem, Process, State, Step};

    fn client(label: &str) -> Client {
        Client {
            pk: None,
            label: label.into(),
            client_url: "http://localhost:8000".into(),
            client_id: "sample".into(),
            client_secret: "secret".into(),
            token_uri: "http://localhost:8080/token".into(),
            machine_name: "cluster".into(),
            work_dir: "/home/user".into(),
            fsystem: FileSystem::Posix,
            small_file_size_mb: 5,
        }
    }

    fn code(client_pk: i64, label: &str) -> Code {
        Code {
            pk: None,
            label: label.into(),
            client_pk,
            script: "echo hi".into(),
            upload_paths: Default::default(),
        }
    }

    fn calcjob(code_pk: i64) -> CalcJob {
        CalcJob {
            pk: None,
            label: String::new(),
            uuid: uuid::Uuid::new_v4().to_string(),
            code_pk,
            parameters: Default::default(),
            upload_paths: Default::default(),
            download_globs: vec!["**".into()],
        }
    }

    fn seed_job(storage: &Storage) -> (i64, i64, i64) {
        let mut cl = client("alpha");
        storage.save_row(&mut cl).unwrap();
        let mut co = code(cl.pk.unwrap(), "echo");
        storage.save_row(&mut co).unwrap();
        let mut job = calcjob(co.pk.unwrap());
        storage.save_row(&mut job).unwrap();
        (cl.pk.unwrap(), co.pk.unwrap(), job.pk.unwrap())
    }

    #[test]
    fn save_assigns_pk_and_rejects_resave() {
        let storage = Storage::in_memory().unwrap();
        let mut cl = client("alpha");
        let pk = storage.save_row(&mut cl).unwrap();
        assert_eq!(cl.pk, Some(pk));
        assert!(matches!(
            storage.save_row(&mut cl),
            Err(StoreError::AlreadySaved(_))
        ));
    }

    #[test]
    fn returned_rows_are_snapshots() {
        let storage = Storage::in_memory().unwrap();
        let mut cl = client("alpha");
        let pk = storage.save_row(&mut cl).unwrap();

        let mut read: Client = storage.get_row(pk).unwrap();
        read.label = "mutated".into();
        let reread: Client = storage.get_row(pk).unwrap();
        assert_eq!(reread.label, "alpha");

        storage.update_row(&read).unwrap();
        let reread: Client = storage.get_row(pk).unwrap();
        assert_eq!(reread.label, "mutated");
    }

    #[test]
    fn calcjob_save_creates_its_process() {
        let storage = Storage::in_memory().unwrap();
        let (_, _, job_pk) = seed_job(&storage);

        let processes: Vec<Process> = storage
            .iter_rows(1, None, &[Filter::eq("calcjob_pk", job_pk)])
            .unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].step, Step::Created);
        assert_eq!(processes[0].state, State::Playing);
    }

    #[test]
    fn deleting_calcjob_cascades() {
        let storage = Storage::in_memory().unwrap();
        let (_, _, job_pk) = seed_job(&storage);
        let mut node = DataNode {
            pk: None,
            creator_pk: job_pk,
            attributes: Default::default(),
        };
        storage.save_row(&mut node).unwrap();

        let job: CalcJob = storage.get_row(job_pk).unwrap();
        storage.delete_row(&job).unwrap();

        assert_eq!(storage.count_rows::<Process>(&[]).unwrap(), 0);
        assert_eq!(storage.count_rows::<DataNode>(&[]).unwrap(), 0);
    }

    #[test]
    fn referenced_client_is_undeletable() {
        let storage = Storage::in_memory().unwrap();
        let (client_pk, _, _) = seed_job(&storage);

        let cl: Client = storage.get_row(client_pk).unwrap();
        assert!(matches!(
            storage.delete_row(&cl),
            Err(StoreError::Undeletable(_))
        ));
        // the client is still there
        assert!(storage.has_row::<Client>(client_pk).unwrap());
    }

    #[test]
    fn duplicate_client_label_conflicts() {
        let storage = Storage::in_memory().unwrap();
        let mut first = client("alpha");
        storage.save_row(&mut first).unwrap();
        let mut second = client("alpha");
        assert!(storage.save_row(&mut second).is_err());
    }

    #[test]
    fn filters_compose_with_and() {
        let storage = Storage::in_memory().unwrap();
        for label in ["apple", "avocado", "banana"] {
            storage.save_row(&mut client(label)).unwrap();
        }
        let filter = Filter::parse("pk > 0 AND label LIKE 'a%'").unwrap().unwrap();
        let rows: Vec<Client> = storage.iter_rows(1, None, &[filter]).unwrap();
        let labels: Vec<_> = rows.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["apple", "avocado"]);
    }

    #[test]
    fn filter_in_list_returns_pk_ordered_rows() {
        let storage = Storage::in_memory().unwrap();
        for label in ["a", "b", "c", "d", "e"] {
            storage.save_row(&mut client(label)).unwrap();
        }
        let filter = Filter::parse("label IN ('a','c')").unwrap().unwrap();
        let rows: Vec<Client> = storage.iter_rows(1, None, &[filter]).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].pk.unwrap() < rows[1].pk.unwrap());
        assert_eq!(rows[0].label, "a");
        assert_eq!(rows[1].label, "c");
    }

    #[test]
    fn unknown_filter_column_is_rejected() {
        let storage = Storage::in_memory().unwrap();
        let filter = Filter::parse("nope == 1").unwrap().unwrap();
        let err = storage.count_rows::<Client>(&[filter]).unwrap_err();
        match err {
            StoreError::Filter(err) => assert!(err.user.starts_with("Unknown column")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn pagination_is_by_pk() {
        let storage = Storage::in_memory().unwrap();
        for i in 0..5 {
            storage.save_row(&mut client(&format!("c{i}"))).unwrap();
        }
        let page2: Vec<Client> = storage.iter_rows(2, Some(2), &[]).unwrap();
        let labels: Vec<_> = page2.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["c2", "c3"]);
    }

    #[test]
    fn get_column_fetches_single_values() {
        let storage = Storage::in_memory().unwrap();
        let mut cl = client("alpha");
        let pk = storage.save_row(&mut cl).unwrap();
        let label: String = storage.get_column::<Client, _>("label", pk).unwrap();
        assert_eq!(label, "alpha");
        assert!(storage.get_column::<Client, String>("nope", pk).is_err());
        assert!(matches!(
            storage.get_column::<Client, String>("label", 999),
            Err(StoreError::RowNotFound { .. })
        ));
    }

    #[test]
    fn null_filters_use_is_null() {
        let storage = Storage::in_memory().unwrap();
        seed_job(&storage);
        let filter = Filter::parse("job_id == NULL").unwrap().unwrap();
        assert_eq!(storage.count_rows::<Process>(&[filter]).unwrap(), 1);
        let filter = Filter::parse("job_id != NULL").unwrap().unwrap();
        assert_eq!(storage.count_rows::<Process>(&[filter]).unwrap(), 0);
    }

    #[test]
    fn project_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");
        assert!(Storage::from_path(&project, false).is_err());

        {
            let storage = Storage::from_path(&project, true).unwrap();
            storage.save_row(&mut client("alpha")).unwrap();
        }

        let storage = Storage::from_path(&project, false).unwrap();
        assert_eq!(storage.count_rows::<Client>(&[]).unwrap(), 1);
    }
}
