//! Row types for the entity graph.
//!
//! Client -> Code -> CalcJob <-> Process
//!                      |_ DataNode
//!
//! Each row has an integer primary key assigned by the store on first save;
//! equality and hashing are by (type, pk). The [`Row`] trait is the seam the
//! data-access layer works through.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::object_store::ObjectStore;
use crate::{StoreError, StoreResult};

/// Remote path semantics of a client's working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileSystem {
    #[default]
    Posix,
    Windows,
}

impl FileSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystem::Posix => "posix",
            FileSystem::Windows => "windows",
        }
    }

    pub fn separator(&self) -> char {
        match self {
            FileSystem::Posix => '/',
            FileSystem::Windows => '\\',
        }
    }
}

/// Position in the per-job step machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    #[default]
    Created,
    Uploading,
    Submitting,
    Running,
    Retrieving,
    Finalised,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Created => "created",
            Step::Uploading => "uploading",
            Step::Submitting => "submitting",
            Step::Running => "running",
            Step::Retrieving => "retrieving",
            Step::Finalised => "finalised",
        }
    }
}

/// Lifecycle flag orthogonal to [`Step`].
///
/// Only `playing` processes are picked up by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Playing,
    Paused,
    Finished,
    Excepted,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Playing => "playing",
            State::Paused => "paused",
            State::Finished => "finished",
            State::Excepted => "excepted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value {0:?}")]
pub struct UnknownVariant(pub String);

macro_rules! text_enum_from_str {
    ($ty:ident, $($text:literal => $variant:expr),+ $(,)?) => {
        impl std::str::FromStr for $ty {
            type Err = UnknownVariant;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum_from_str!(FileSystem, "posix" => FileSystem::Posix, "windows" => FileSystem::Windows);
text_enum_from_str!(
    Step,
    "created" => Step::Created,
    "uploading" => Step::Uploading,
    "submitting" => Step::Submitting,
    "running" => Step::Running,
    "retrieving" => Step::Retrieving,
    "finalised" => Step::Finalised,
);
text_enum_from_str!(
    State,
    "playing" => State::Playing,
    "paused" => State::Paused,
    "finished" => State::Finished,
    "excepted" => State::Excepted,
);

/// Friendly names used as default labels.
pub const NAMES: &[&str] = &[
    "amber_anvil",
    "brisk_beacon",
    "calm_comet",
    "daring_drift",
    "eager_ember",
    "fleet_falcon",
    "gentle_glacier",
    "hardy_harbor",
    "ivory_isotope",
    "jolly_junction",
    "keen_kestrel",
    "lucid_lantern",
    "mellow_meridian",
    "nimble_nebula",
    "opal_orbit",
    "placid_pylon",
    "quiet_quasar",
    "rustic_rampart",
    "steady_summit",
    "tidal_turbine",
    "umber_uplink",
    "vivid_vector",
    "wistful_warden",
    "zesty_zenith",
];

/// Pick a default label from the friendly-name pool.
pub fn random_label() -> String {
    use rand::seq::SliceRandom;
    NAMES
        .choose(&mut rand::thread_rng())
        .expect("name pool is non-empty")
        .to_string()
}

/// Mapping of relative POSIX path to object key, `None` meaning "directory".
pub type UploadPaths = BTreeMap<String, Option<String>>;

/// The data-access seam between row types and the SQLite layer.
pub trait Row: Sized + Send {
    const TABLE: &'static str;
    /// All columns except `pk`, in insert order.
    const COLUMNS: &'static [&'static str];

    fn pk(&self) -> Option<i64>;
    fn set_pk(&mut self, pk: i64);

    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
    fn to_sql(&self) -> Vec<SqlValue>;

    /// Pre-save validation against the object store.
    fn validate(&self, _objects: &dyn ObjectStore) -> StoreResult<()> {
        Ok(())
    }

    /// Follow-up writes in the same transaction as the insert.
    fn on_saved(&self, _conn: &Connection, _pk: i64) -> rusqlite::Result<()> {
        Ok(())
    }

    fn display_name(&self) -> String {
        match self.pk() {
            Some(pk) => format!("{}({})", Self::TABLE, pk),
            None => format!("{}(unsaved)", Self::TABLE),
        }
    }
}

fn check_upload_paths(paths: &UploadPaths, objects: &dyn ObjectStore) -> StoreResult<()> {
    for (path, key) in paths {
        if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
            return Err(StoreError::Validation(format!(
                "upload path must be a relative POSIX path: {path:?}"
            )));
        }
        if let Some(key) = key {
            if !objects.contains(key) {
                return Err(StoreError::ObjectNotFound(key.clone()));
            }
        }
    }
    Ok(())
}

fn json_text<T: Serialize>(value: &T) -> SqlValue {
    SqlValue::Text(serde_json::to_string(value).expect("JSON column serializes"))
}

fn json_column<T: for<'de> Deserialize<'de>>(
    row: &rusqlite::Row<'_>,
    column: &str,
) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn enum_column<T: std::str::FromStr<Err = UnknownVariant>>(
    row: &rusqlite::Row<'_>,
    column: &str,
) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    text.parse().map_err(|err: UnknownVariant| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

macro_rules! row_identity {
    ($ty:ident) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.pk == other.pk
            }
        }

        impl Eq for $ty {}

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                Self::TABLE.hash(state);
                self.pk.hash(state);
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.display_name())
            }
        }
    };
}

/// Connection to one remote endpoint for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    #[serde(default)]
    pub pk: Option<i64>,
    #[serde(default = "random_label")]
    pub label: String,
    pub client_url: String,
    pub client_id: String,
    /// Opaque credential, stored as given.
    pub client_secret: String,
    pub token_uri: String,
    pub machine_name: String,
    /// Absolute path on the remote machine.
    pub work_dir: String,
    #[serde(default)]
    pub fsystem: FileSystem,
    /// Inclusive threshold between simple and staged transfer.
    #[serde(default = "default_small_file_size_mb")]
    pub small_file_size_mb: u64,
}

fn default_small_file_size_mb() -> u64 {
    5
}

impl Client {
    pub fn small_file_limit_bytes(&self) -> u64 {
        self.small_file_size_mb * 1024 * 1024
    }

    /// Join path parts onto the working directory with this client's
    /// separator semantics.
    pub fn join_work_path(&self, parts: &[&str]) -> String {
        let sep = self.fsystem.separator();
        let mut out = self.work_dir.trim_end_matches(sep).to_string();
        for part in parts {
            out.push(sep);
            out.push_str(part);
        }
        out
    }
}

row_identity!(Client);

impl Row for Client {
    const TABLE: &'static str = "client";
    const COLUMNS: &'static [&'static str] = &[
        "label",
        "client_url",
        "client_id",
        "client_secret",
        "token_uri",
        "machine_name",
        "work_dir",
        "fsystem",
        "small_file_size_mb",
    ];

    fn pk(&self) -> Option<i64> {
        self.pk
    }

    fn set_pk(&mut self, pk: i64) {
        self.pk = Some(pk);
    }

    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pk: Some(row.get("pk")?),
            label: row.get("label")?,
            client_url: row.get("client_url")?,
            client_id: row.get("client_id")?,
            client_secret: row.get("client_secret")?,
            token_uri: row.get("token_uri")?,
            machine_name: row.get("machine_name")?,
            work_dir: row.get("work_dir")?,
            fsystem: enum_column(row, "fsystem")?,
            small_file_size_mb: row.get("small_file_size_mb")?,
        })
    }

    fn to_sql(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.label.clone()),
            SqlValue::Text(self.client_url.clone()),
            SqlValue::Text(self.client_id.clone()),
            SqlValue::Text(self.client_secret.clone()),
            SqlValue::Text(self.token_uri.clone()),
            SqlValue::Text(self.machine_name.clone()),
            SqlValue::Text(self.work_dir.clone()),
            SqlValue::Text(self.fsystem.as_str().to_string()),
            SqlValue::Integer(self.small_file_size_mb as i64),
        ]
    }

    fn display_name(&self) -> String {
        match self.pk {
            Some(pk) => format!("Client({}, {})", pk, self.label),
            None => format!("Client(unsaved, {})", self.label),
        }
    }
}

/// A batch-script template plus shared inputs, owned by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Code {
    #[serde(default)]
    pub pk: Option<i64>,
    #[serde(default = "random_label")]
    pub label: String,
    pub client_pk: i64,
    /// Template text with `{{calc.*}}`, `{{code.*}}` and `{{client.*}}`
    /// placeholders bound at render time.
    pub script: String,
    #[serde(default)]
    pub upload_paths: UploadPaths,
}

row_identity!(Code);

impl Row for Code {
    const TABLE: &'static str = "code";
    const COLUMNS: &'static [&'static str] = &["label", "client_pk", "script", "upload_paths"];

    fn pk(&self) -> Option<i64> {
        self.pk
    }

    fn set_pk(&mut self, pk: i64) {
        self.pk = Some(pk);
    }

    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pk: Some(row.get("pk")?),
            label: row.get("label")?,
            client_pk: row.get("client_pk")?,
            script: row.get("script")?,
            upload_paths: json_column(row, "upload_paths")?,
        })
    }

    fn to_sql(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.label.clone()),
            SqlValue::Integer(self.client_pk),
            SqlValue::Text(self.script.clone()),
            json_text(&self.upload_paths),
        ]
    }

    fn validate(&self, objects: &dyn ObjectStore) -> StoreResult<()> {
        check_upload_paths(&self.upload_paths, objects)
    }

    fn display_name(&self) -> String {
        match self.pk {
            Some(pk) => format!("Code({}, {})", pk, self.label),
            None => format!("Code(unsaved, {})", self.label),
        }
    }
}

/// One concrete execution of a code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalcJob {
    #[serde(default)]
    pub pk: Option<i64>,
    #[serde(default)]
    pub label: String,
    /// Used for the per-job directory on the remote machine.
    #[serde(default = "new_uuid")]
    pub uuid: String,
    pub code_pk: i64,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Merged after the owning code's map at run time, so job-specific
    /// entries shadow code-level entries.
    #[serde(default)]
    pub upload_paths: UploadPaths,
    #[serde(default)]
    pub download_globs: Vec<String>,
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl CalcJob {
    /// Remote directory the job runs in: `<work_dir>/workflows/<uuid>`.
    pub fn remote_dir(&self, client: &Client) -> String {
        client.join_work_path(&["workflows", &self.uuid])
    }
}

row_identity!(CalcJob);

impl Row for CalcJob {
    const TABLE: &'static str = "calcjob";
    const COLUMNS: &'static [&'static str] = &[
        "label",
        "uuid",
        "code_pk",
        "parameters",
        "upload_paths",
        "download_globs",
    ];

    fn pk(&self) -> Option<i64> {
        self.pk
    }

    fn set_pk(&mut self, pk: i64) {
        self.pk = Some(pk);
    }

    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pk: Some(row.get("pk")?),
            label: row.get("label")?,
            uuid: row.get("uuid")?,
            code_pk: row.get("code_pk")?,
            parameters: json_column(row, "parameters")?,
            upload_paths: json_column(row, "upload_paths")?,
            download_globs: json_column(row, "download_globs")?,
        })
    }

    fn to_sql(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.label.clone()),
            SqlValue::Text(self.uuid.clone()),
            SqlValue::Integer(self.code_pk),
            json_text(&self.parameters),
            json_text(&self.upload_paths),
            json_text(&self.download_globs),
        ]
    }

    fn validate(&self, objects: &dyn ObjectStore) -> StoreResult<()> {
        check_upload_paths(&self.upload_paths, objects)
    }

    /// Every calcjob owns exactly one process, created alongside it.
    fn on_saved(&self, conn: &Connection, pk: i64) -> rusqlite::Result<()> {
        conn.execute("INSERT INTO process(calcjob_pk) VALUES (?1)", [pk])?;
        Ok(())
    }

    fn display_name(&self) -> String {
        match self.pk {
            Some(pk) => format!("CalcJob({}, {})", pk, self.uuid),
            None => format!("CalcJob(unsaved, {})", self.uuid),
        }
    }
}

/// Execution state for exactly one calcjob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub pk: Option<i64>,
    pub calcjob_pk: i64,
    #[serde(default)]
    pub step: Step,
    #[serde(default)]
    pub state: State,
    /// Scheduler-assigned id, set once the job is submitted.
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub exception: Option<String>,
    /// Outputs recorded on retrieval: relative path -> object key, `None`
    /// for directories.
    #[serde(default)]
    pub retrieved_paths: UploadPaths,
}

impl Process {
    pub fn new(calcjob_pk: i64) -> Self {
        Self {
            pk: None,
            calcjob_pk,
            step: Step::Created,
            state: State::Playing,
            job_id: None,
            exception: None,
            retrieved_paths: UploadPaths::new(),
        }
    }
}

row_identity!(Process);

impl Row for Process {
    const TABLE: &'static str = "process";
    const COLUMNS: &'static [&'static str] = &[
        "calcjob_pk",
        "step",
        "state",
        "job_id",
        "exception",
        "retrieved_paths",
    ];

    fn pk(&self) -> Option<i64> {
        self.pk
    }

    fn set_pk(&mut self, pk: i64) {
        self.pk = Some(pk);
    }

    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pk: Some(row.get("pk")?),
            calcjob_pk: row.get("calcjob_pk")?,
            step: enum_column(row, "step")?,
            state: enum_column(row, "state")?,
            job_id: row.get("job_id")?,
            exception: row.get("exception")?,
            retrieved_paths: json_column(row, "retrieved_paths")?,
        })
    }

    fn to_sql(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Integer(self.calcjob_pk),
            SqlValue::Text(self.step.as_str().to_string()),
            SqlValue::Text(self.state.as_str().to_string()),
            match &self.job_id {
                Some(id) => SqlValue::Text(id.clone()),
                None => SqlValue::Null,
            },
            match &self.exception {
                Some(exc) => SqlValue::Text(exc.clone()),
                None => SqlValue::Null,
            },
            json_text(&self.retrieved_paths),
        ]
    }

    fn display_name(&self) -> String {
        match self.pk {
            Some(pk) => format!("Process({}, calc={})", pk, self.calcjob_pk),
            None => format!("Process(unsaved, calc={})", self.calcjob_pk),
        }
    }
}

/// An output record created by a calcjob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNode {
    #[serde(default)]
    pub pk: Option<i64>,
    pub creator_pk: i64,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

row_identity!(DataNode);

impl Row for DataNode {
    const TABLE: &'static str = "datanode";
    const COLUMNS: &'static [&'static str] = &["creator_pk", "attributes"];

    fn pk(&self) -> Option<i64> {
        self.pk
    }

    fn set_pk(&mut self, pk: i64) {
        self.pk = Some(pk);
    }

    fn from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pk: Some(row.get("pk")?),
            creator_pk: row.get("creator_pk")?,
            attributes: json_column(row, "attributes")?,
        })
    }

    fn to_sql(&self) -> Vec<SqlValue> {
        vec![SqlValue::Integer(self.creator_pk), json_text(&self.attributes)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;

    fn client() -> Client {
        Client {
            pk: None,
            label: "cluster".into(),
            client_url: "http://localhost:8000".into(),
            client_id: "sample".into(),
            client_secret: "secret".into(),
            token_uri: "http://localhost:8080/token".into(),
            machine_name: "daint".into(),
            work_dir: "/scratch/user".into(),
            fsystem: FileSystem::Posix,
            small_file_size_mb: 5,
        }
    }

    #[test]
    fn remote_dir_joins_with_posix_separator() {
        let client = client();
        let job = CalcJob {
            pk: None,
            label: String::new(),
            uuid: "abc".into(),
            code_pk: 1,
            parameters: Default::default(),
            upload_paths: Default::default(),
            download_globs: vec![],
        };
        assert_eq!(job.remote_dir(&client), "/scratch/user/workflows/abc");
    }

    #[test]
    fn remote_dir_joins_with_windows_separator() {
        let mut client = client();
        client.fsystem = FileSystem::Windows;
        client.work_dir = r"C:\scratch".into();
        let job = CalcJob {
            pk: None,
            label: String::new(),
            uuid: "abc".into(),
            code_pk: 1,
            parameters: Default::default(),
            upload_paths: Default::default(),
            download_globs: vec![],
        };
        assert_eq!(job.remote_dir(&client), r"C:\scratch\workflows\abc");
    }

    #[test]
    fn equality_is_by_pk() {
        let mut a = client();
        let mut b = client();
        b.label = "other".into();
        a.pk = Some(1);
        b.pk = Some(1);
        assert_eq!(a, b);
        b.pk = Some(2);
        assert_ne!(a, b);
    }

    #[test]
    fn absolute_upload_paths_are_rejected() {
        let objects = InMemoryObjectStore::new();
        let key = objects.add_from_bytes(b"data").unwrap();
        let code = Code {
            pk: None,
            label: "c".into(),
            client_pk: 1,
            script: String::new(),
            upload_paths: [("/etc/passwd".to_string(), Some(key))].into(),
        };
        assert!(matches!(
            code.validate(&objects),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn missing_upload_key_is_rejected() {
        let objects = InMemoryObjectStore::new();
        let code = Code {
            pk: None,
            label: "c".into(),
            client_pk: 1,
            script: String::new(),
            upload_paths: [("in.txt".to_string(), Some("deadbeef".to_string()))].into(),
        };
        assert!(matches!(
            code.validate(&objects),
            Err(StoreError::ObjectNotFound(_))
        ));
    }
}
