//! Bulk ingestion of clients, codes and calcjobs from a config mapping.
//!
//! Object literals are pushed into the object store first so their keys are
//! available when `upload_paths` entries are rewritten. All row inserts run
//! in one transaction: any bad record rolls back the whole batch.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::db::insert_row;
use crate::entity::{
    random_label, CalcJob, Client, Code, FileSystem, Row, UploadPaths,
};
use crate::{Storage, StoreError, StoreResult};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectSpec>,
    #[serde(default)]
    pub clients: Vec<ClientSpec>,
    #[serde(default)]
    pub codes: Vec<CodeSpec>,
    #[serde(default)]
    pub calcjobs: Vec<CalcJobSpec>,
}

/// An object literal: inline text content or a local file path.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectSpec {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    /// Accepted for compatibility; keys carry no extension.
    #[serde(default)]
    pub extension: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSpec {
    #[serde(default)]
    pub label: Option<String>,
    pub client_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub token_uri: String,
    pub machine_name: String,
    pub work_dir: String,
    #[serde(default)]
    pub fsystem: FileSystem,
    #[serde(default)]
    pub small_file_size_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeSpec {
    #[serde(default)]
    pub label: Option<String>,
    pub client_label: String,
    pub script: String,
    #[serde(default)]
    pub upload_paths: BTreeMap<String, Option<UploadValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalcJobSpec {
    #[serde(default)]
    pub label: Option<String>,
    pub code_label: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub upload_paths: BTreeMap<String, Option<UploadValue>>,
    #[serde(default)]
    pub download_globs: Vec<String>,
}

/// An `upload_paths` value: a reference to an ingested object by label, or a
/// raw object-store key. (`null` at the mapping level means "directory".)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UploadValue {
    Label { label: String },
    Key { key: String },
}

/// Primary keys added by one ingestion batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddedPks {
    pub clients: Vec<i64>,
    pub codes: Vec<i64>,
    pub calcjobs: Vec<i64>,
}

impl Storage {
    /// Ingest a YAML document of the [`IngestConfig`] shape.
    pub fn ingest_yaml(&self, text: &str) -> StoreResult<AddedPks> {
        let config: IngestConfig = serde_yaml::from_str(text)
            .map_err(|err| StoreError::Validation(format!("invalid ingest YAML: {err}")))?;
        self.ingest(config)
    }

    /// Load a batch of records, atomically.
    pub fn ingest(&self, config: IngestConfig) -> StoreResult<AddedPks> {
        // Objects are content-addressed, so hydrating them outside the row
        // transaction cannot leave dangling state behind on rollback.
        let mut label_to_key: BTreeMap<String, String> = BTreeMap::new();
        for (label, spec) in &config.objects {
            label_to_key.insert(label.clone(), self.add_object(label, spec)?);
        }

        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let mut added = AddedPks::default();

        let outcome: StoreResult<()> = (|| {
            for (idx, spec) in config.clients.iter().enumerate() {
                let mut row = Client {
                    pk: None,
                    label: spec.label.clone().unwrap_or_else(random_label),
                    client_url: spec.client_url.clone(),
                    client_id: spec.client_id.clone(),
                    client_secret: spec.client_secret.clone(),
                    token_uri: spec.token_uri.clone(),
                    machine_name: spec.machine_name.clone(),
                    work_dir: spec.work_dir.clone(),
                    fsystem: spec.fsystem,
                    small_file_size_mb: spec.small_file_size_mb.unwrap_or(5),
                };
                let pk = insert_row(&tx, &mut row).map_err(|err| {
                    StoreError::Validation(format!("clients[{idx}] item is invalid: {err}"))
                })?;
                added.clients.push(pk);
            }

            for (idx, spec) in config.codes.iter().enumerate() {
                let client_pk = lookup_pk(&tx, "client", &spec.client_label).map_err(|_| {
                    StoreError::Validation(format!(
                        "codes[{idx}]['client_label'] = {:?} not found",
                        spec.client_label
                    ))
                })?;
                let upload_paths = self.resolve_upload_paths(
                    &spec.upload_paths,
                    &label_to_key,
                    &format!("codes[{idx}][upload_paths]"),
                )?;
                let mut row = Code {
                    pk: None,
                    label: spec.label.clone().unwrap_or_else(random_label),
                    client_pk,
                    script: spec.script.clone(),
                    upload_paths,
                };
                row.validate(self.objects().as_ref())?;
                let pk = insert_row(&tx, &mut row).map_err(|err| {
                    StoreError::Validation(format!("codes[{idx}] item is invalid: {err}"))
                })?;
                added.codes.push(pk);
            }

            for (idx, spec) in config.calcjobs.iter().enumerate() {
                let code_pk = lookup_pk(&tx, "code", &spec.code_label).map_err(|_| {
                    StoreError::Validation(format!(
                        "calcjobs[{idx}]['code_label'] = {:?} not found",
                        spec.code_label
                    ))
                })?;
                let upload_paths = self.resolve_upload_paths(
                    &spec.upload_paths,
                    &label_to_key,
                    &format!("calcjobs[{idx}][upload_paths]"),
                )?;
                let mut row = CalcJob {
                    pk: None,
                    label: spec.label.clone().unwrap_or_default(),
                    uuid: spec
                        .uuid
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    code_pk,
                    parameters: spec.parameters.clone(),
                    upload_paths,
                    download_globs: spec.download_globs.clone(),
                };
                row.validate(self.objects().as_ref())?;
                let pk = insert_row(&tx, &mut row).map_err(|err| {
                    StoreError::Validation(format!("calcjobs[{idx}] item is invalid: {err}"))
                })?;
                added.calcjobs.push(pk);
            }

            Ok(())
        })();

        match outcome {
            Ok(()) => {
                tx.commit()?;
                tracing::info!(
                    clients = added.clients.len(),
                    codes = added.codes.len(),
                    calcjobs = added.calcjobs.len(),
                    "ingested batch"
                );
                Ok(added)
            }
            // tx rolls back on drop
            Err(err) => Err(err),
        }
    }

    fn add_object(&self, label: &str, spec: &ObjectSpec) -> StoreResult<String> {
        match (&spec.content, &spec.path) {
            (Some(content), None) => {
                let encoding = spec.encoding.as_deref().unwrap_or("utf8");
                if !matches!(encoding, "utf8" | "utf-8") {
                    return Err(StoreError::Validation(format!(
                        "unsupported encoding {encoding:?} for object {label:?}"
                    )));
                }
                self.objects().add_from_bytes(content.as_bytes())
            }
            (None, Some(path)) => self.objects().add_from_path(std::path::Path::new(path)),
            _ => Err(StoreError::Validation(format!(
                "expected either 'content' or 'path' for object {label:?}"
            ))),
        }
    }

    fn resolve_upload_paths(
        &self,
        raw: &BTreeMap<String, Option<UploadValue>>,
        label_to_key: &BTreeMap<String, String>,
        context: &str,
    ) -> StoreResult<UploadPaths> {
        let mut resolved = UploadPaths::new();
        for (path, value) in raw {
            let key = match value {
                None => None,
                Some(UploadValue::Label { label }) => {
                    Some(label_to_key.get(label).cloned().ok_or_else(|| {
                        StoreError::Validation(format!(
                            "{context}[{path}]['label'] = {label:?} not found"
                        ))
                    })?)
                }
                Some(UploadValue::Key { key }) => {
                    if !self.objects().contains(key) {
                        return Err(StoreError::Validation(format!(
                            "{context}[{path}]: key {key:?} not found in object store"
                        )));
                    }
                    Some(key.clone())
                }
            };
            resolved.insert(path.clone(), key);
        }
        Ok(resolved)
    }
}

fn lookup_pk(conn: &rusqlite::Connection, table: &str, label: &str) -> rusqlite::Result<i64> {
    let sql = format!("SELECT pk FROM {table} WHERE label = ?1");
    conn.query_row(&sql, [label], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Process;
    use crate::Filter;

    const YAML: &str = r#"
objects:
  greeting:
    content: "hello world"
  nested:
    content: "data"
    encoding: utf8
    extension: txt
clients:
  - label: cluster
    client_url: http://localhost:8000
    client_id: sample
    client_secret: secret
    token_uri: http://localhost:8080/token
    machine_name: daint
    work_dir: /scratch/user
    small_file_size_mb: 5
codes:
  - label: echo
    client_label: cluster
    script: "echo hi > out.txt"
    upload_paths:
      input.txt: { label: greeting }
      data/: null
calcjobs:
  - label: run1
    code_label: echo
    parameters: { n: 3 }
    upload_paths:
      extra.txt: { label: nested }
    download_globs: ["**"]
"#;

    #[test]
    fn yaml_batch_round_trip() {
        let storage = Storage::in_memory().unwrap();
        let added = storage.ingest_yaml(YAML).unwrap();
        assert_eq!(added.clients.len(), 1);
        assert_eq!(added.codes.len(), 1);
        assert_eq!(added.calcjobs.len(), 1);

        let code: Code = storage.get_row(added.codes[0]).unwrap();
        let key = code.upload_paths["input.txt"].as_ref().unwrap();
        assert!(storage.objects().contains(key));
        assert_eq!(code.upload_paths["data/"], None);

        // the calcjob got its process row
        assert_eq!(storage.count_rows::<Process>(&[]).unwrap(), 1);
    }

    #[test]
    fn dangling_client_label_rolls_back_the_batch() {
        let storage = Storage::in_memory().unwrap();
        let yaml = r#"
clients:
  - label: cluster
    client_url: http://localhost:8000
    client_id: sample
    client_secret: secret
    token_uri: http://localhost:8080/token
    machine_name: daint
    work_dir: /scratch/user
codes:
  - client_label: unknown
    script: "echo"
"#;
        let err = storage.ingest_yaml(yaml).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)), "{err}");
        // the valid client earlier in the batch is gone too
        assert_eq!(storage.count_rows::<Client>(&[]).unwrap(), 0);
    }

    #[test]
    fn unknown_object_key_is_rejected() {
        let storage = Storage::in_memory().unwrap();
        let yaml = r#"
clients:
  - label: cluster
    client_url: http://localhost:8000
    client_id: sample
    client_secret: secret
    token_uri: http://localhost:8080/token
    machine_name: daint
    work_dir: /scratch/user
codes:
  - client_label: cluster
    script: "echo"
    upload_paths:
      in.bin: { key: "deadbeef" }
"#;
        let err = storage.ingest_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("deadbeef"), "{err}");
    }

    #[test]
    fn object_requires_content_or_path() {
        let storage = Storage::in_memory().unwrap();
        let err = storage
            .ingest_yaml("objects:\n  broken: { encoding: utf8 }\n")
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn calcjob_uuid_defaults_but_can_be_pinned() {
        let storage = Storage::in_memory().unwrap();
        let yaml = r#"
clients:
  - label: cluster
    client_url: http://localhost:8000
    client_id: sample
    client_secret: secret
    token_uri: http://localhost:8080/token
    machine_name: daint
    work_dir: /scratch/user
codes:
  - label: echo
    client_label: cluster
    script: "echo"
calcjobs:
  - code_label: echo
    uuid: "123e4567-e89b-12d3-a456-426614174000"
  - code_label: echo
"#;
        let added = storage.ingest_yaml(yaml).unwrap();
        let pinned: CalcJob = storage.get_row(added.calcjobs[0]).unwrap();
        assert_eq!(pinned.uuid, "123e4567-e89b-12d3-a456-426614174000");
        let generated: CalcJob = storage.get_row(added.calcjobs[1]).unwrap();
        assert_eq!(generated.uuid.len(), 36);
        let _ = storage.iter_rows::<Process>(1, None, &[Filter::eq("state", "playing")]);
    }
}
