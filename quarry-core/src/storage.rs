//! Parquet dataset store: partition files awaiting merge plus the single final dataset.
//!
//! Layout:
//! - `{root}/partitions/{phase}-{seq:05}.parquet`: one file per scheduler flush
//! - `{root}/final/latest.parquet`: the canonical merged dataset
//! - `{root}/final/meta.json`: metadata sidecar (row count, hash, write time)
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so a
//! crash never leaves a half-written file under a final name. Partition files
//! that fail to load are quarantined (`.quarantined`) and reported back to the
//! caller, which must not commit a merge that is missing them; the final
//! dataset is never quarantined.

use crate::error::PersistenceError;
use crate::record::{FieldKind, FieldValue, Record, RecordSchema, Table, RESERVED_COLUMNS};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PARTITIONS_DIR: &str = "partitions";
const FINAL_DIR: &str = "final";
const FINAL_FILE: &str = "latest.parquet";
const META_FILE: &str = "meta.json";

/// Metadata sidecar written next to the final dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub rows: usize,
    pub entities: usize,
    pub data_hash: String,
    pub written_at: DateTime<Utc>,
}

/// Result of [`DatasetStore::load_partitions`].
#[derive(Debug, Clone, Default)]
pub struct LoadedPartitions {
    /// Readable partitions in merge order.
    pub tables: Vec<(PathBuf, Table)>,
    /// Original paths of files that could not be read and were renamed to
    /// `.quarantined`. Their rows are not in `tables`.
    pub quarantined: Vec<PathBuf>,
}

/// Partition and final-dataset storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partitions_dir(&self) -> PathBuf {
        self.root.join(PARTITIONS_DIR)
    }

    fn final_path(&self) -> PathBuf {
        self.root.join(FINAL_DIR).join(FINAL_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join(FINAL_DIR).join(META_FILE)
    }

    /// Write one flushed batch as a new partition file for `phase`.
    pub fn write_partition(&self, phase: &str, table: &Table) -> Result<PathBuf, PersistenceError> {
        let dir = self.partitions_dir();
        fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, e))?;

        let seq = self.next_sequence(phase)?;
        let path = dir.join(format!("{phase}-{seq:05}.parquet"));
        let mut df = table_to_dataframe(table, &path)?;
        write_parquet_atomic(&mut df, &path)?;

        debug!(path = %path.display(), rows = table.len(), "wrote partition");
        Ok(path)
    }

    /// Next free sequence number for a phase's partition files. Quarantined
    /// files count, so a sequence number is never reused.
    fn next_sequence(&self, phase: &str) -> Result<u32, PersistenceError> {
        let dir = self.partitions_dir();
        let prefix = format!("{phase}-");
        let mut max = 0;
        for entry in fs::read_dir(&dir).map_err(|e| PersistenceError::io(&dir, e))? {
            let name = entry.map_err(|e| PersistenceError::io(&dir, e))?.file_name();
            let seq = name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|rest| rest.split('.').next())
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(seq) = seq {
                max = max.max(seq);
            }
        }
        Ok(max + 1)
    }

    /// All partition files currently on disk, in write order per phase.
    pub fn list_partitions(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        let dir = self.partitions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&dir, e)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| PersistenceError::io(&dir, e))?.path();
            // Skips .tmp leftovers and quarantined files
            if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
                paths.push(path);
            }
        }
        paths.sort_by_cached_key(|p| partition_order(p));
        Ok(paths)
    }

    /// Read a single partition file.
    pub fn read_partition(&self, path: &Path, schema: &RecordSchema) -> Result<Table, PersistenceError> {
        read_parquet_table(path, schema)
    }

    /// Load every readable partition. Unreadable files are quarantined and
    /// listed in [`LoadedPartitions::quarantined`].
    pub fn load_partitions(&self, schema: &RecordSchema) -> Result<LoadedPartitions, PersistenceError> {
        let mut loaded = LoadedPartitions::default();
        for path in self.list_partitions()? {
            match read_parquet_table(&path, schema) {
                Ok(table) => loaded.tables.push((path, table)),
                Err(e @ PersistenceError::Io { .. }) => return Err(e),
                Err(e) => {
                    let quarantine = path.with_extension("parquet.quarantined");
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "quarantining unreadable partition file"
                    );
                    fs::rename(&path, &quarantine).map_err(|e| PersistenceError::io(&path, e))?;
                    loaded.quarantined.push(path);
                }
            }
        }
        Ok(loaded)
    }

    /// Delete consumed partition files. Already-missing files are not an error.
    pub fn remove_partitions(&self, paths: &[PathBuf]) -> Result<(), PersistenceError> {
        for path in paths {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(PersistenceError::io(path, e)),
            }
        }
        Ok(())
    }

    /// Read the final dataset, or `None` if no merge has been committed yet.
    pub fn read_final(&self, schema: &RecordSchema) -> Result<Option<Table>, PersistenceError> {
        let path = self.final_path();
        if !path.exists() {
            return Ok(None);
        }
        read_parquet_table(&path, schema).map(Some)
    }

    /// Overwrite the final dataset and its metadata sidecar.
    pub fn write_final(&self, table: &Table) -> Result<DatasetMeta, PersistenceError> {
        let path = self.final_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
        }

        let mut df = table_to_dataframe(table, &path)?;
        write_parquet_atomic(&mut df, &path)?;

        let meta = DatasetMeta {
            rows: table.len(),
            entities: table.entity_ids().len(),
            data_hash: table_hash(table)?,
            written_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| PersistenceError::Serialization(format!("dataset meta: {e}")))?;
        write_atomic(&self.meta_path(), &json)?;

        debug!(path = %path.display(), rows = meta.rows, "wrote final dataset");
        Ok(meta)
    }

    /// Metadata of the committed final dataset, if any.
    pub fn final_meta(&self) -> Option<DatasetMeta> {
        let content = fs::read_to_string(self.meta_path()).ok()?;
        serde_json::from_str(&content).ok()
    }
}

/// Sort key for partition file names: phase, then numeric sequence.
/// Stems without a numeric suffix sort by the whole stem.
fn partition_order(path: &Path) -> (String, u64, String) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    match stem.rsplit_once('-').map(|(phase, seq)| (phase, seq.parse::<u64>())) {
        Some((phase, Ok(seq))) => (phase.to_string(), seq, stem.clone()),
        _ => (stem.clone(), u64::MAX, stem),
    }
}

/// BLAKE3 hash over the serialized records.
pub fn table_hash(table: &Table) -> Result<String, PersistenceError> {
    let bytes = serde_json::to_vec(&table.records)
        .map_err(|e| PersistenceError::Serialization(format!("hash serialization: {e}")))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

// ── Atomic write helpers ────────────────────────────────────────────

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write bytes to `path` via a synced temporary sibling and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
    }
    rename_into_place(&tmp, path)
}

fn rename_into_place(tmp: &Path, path: &Path) -> Result<(), PersistenceError> {
    fs::rename(tmp, path).map_err(|e| {
        let _ = fs::remove_file(tmp);
        PersistenceError::io(path, e)
    })?;
    // Persist the rename itself; not supported on every platform
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn write_parquet_atomic(df: &mut DataFrame, path: &Path) -> Result<(), PersistenceError> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
        ParquetWriter::new(&mut file)
            .finish(df)
            .map_err(|e| PersistenceError::parquet(&tmp, e))?;
        file.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
    }
    rename_into_place(&tmp, path)
}

// ── Parquet conversion ──────────────────────────────────────────────

fn dtype_for(kind: FieldKind) -> DataType {
    match kind {
        FieldKind::Float => DataType::Float64,
        FieldKind::Int => DataType::Int64,
        FieldKind::Text | FieldKind::Date => DataType::String,
    }
}

/// Convert a table to a DataFrame: envelope columns first, then schema fields in order.
fn table_to_dataframe(table: &Table, path: &Path) -> Result<DataFrame, PersistenceError> {
    let records = &table.records;
    let entity_ids: Vec<&str> = records.iter().map(|r| r.entity_id.as_str()).collect();
    let period_keys: Vec<&str> = records.iter().map(|r| r.period_key.as_str()).collect();
    let revisions: Vec<i64> = records.iter().map(|r| r.revision.timestamp_millis()).collect();

    let mut columns = vec![
        Column::new("entity_id".into(), entity_ids),
        Column::new("period_key".into(), period_keys),
        Column::new("revision".into(), revisions)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| PersistenceError::parquet(path, format!("revision cast: {e}")))?,
    ];

    for spec in &table.schema.fields {
        let name = spec.name.as_str();
        let column = match spec.kind {
            FieldKind::Float => {
                let values: Vec<Option<f64>> = records.iter().map(|r| r.number(name)).collect();
                Column::new(name.into(), values)
            }
            FieldKind::Int => {
                let values: Vec<Option<i64>> = records
                    .iter()
                    .map(|r| r.get(name).and_then(FieldValue::as_i64))
                    .collect();
                Column::new(name.into(), values)
            }
            FieldKind::Text | FieldKind::Date => {
                let values: Vec<Option<&str>> = records.iter().map(|r| r.text(name)).collect();
                Column::new(name.into(), values)
            }
        };
        columns.push(column);
    }

    DataFrame::new(columns)
        .map_err(|e| PersistenceError::parquet(path, format!("dataframe creation: {e}")))
}

/// Typed read access to one field column.
enum FieldReader<'a> {
    Float(&'a Float64Chunked),
    Int(&'a Int64Chunked),
    Text(&'a StringChunked),
}

impl FieldReader<'_> {
    fn value(&self, row: usize) -> Option<FieldValue> {
        match self {
            FieldReader::Float(ca) => ca.get(row).map(FieldValue::Float),
            FieldReader::Int(ca) => ca.get(row).map(FieldValue::Int),
            FieldReader::Text(ca) => ca.get(row).map(|s| FieldValue::Text(s.to_string())),
        }
    }
}

fn read_parquet_table(path: &Path, schema: &RecordSchema) -> Result<Table, PersistenceError> {
    let file = File::open(path).map_err(|e| PersistenceError::io(path, e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| PersistenceError::parquet(path, e))?;
    dataframe_to_table(&df, schema, path)
}

fn dataframe_to_table(
    df: &DataFrame,
    schema: &RecordSchema,
    path: &Path,
) -> Result<Table, PersistenceError> {
    for name in RESERVED_COLUMNS.iter().copied().chain(schema.field_names()) {
        if df.column(name).is_err() {
            return Err(PersistenceError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("missing column '{name}'"),
            });
        }
    }
    let map_err = |e: PolarsError| PersistenceError::parquet(path, format!("column read: {e}"));

    let entity_ca = df
        .column("entity_id")
        .map_err(map_err)?
        .as_materialized_series()
        .str()
        .map_err(map_err)?;
    let period_ca = df
        .column("period_key")
        .map_err(map_err)?
        .as_materialized_series()
        .str()
        .map_err(map_err)?;
    let revision_col = df
        .column("revision")
        .map_err(map_err)?
        .cast(&DataType::Int64)
        .map_err(map_err)?;
    let revision_ca = revision_col.as_materialized_series().i64().map_err(map_err)?;

    let field_columns = schema
        .fields
        .iter()
        .map(|spec| {
            df.column(&spec.name)
                .and_then(|c| c.cast(&dtype_for(spec.kind)))
                .map_err(map_err)
        })
        .collect::<Result<Vec<Column>, _>>()?;
    let readers = schema
        .fields
        .iter()
        .zip(&field_columns)
        .map(|(spec, column)| {
            let series = column.as_materialized_series();
            Ok(match spec.kind {
                FieldKind::Float => FieldReader::Float(series.f64()?),
                FieldKind::Int => FieldReader::Int(series.i64()?),
                FieldKind::Text | FieldKind::Date => FieldReader::Text(series.str()?),
            })
        })
        .collect::<PolarsResult<Vec<FieldReader>>>()
        .map_err(map_err)?;

    let corrupt = |row: usize, what: &str| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("null or invalid {what} at row {row}"),
    };

    let n = df.height();
    let mut records = Vec::with_capacity(n);
    for row in 0..n {
        let entity_id = entity_ca.get(row).ok_or_else(|| corrupt(row, "entity_id"))?;
        let period_key = period_ca.get(row).ok_or_else(|| corrupt(row, "period_key"))?;
        let revision = revision_ca
            .get(row)
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| corrupt(row, "revision"))?;

        let mut record = Record::new(entity_id, period_key, revision);
        for (spec, reader) in schema.fields.iter().zip(&readers) {
            if let Some(value) = reader.value(row) {
                record.values.insert(spec.name.clone(), value);
            }
        }
        records.push(record);
    }

    Ok(Table::with_records(schema.clone(), records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldSpec;
    use chrono::TimeZone;

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldSpec::new("close", FieldKind::Float),
            FieldSpec::new("volume", FieldKind::Int),
            FieldSpec::new("ann_date", FieldKind::Date),
        ])
        .unwrap()
    }

    fn sample_table() -> Table {
        let rev = Utc.with_ymd_and_hms(2024, 1, 2, 18, 0, 0).unwrap();
        Table::with_records(
            schema(),
            vec![
                Record::new("000001.SZ", "20240102", rev)
                    .with("close", FieldValue::Float(10.5))
                    .with("volume", FieldValue::Int(1200))
                    .with("ann_date", FieldValue::Text("20240102".into())),
                // all fields null
                Record::new("000002.SZ", "20240102", rev),
            ],
        )
    }

    #[test]
    fn partition_roundtrip_preserves_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());

        let path = store.write_partition("main", &sample_table()).unwrap();
        let loaded = store.read_partition(&path, &schema()).unwrap();

        assert_eq!(loaded, sample_table());
        assert!(loaded.records[1].values.is_empty());
    }

    #[test]
    fn partition_sequence_increments_per_phase() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());

        let a = store.write_partition("p2010", &sample_table()).unwrap();
        let b = store.write_partition("p2010", &sample_table()).unwrap();
        let c = store.write_partition("p2015", &sample_table()).unwrap();

        assert!(a.ends_with("p2010-00001.parquet"));
        assert!(b.ends_with("p2010-00002.parquet"));
        assert!(c.ends_with("p2015-00001.parquet"));
        assert_eq!(store.list_partitions().unwrap(), vec![a, b, c]);
    }

    #[test]
    fn partitions_order_by_numeric_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let parts = dir.path().join("partitions");
        fs::create_dir_all(&parts).unwrap();
        for name in ["main-100000", "main-99999", "main-00002", "a-b-00010", "a-b-00009"] {
            fs::write(parts.join(format!("{name}.parquet")), b"").unwrap();
        }

        let names: Vec<String> = store
            .list_partitions()
            .unwrap()
            .iter()
            .map(|p| p.file_stem().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["a-b-00009", "a-b-00010", "main-00002", "main-99999", "main-100000"]
        );
        assert!(store
            .write_partition("main", &sample_table())
            .unwrap()
            .ends_with("main-100001.parquet"));
    }

    #[test]
    fn final_dataset_is_absent_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());

        assert!(store.read_final(&schema()).unwrap().is_none());
        assert!(store.final_meta().is_none());

        let meta = store.write_final(&sample_table()).unwrap();
        assert_eq!(meta.rows, 2);
        assert_eq!(meta.entities, 2);
        assert_eq!(store.final_meta().unwrap(), meta);
        assert_eq!(store.read_final(&schema()).unwrap().unwrap(), sample_table());
    }

    #[test]
    fn empty_final_dataset_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());

        store.write_final(&Table::new(schema())).unwrap();
        let loaded = store.read_final(&schema()).unwrap().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn corrupt_partition_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());

        let good = store.write_partition("main", &sample_table()).unwrap();
        let bad = dir.path().join("partitions").join("main-00099.parquet");
        fs::write(&bad, b"not a parquet file").unwrap();

        let loaded = store.load_partitions(&schema()).unwrap();
        assert_eq!(loaded.tables.len(), 1);
        assert_eq!(loaded.tables[0].0, good);
        assert_eq!(loaded.quarantined, vec![bad.clone()]);
        assert!(!bad.exists());
        assert!(bad.with_extension("parquet.quarantined").exists());

        let next = store.write_partition("main", &sample_table()).unwrap();
        assert!(next.ends_with("main-00100.parquet"));
    }

    #[test]
    fn missing_column_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let path = store.write_partition("main", &sample_table()).unwrap();

        let wider = RecordSchema::new(vec![
            FieldSpec::new("close", FieldKind::Float),
            FieldSpec::new("open", FieldKind::Float),
        ])
        .unwrap();
        let err = store.read_partition(&path, &wider).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
    }

    #[test]
    fn remove_partitions_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DatasetStore::new(dir.path());
        let path = store.write_partition("main", &sample_table()).unwrap();

        store.remove_partitions(&[path.clone(), path.clone()]).unwrap();
        assert!(store.list_partitions().unwrap().is_empty());
    }

    #[test]
    fn atomic_write_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        write_atomic(&target, b"{}").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"{}");
        assert!(!tmp_path(&target).exists());
    }
}
