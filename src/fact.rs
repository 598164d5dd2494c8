use crate::identity::{self, FactKey};
use crate::store::{self, ColumnSpec, Row, Value, float64, utf8};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub const FACT_COLUMNS: &[ColumnSpec] = &[
    utf8("fact_uid"),
    utf8("state"),
    utf8("year_month"),
    utf8("payer_slug"),
    utf8("billing_class"),
    utf8("code_type"),
    utf8("code"),
    utf8("pg_uid"),
    utf8("pos_set_id"),
    utf8("negotiated_type"),
    utf8("negotiation_arrangement"),
    float64("negotiated_rate"),
    utf8("expiration_date"),
    utf8("provider_group_id_raw"),
    utf8("reporting_entity_name"),
];

/// One priced line in the fact store.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRecord {
    pub fact_uid: String,
    pub state: String,
    pub year_month: String,
    pub payer_slug: String,
    pub billing_class: String,
    pub code_type: String,
    pub code: String,
    pub pg_uid: String,
    pub pos_set_id: String,
    pub negotiated_type: Option<String>,
    pub negotiation_arrangement: Option<String>,
    pub negotiated_rate: Option<f64>,
    pub expiration_date: Option<String>,
    pub provider_group_id_raw: Option<String>,
    pub reporting_entity_name: Option<String>,
}

fn opt_str(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

impl FactRecord {
    /// Mint (or re-mint) the content-addressable id from the current fields.
    pub fn minted_uid(&self) -> String {
        identity::fact_uid(&FactKey {
            state: &self.state,
            year_month: &self.year_month,
            payer_slug: &self.payer_slug,
            billing_class: &self.billing_class,
            code_type: &self.code_type,
            code: &self.code,
            pg_uid: &self.pg_uid,
            pos_set_id: &self.pos_set_id,
            negotiated_type: opt_str(&self.negotiated_type),
            negotiation_arrangement: opt_str(&self.negotiation_arrangement),
            expiration_date: opt_str(&self.expiration_date),
            negotiated_rate: self.negotiated_rate,
            provider_group_id_raw: opt_str(&self.provider_group_id_raw),
        })
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey {
            state: self.state.clone(),
            year_month: self.year_month.clone(),
            payer_slug: self.payer_slug.clone(),
            billing_class: self.billing_class.clone(),
            code_type: self.code_type.clone(),
        }
    }

    /// Full composite dedup key: the fact_uid plus every component field that
    /// feeds it, so legacy rows written before fact_uid existed still
    /// deduplicate correctly.
    fn dedup_key(&self) -> Vec<String> {
        vec![
            self.fact_uid.clone(),
            self.state.clone(),
            self.year_month.clone(),
            self.payer_slug.clone(),
            self.billing_class.clone(),
            self.code_type.clone(),
            self.code.clone(),
            self.pg_uid.clone(),
            self.pos_set_id.clone(),
            opt_str(&self.negotiated_type).to_string(),
            opt_str(&self.negotiation_arrangement).to_string(),
            opt_str(&self.expiration_date).to_string(),
            identity::rate_hash_key(self.negotiated_rate),
            opt_str(&self.provider_group_id_raw).to_string(),
        ]
    }

    pub fn to_row(&self) -> Row {
        vec![
            Value::text(self.fact_uid.clone()),
            Value::text(self.state.clone()),
            Value::text(self.year_month.clone()),
            Value::text(self.payer_slug.clone()),
            Value::text(self.billing_class.clone()),
            Value::text(self.code_type.clone()),
            Value::text(self.code.clone()),
            Value::text(self.pg_uid.clone()),
            Value::text(self.pos_set_id.clone()),
            Value::opt_text(self.negotiated_type.clone()),
            Value::opt_text(self.negotiation_arrangement.clone()),
            Value::opt_float(self.negotiated_rate),
            Value::opt_text(self.expiration_date.clone()),
            Value::opt_text(self.provider_group_id_raw.clone()),
            Value::opt_text(self.reporting_entity_name.clone()),
        ]
    }

    pub fn from_row(row: &Row) -> FactRecord {
        let text = |idx: usize| -> String {
            row.get(idx)
                .and_then(|v| v.as_text().map(str::to_string))
                .unwrap_or_default()
        };
        let opt_text = |idx: usize| -> Option<String> {
            row.get(idx).and_then(|v| v.as_text().map(str::to_string))
        };
        FactRecord {
            fact_uid: text(0),
            state: text(1),
            year_month: text(2),
            payer_slug: text(3),
            billing_class: text(4),
            code_type: text(5),
            code: text(6),
            pg_uid: text(7),
            pos_set_id: text(8),
            negotiated_type: opt_text(9),
            negotiation_arrangement: opt_text(10),
            negotiated_rate: row.get(11).and_then(Value::as_float),
            expiration_date: opt_text(12),
            provider_group_id_raw: opt_text(13),
            reporting_entity_name: opt_text(14),
        }
    }
}

/// Partition grouping key; each distinct value maps to one on-disk directory
/// whose file set is wholly replaced per upsert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub state: String,
    pub year_month: String,
    pub payer_slug: String,
    pub billing_class: String,
    pub code_type: String,
}

impl PartitionKey {
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(format!("state={}", path_component(&self.state)))
            .join(format!("year_month={}", path_component(&self.year_month)))
            .join(format!("payer_slug={}", path_component(&self.payer_slug)))
            .join(format!("billing_class={}", path_component(&self.billing_class)))
            .join(format!("code_type={}", path_component(&self.code_type)))
    }
}

/// Sanitize a partition value for use as a path component.
fn path_component(raw: &str) -> String {
    if raw.is_empty() {
        return "null".to_string();
    }
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn now_unix_millis() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i128)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub partitions_seen: usize,
    pub partitions_written: usize,
    pub partitions_cleaned: usize,
    pub rows_written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Fresh file written; carries the deduplicated row count.
    Written(usize),
    /// Result was empty; any stale files were removed.
    Cleaned,
}

/// Merge `new_rows` into one partition directory: read whatever is there,
/// concatenate, deduplicate on the full composite key keeping the most
/// recently written duplicate, then replace the partition's file set with a
/// single fresh file (or remove it entirely when nothing remains).
pub fn upsert_partition(dir: &Path, new_rows: Vec<FactRecord>) -> Result<PartitionOutcome> {
    fs::create_dir_all(dir).with_context(|| format!("Failed creating {}", dir.display()))?;

    let existing_files = store::list_parquet_files(dir)?;
    let mut combined: Vec<FactRecord> = Vec::new();
    for file in &existing_files {
        let rows = store::read_table(file, FACT_COLUMNS)?;
        combined.extend(rows.iter().map(FactRecord::from_row));
    }
    combined.extend(new_rows);

    let mut order: Vec<Vec<String>> = Vec::new();
    let mut latest: HashMap<Vec<String>, FactRecord> = HashMap::new();
    for record in combined {
        let key = record.dedup_key();
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, record);
    }
    let deduped: Vec<FactRecord> = order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect();

    if deduped.is_empty() {
        for file in &existing_files {
            fs::remove_file(file)
                .with_context(|| format!("Failed deleting stale {}", file.display()))?;
        }
        debug!(partition = %dir.display(), "partition empty after dedup; removed stale files");
        return Ok(PartitionOutcome::Cleaned);
    }

    let rows: Vec<Row> = deduped.iter().map(FactRecord::to_row).collect();
    let target = dir.join(format!("part-{}.parquet", now_unix_millis()));
    store::write_table(&target, FACT_COLUMNS, &rows)?;

    for file in &existing_files {
        if file == &target {
            continue;
        }
        fs::remove_file(file)
            .with_context(|| format!("Failed deleting replaced {}", file.display()))?;
    }
    Ok(PartitionOutcome::Written(deduped.len()))
}

/// Upsert a batch of fact rows into the partitioned store under `root`.
/// Re-running the same batch is a no-op with respect to logical row counts.
pub fn upsert_facts(root: &Path, records: &[FactRecord]) -> Result<UpsertSummary> {
    let mut grouped: HashMap<PartitionKey, Vec<FactRecord>> = HashMap::new();
    for record in records {
        grouped
            .entry(record.partition_key())
            .or_default()
            .push(record.clone());
    }

    let mut keys: Vec<PartitionKey> = grouped.keys().cloned().collect();
    keys.sort();

    let mut summary = UpsertSummary {
        partitions_seen: keys.len(),
        ..UpsertSummary::default()
    };
    for key in keys {
        let rows = grouped.remove(&key).unwrap_or_default();
        let dir = key.dir(root);
        match upsert_partition(&dir, rows)? {
            PartitionOutcome::Written(count) => {
                summary.partitions_written += 1;
                summary.rows_written += count;
            }
            PartitionOutcome::Cleaned => summary.partitions_cleaned += 1,
        }
    }
    info!(
        partitions = summary.partitions_seen,
        written = summary.partitions_written,
        cleaned = summary.partitions_cleaned,
        rows = summary.rows_written,
        "fact upsert complete"
    );
    Ok(summary)
}

/// Read every fact row under a partition root (recursive walk).
pub fn read_all_facts(root: &Path) -> Result<Vec<FactRecord>> {
    let mut records: Vec<FactRecord> = Vec::new();
    if !root.exists() {
        return Ok(records);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).with_context(|| format!("Failed listing {}", dir.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("Failed listing {}", dir.display()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|x| x.to_str()) == Some("parquet") {
                let rows = store::read_table(&path, FACT_COLUMNS)?;
                records.extend(rows.iter().map(FactRecord::from_row));
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str, rate: f64) -> FactRecord {
        let mut r = FactRecord {
            fact_uid: String::new(),
            state: "GA".to_string(),
            year_month: "2025-01".to_string(),
            payer_slug: "acme-health".to_string(),
            billing_class: "professional".to_string(),
            code_type: "CPT".to_string(),
            code: code.to_string(),
            pg_uid: "pg".to_string(),
            pos_set_id: "pos".to_string(),
            negotiated_type: Some("negotiated".to_string()),
            negotiation_arrangement: Some("ffs".to_string()),
            negotiated_rate: Some(rate),
            expiration_date: None,
            provider_group_id_raw: Some("raw-1".to_string()),
            reporting_entity_name: Some("Acme Health".to_string()),
        };
        r.fact_uid = r.minted_uid();
        r
    }

    #[test]
    fn upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let batch = vec![record("99213", 82.5), record("99214", 120.0)];

        let first = upsert_facts(dir.path(), &batch).unwrap();
        assert_eq!(first.rows_written, 2);

        let second = upsert_facts(dir.path(), &batch).unwrap();
        assert_eq!(second.rows_written, 2);

        let all = read_all_facts(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        let mut uids: Vec<&str> = all.iter().map(|r| r.fact_uid.as_str()).collect();
        uids.sort();
        uids.dedup();
        assert_eq!(uids.len(), 2);
    }

    #[test]
    fn rate_change_appends_history() {
        let dir = tempfile::tempdir().unwrap();
        upsert_facts(dir.path(), &[record("99213", 82.5)]).unwrap();
        upsert_facts(dir.path(), &[record("99213", 90.0)]).unwrap();

        let all = read_all_facts(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        assert_ne!(all[0].fact_uid, all[1].fact_uid);
        let mut rates: Vec<f64> = all.iter().filter_map(|r| r.negotiated_rate).collect();
        rates.sort_by(f64::total_cmp);
        assert_eq!(rates, vec![82.5, 90.0]);
    }

    #[test]
    fn partition_replaces_file_set_instead_of_appending() {
        let dir = tempfile::tempdir().unwrap();
        let batch = vec![record("99213", 82.5)];
        upsert_facts(dir.path(), &batch).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        upsert_facts(dir.path(), &batch).unwrap();

        let part_dir = batch[0].partition_key().dir(dir.path());
        let files = store::list_parquet_files(&part_dir).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn empty_result_removes_stale_partition_files() {
        let dir = tempfile::tempdir().unwrap();
        let part_dir = dir.path().join("state=GA").join("stale");
        // Stale file with zero logical rows.
        store::write_table(&part_dir.join("part-0.parquet"), FACT_COLUMNS, &[]).unwrap();

        let outcome = upsert_partition(&part_dir, Vec::new()).unwrap();
        assert_eq!(outcome, PartitionOutcome::Cleaned);
        assert!(store::list_parquet_files(&part_dir).unwrap().is_empty());
    }

    #[test]
    fn legacy_rows_without_uid_still_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut legacy = record("99213", 82.5);
        legacy.fact_uid = String::new();
        let part_dir = legacy.partition_key().dir(dir.path());
        upsert_partition(&part_dir, vec![legacy.clone(), legacy]).unwrap();

        let all = read_all_facts(dir.path()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn path_components_are_sanitized() {
        assert_eq!(path_component(""), "null");
        assert_eq!(path_component("pro/fessional"), "pro_fessional");
        assert_eq!(path_component("CPT"), "CPT");
    }
}
