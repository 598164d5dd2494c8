use crate::store::{self, ColumnSpec, Row, Value, utf8};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Schema plus dedup key of one dimension/crosswalk table.
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub key_columns: &'static [&'static str],
}

pub const DIM_CODE: TableDef = TableDef {
    name: "dim_code",
    columns: &[
        utf8("code_type"),
        utf8("code"),
        utf8("code_description"),
        utf8("code_name"),
    ],
    key_columns: &["code_type", "code"],
};

pub const DIM_PAYER: TableDef = TableDef {
    name: "dim_payer",
    columns: &[utf8("payer_slug"), utf8("reporting_entity_name"), utf8("version")],
    key_columns: &["payer_slug"],
};

pub const DIM_PROVIDER_GROUP: TableDef = TableDef {
    name: "dim_provider_group",
    columns: &[
        utf8("pg_uid"),
        utf8("payer_slug"),
        utf8("provider_group_id_raw"),
        utf8("version"),
    ],
    key_columns: &["pg_uid"],
};

pub const DIM_POS_SET: TableDef = TableDef {
    name: "dim_pos_set",
    columns: &[utf8("pos_set_id"), utf8("pos_members")],
    key_columns: &["pos_set_id"],
};

pub const XREF_PG_NPI: TableDef = TableDef {
    name: "xref_pg_member_npi",
    columns: &[utf8("pg_uid"), utf8("npi")],
    key_columns: &["pg_uid", "npi"],
};

pub const XREF_PG_TIN: TableDef = TableDef {
    name: "xref_pg_member_tin",
    columns: &[utf8("pg_uid"), utf8("tin_type"), utf8("tin_value")],
    key_columns: &["pg_uid", "tin_value"],
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub existing_rows: usize,
    pub appended_rows: usize,
}

fn key_indices(table: &TableDef) -> Vec<usize> {
    table
        .key_columns
        .iter()
        .filter_map(|key| table.columns.iter().position(|col| col.name == *key))
        .collect()
}

fn row_key(row: &Row, key_idx: &[usize]) -> Vec<String> {
    key_idx.iter().map(|&i| row[i].key_text()).collect()
}

fn dedup_keep_last(rows: Vec<Row>, key_idx: &[usize]) -> Vec<Row> {
    let mut order: Vec<Vec<String>> = Vec::new();
    let mut latest: HashMap<Vec<String>, Row> = HashMap::new();
    for row in rows {
        let key = row_key(&row, key_idx);
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, row);
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

/// Fold newly observed rows into an on-disk dimension/crosswalk table.
///
/// Absent table: the (key-deduplicated, last write wins) new rows become the
/// table. Existing table: only rows whose key is not already present are
/// appended — existing rows are never rewritten, so an upstream correction to
/// an already-seen key is not reflected through this path. The replacement
/// write is temp-then-rename.
pub fn merge_append_unique(path: &Path, table: &TableDef, new_rows: Vec<Row>) -> Result<MergeOutcome> {
    let key_idx = key_indices(table);
    let incoming = dedup_keep_last(new_rows, &key_idx);

    if !path.exists() {
        if incoming.is_empty() {
            return Ok(MergeOutcome::default());
        }
        let appended = incoming.len();
        store::write_table(path, table.columns, &incoming)?;
        debug!(table = table.name, rows = appended, "created dimension table");
        return Ok(MergeOutcome {
            existing_rows: 0,
            appended_rows: appended,
        });
    }

    let existing = store::read_table(path, table.columns)?;
    let existing_keys: HashSet<Vec<String>> = existing
        .iter()
        .map(|row| row_key(row, &key_idx))
        .collect();

    let novel: Vec<Row> = incoming
        .into_iter()
        .filter(|row| !existing_keys.contains(&row_key(row, &key_idx)))
        .collect();

    let outcome = MergeOutcome {
        existing_rows: existing.len(),
        appended_rows: novel.len(),
    };
    if novel.is_empty() {
        return Ok(outcome);
    }

    let mut merged = existing;
    merged.extend(novel);
    store::write_table(path, table.columns, &merged)?;
    debug!(
        table = table.name,
        existing = outcome.existing_rows,
        appended = outcome.appended_rows,
        "merged dimension table"
    );
    Ok(outcome)
}

/// Code dimension row observed in a rates batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDimRow {
    pub code_type: String,
    pub code: String,
    pub code_description: Option<String>,
    pub code_name: Option<String>,
}

impl CodeDimRow {
    pub fn to_row(&self) -> Row {
        vec![
            Value::text(self.code_type.clone()),
            Value::text(self.code.clone()),
            Value::opt_text(self.code_description.clone()),
            Value::opt_text(self.code_name.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayerDimRow {
    pub payer_slug: String,
    pub reporting_entity_name: Option<String>,
    pub version: String,
}

impl PayerDimRow {
    pub fn to_row(&self) -> Row {
        vec![
            Value::text(self.payer_slug.clone()),
            Value::opt_text(self.reporting_entity_name.clone()),
            Value::text(self.version.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderGroupDimRow {
    pub pg_uid: String,
    pub payer_slug: String,
    pub provider_group_id_raw: Option<String>,
    pub version: String,
}

impl ProviderGroupDimRow {
    pub fn to_row(&self) -> Row {
        vec![
            Value::text(self.pg_uid.clone()),
            Value::text(self.payer_slug.clone()),
            Value::opt_text(self.provider_group_id_raw.clone()),
            Value::text(self.version.clone()),
        ]
    }
}

/// POS-set dimension row; members are stored comma-joined in canonical
/// (sorted, deduplicated) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosSetDimRow {
    pub pos_set_id: String,
    pub members: Vec<String>,
}

impl PosSetDimRow {
    pub fn to_row(&self) -> Row {
        vec![
            Value::text(self.pos_set_id.clone()),
            Value::text(self.members.join(",")),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpiXrefRow {
    pub pg_uid: String,
    pub npi: String,
}

impl NpiXrefRow {
    pub fn to_row(&self) -> Row {
        vec![Value::text(self.pg_uid.clone()), Value::text(self.npi.clone())]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TinXrefRow {
    pub pg_uid: String,
    pub tin_type: Option<String>,
    pub tin_value: String,
}

impl TinXrefRow {
    pub fn to_row(&self) -> Row {
        vec![
            Value::text(self.pg_uid.clone()),
            Value::opt_text(self.tin_type.clone()),
            Value::text(self.tin_value.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_row(code: &str, desc: &str) -> Row {
        CodeDimRow {
            code_type: "CPT".to_string(),
            code: code.to_string(),
            code_description: Some(desc.to_string()),
            code_name: None,
        }
        .to_row()
    }

    #[test]
    fn creates_table_with_keyed_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dim_code.parquet");
        let outcome = merge_append_unique(
            &path,
            &DIM_CODE,
            vec![
                code_row("99213", "first"),
                code_row("99213", "last write wins"),
                code_row("99214", "other"),
            ],
        )
        .unwrap();
        assert_eq!(outcome.appended_rows, 2);

        let rows = store::read_table(&path, DIM_CODE.columns).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][2], Value::text("last write wins"));
    }

    #[test]
    fn anti_join_appends_only_novel_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dim_code.parquet");

        // 10 existing rows.
        let existing: Vec<Row> = (0..10).map(|i| code_row(&format!("{:05}", i), "old")).collect();
        merge_append_unique(&path, &DIM_CODE, existing).unwrap();

        // 10 incoming rows, 3 overlapping keys carrying changed descriptions.
        let incoming: Vec<Row> = (7..17).map(|i| code_row(&format!("{:05}", i), "new")).collect();
        let outcome = merge_append_unique(&path, &DIM_CODE, incoming).unwrap();
        assert_eq!(outcome.existing_rows, 10);
        assert_eq!(outcome.appended_rows, 7);

        let rows = store::read_table(&path, DIM_CODE.columns).unwrap();
        assert_eq!(rows.len(), 17);
        // Overlapping key keeps its original description untouched.
        let row7 = rows
            .iter()
            .find(|r| r[1] == Value::text("00007"))
            .unwrap();
        assert_eq!(row7[2], Value::text("old"));
    }

    #[test]
    fn nothing_novel_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dim_code.parquet");
        merge_append_unique(&path, &DIM_CODE, vec![code_row("99213", "x")]).unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        let outcome =
            merge_append_unique(&path, &DIM_CODE, vec![code_row("99213", "changed")]).unwrap();
        assert_eq!(outcome.appended_rows, 0);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
    }
}
