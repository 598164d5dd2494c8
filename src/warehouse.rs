use crate::batch::{
    BatchOptions, NormalizedRatesBatch, NormalizedRosterBatch, RatesRecord, RosterRecord,
    normalize_rates_batch, normalize_roster_batch,
};
use crate::dims::{
    self, DIM_CODE, DIM_PAYER, DIM_POS_SET, DIM_PROVIDER_GROUP, TableDef, XREF_PG_NPI, XREF_PG_TIN,
};
use crate::fact::{self, FactRecord, UpsertSummary};
use crate::store::{self, Row};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Root handle over one on-disk warehouse:
///
/// ```text
/// <root>/dims/<table>.parquet
/// <root>/xrefs/<table>.parquet
/// <root>/gold/fact_rate/state=…/…/part-<millis>.parquet
/// <root>/benchmarks/bench_medicare_<kind>.parquet
/// ```
#[derive(Debug, Clone)]
pub struct Warehouse {
    root: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub batch_id: String,
    pub facts: UpsertSummary,
    pub code_rows_appended: usize,
    pub payer_rows_appended: usize,
    pub provider_group_rows_appended: usize,
    pub pos_set_rows_appended: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RosterIngestSummary {
    pub batch_id: String,
    pub provider_group_rows_appended: usize,
    pub npi_rows_appended: usize,
    pub tin_rows_appended: usize,
}

impl Warehouse {
    pub fn open(root: impl Into<PathBuf>) -> Result<Warehouse> {
        let root = root.into();
        for dir in ["dims", "xrefs", "gold/fact_rate", "benchmarks"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed creating {}", path.display()))?;
        }
        Ok(Warehouse { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fact_root(&self) -> PathBuf {
        self.root.join("gold").join("fact_rate")
    }

    pub fn benchmarks_dir(&self) -> PathBuf {
        self.root.join("benchmarks")
    }

    pub fn dim_path(&self, table: &TableDef) -> PathBuf {
        let dir = if table.name.starts_with("xref_") {
            "xrefs"
        } else {
            "dims"
        };
        self.root.join(dir).join(format!("{}.parquet", table.name))
    }

    fn merge_dim(&self, table: &TableDef, rows: Vec<Row>) -> Result<usize> {
        let outcome = dims::merge_append_unique(&self.dim_path(table), table, rows)?;
        Ok(outcome.appended_rows)
    }

    /// Fold one normalized rates batch into the store: dimension state first,
    /// then the partitioned fact table.
    pub fn apply_rates_batch(&self, batch: NormalizedRatesBatch) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            batch_id: batch.batch_id,
            ..IngestSummary::default()
        };
        summary.code_rows_appended = self.merge_dim(
            &DIM_CODE,
            batch.code_rows.iter().map(|r| r.to_row()).collect(),
        )?;
        summary.payer_rows_appended = self.merge_dim(
            &DIM_PAYER,
            batch.payer_rows.iter().map(|r| r.to_row()).collect(),
        )?;
        summary.provider_group_rows_appended = self.merge_dim(
            &DIM_PROVIDER_GROUP,
            batch.provider_group_rows.iter().map(|r| r.to_row()).collect(),
        )?;
        summary.pos_set_rows_appended = self.merge_dim(
            &DIM_POS_SET,
            batch.pos_set_rows.iter().map(|r| r.to_row()).collect(),
        )?;
        summary.facts = fact::upsert_facts(&self.fact_root(), &batch.facts)?;
        info!(
            batch = %summary.batch_id,
            facts = summary.facts.rows_written,
            "rates batch applied"
        );
        Ok(summary)
    }

    /// Normalize and fold one raw rates extract.
    pub fn ingest_rates_batch(
        &self,
        records: &[RatesRecord],
        options: &BatchOptions,
    ) -> Result<IngestSummary> {
        self.apply_rates_batch(normalize_rates_batch(records, options))
    }

    pub fn apply_roster_batch(&self, batch: NormalizedRosterBatch) -> Result<RosterIngestSummary> {
        let mut summary = RosterIngestSummary {
            batch_id: batch.batch_id,
            ..RosterIngestSummary::default()
        };
        summary.provider_group_rows_appended = self.merge_dim(
            &DIM_PROVIDER_GROUP,
            batch.provider_group_rows.iter().map(|r| r.to_row()).collect(),
        )?;
        summary.npi_rows_appended = self.merge_dim(
            &XREF_PG_NPI,
            batch.npi_rows.iter().map(|r| r.to_row()).collect(),
        )?;
        summary.tin_rows_appended = self.merge_dim(
            &XREF_PG_TIN,
            batch.tin_rows.iter().map(|r| r.to_row()).collect(),
        )?;
        info!(
            batch = %summary.batch_id,
            npis = summary.npi_rows_appended,
            tins = summary.tin_rows_appended,
            "roster batch applied"
        );
        Ok(summary)
    }

    /// Normalize and fold one raw roster extract.
    pub fn ingest_roster_batch(
        &self,
        records: &[RosterRecord],
        options: &BatchOptions,
    ) -> Result<RosterIngestSummary> {
        self.apply_roster_batch(normalize_roster_batch(records, options))
    }

    /// Every fact row currently in the store, across all partitions.
    pub fn load_facts(&self) -> Result<Vec<FactRecord>> {
        fact::read_all_facts(&self.fact_root())
    }

    /// Row count of one dimension/crosswalk table; absent table reads as 0.
    pub fn dim_row_count(&self, table: &TableDef) -> Result<usize> {
        let path = self.dim_path(table);
        if !path.exists() {
            return Ok(0);
        }
        Ok(store::read_table(&path, table.columns)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Warehouse::open(dir.path().join("wh")).unwrap();
        assert!(wh.fact_root().is_dir());
        assert!(wh.benchmarks_dir().is_dir());
        assert!(wh.root().join("dims").is_dir());
        assert!(wh.root().join("xrefs").is_dir());
        assert_eq!(wh.dim_row_count(&DIM_CODE).unwrap(), 0);
    }

    #[test]
    fn xref_tables_land_under_xrefs() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Warehouse::open(dir.path()).unwrap();
        assert!(wh.dim_path(&XREF_PG_NPI).starts_with(dir.path().join("xrefs")));
        assert!(wh.dim_path(&DIM_PAYER).starts_with(dir.path().join("dims")));
    }
}
