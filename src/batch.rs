use crate::dims::{CodeDimRow, NpiXrefRow, PayerDimRow, PosSetDimRow, ProviderGroupDimRow, TinXrefRow};
use crate::fact::FactRecord;
use crate::identity;
use crate::normalize;
use crate::store::{self, ColumnSpec, Row, Value, float64, utf8};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use tracing::warn;

/// One raw negotiated-rate line as extracted upstream. Every column is
/// optional; extracts routinely omit whole columns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RatesRecord {
    pub last_updated_on: Option<String>,
    pub reporting_entity_name: Option<String>,
    pub version: Option<String>,
    pub billing_class: Option<String>,
    pub billing_code_type: Option<String>,
    pub billing_code: Option<String>,
    pub service_codes: Option<String>,
    pub negotiated_type: Option<String>,
    pub negotiation_arrangement: Option<String>,
    #[serde(deserialize_with = "de_opt_f64")]
    pub negotiated_rate: Option<f64>,
    pub expiration_date: Option<String>,
    pub description: Option<String>,
    pub name: Option<String>,
    pub provider_reference_id: Option<String>,
    pub provider_group_id: Option<String>,
}

/// One raw provider-roster line (group membership by NPI/TIN).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RosterRecord {
    pub last_updated_on: Option<String>,
    pub reporting_entity_name: Option<String>,
    pub version: Option<String>,
    pub provider_group_id: Option<String>,
    pub provider_reference_id: Option<String>,
    pub npi: Option<String>,
    pub tin_type: Option<String>,
    pub tin_value: Option<String>,
}

/// Rates arrive as text more often than not; parse leniently, treating
/// anything non-numeric as absent.
fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.trim().parse().ok()))
}

/// Read a rates extract from CSV. A row that fails to deserialize is logged
/// and skipped; one malformed line must not abort the batch.
pub fn read_rates_csv(path: &Path) -> Result<Vec<RatesRecord>> {
    read_csv(path)
}

pub fn read_roster_csv(path: &Path) -> Result<Vec<RosterRecord>> {
    read_csv(path)
}

fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let mut records: Vec<T> = Vec::new();
    for (line, result) in reader.deserialize::<T>().enumerate() {
        match result {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(file = %path.display(), line = line + 2, %err, "skipping malformed row");
            }
        }
    }
    Ok(records)
}

const RATES_COLS: &[ColumnSpec] = &[
    utf8("last_updated_on"),
    utf8("reporting_entity_name"),
    utf8("version"),
    utf8("billing_class"),
    utf8("billing_code_type"),
    utf8("billing_code"),
    utf8("service_codes"),
    utf8("negotiated_type"),
    utf8("negotiation_arrangement"),
    float64("negotiated_rate"),
    utf8("expiration_date"),
    utf8("description"),
    utf8("name"),
    utf8("provider_reference_id"),
    utf8("provider_group_id"),
];

const ROSTER_COLS: &[ColumnSpec] = &[
    utf8("last_updated_on"),
    utf8("reporting_entity_name"),
    utf8("version"),
    utf8("provider_group_id"),
    utf8("provider_reference_id"),
    utf8("npi"),
    utf8("tin_type"),
    utf8("tin_value"),
];

fn cell_text(row: &Row, idx: usize) -> Option<String> {
    row.get(idx).cloned().and_then(Value::into_text)
}

/// Read a rates extract from Parquet, tolerating absent columns (back-filled
/// as nulls by the table reader).
pub fn read_rates_parquet(path: &Path) -> Result<Vec<RatesRecord>> {
    let rows = store::read_table(path, RATES_COLS)?;
    Ok(rows
        .iter()
        .map(|row| RatesRecord {
            last_updated_on: cell_text(row, 0),
            reporting_entity_name: cell_text(row, 1),
            version: cell_text(row, 2),
            billing_class: cell_text(row, 3),
            billing_code_type: cell_text(row, 4),
            billing_code: cell_text(row, 5),
            service_codes: cell_text(row, 6),
            negotiated_type: cell_text(row, 7),
            negotiation_arrangement: cell_text(row, 8),
            negotiated_rate: row.get(9).and_then(Value::as_float),
            expiration_date: cell_text(row, 10),
            description: cell_text(row, 11),
            name: cell_text(row, 12),
            provider_reference_id: cell_text(row, 13),
            provider_group_id: cell_text(row, 14),
        })
        .collect())
}

pub fn read_roster_parquet(path: &Path) -> Result<Vec<RosterRecord>> {
    let rows = store::read_table(path, ROSTER_COLS)?;
    Ok(rows
        .iter()
        .map(|row| RosterRecord {
            last_updated_on: cell_text(row, 0),
            reporting_entity_name: cell_text(row, 1),
            version: cell_text(row, 2),
            provider_group_id: cell_text(row, 3),
            provider_reference_id: cell_text(row, 4),
            npi: cell_text(row, 5),
            tin_type: cell_text(row, 6),
            tin_value: cell_text(row, 7),
        })
        .collect())
}

/// Batch-level settings supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Region tag stamped onto every fact row and partition path.
    pub state: String,
    /// Explicit payer slug; when set it wins over slugifying the
    /// reporting-entity name.
    pub payer_slug_override: Option<String>,
}

/// A rates batch after normalization: minted identities attached, split into
/// the dimension rows, POS-set rows, and fact rows the warehouse folds in.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRatesBatch {
    pub batch_id: String,
    pub facts: Vec<FactRecord>,
    pub code_rows: Vec<CodeDimRow>,
    pub payer_rows: Vec<PayerDimRow>,
    pub provider_group_rows: Vec<ProviderGroupDimRow>,
    pub pos_set_rows: Vec<PosSetDimRow>,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedRosterBatch {
    pub batch_id: String,
    pub provider_group_rows: Vec<ProviderGroupDimRow>,
    pub npi_rows: Vec<NpiXrefRow>,
    pub tin_rows: Vec<TinXrefRow>,
}

fn opt_trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn payer_slug(record_name: &Option<String>, options: &BatchOptions) -> String {
    if let Some(slug) = &options.payer_slug_override {
        return slug.clone();
    }
    normalize::slugify(record_name.as_deref().unwrap_or(""))
}

fn raw_group_id(group_id: &Option<String>, reference_id: &Option<String>) -> Option<String> {
    opt_trimmed(group_id).or_else(|| opt_trimmed(reference_id))
}

/// Normalize one rates extract: attach payer slug, period, version, and all
/// minted identities, then split into dimension rows and fact rows. Dimension
/// rows with a null natural key are dropped; fact rows are deduplicated on
/// `fact_uid` within the batch.
pub fn normalize_rates_batch(
    records: &[RatesRecord],
    options: &BatchOptions,
) -> NormalizedRatesBatch {
    let mut batch = NormalizedRatesBatch::default();

    let mut seen_facts: HashSet<String> = HashSet::new();
    let mut seen_codes: HashSet<(String, String)> = HashSet::new();
    let mut seen_payers: HashSet<String> = HashSet::new();
    let mut seen_groups: HashSet<String> = HashSet::new();
    let mut seen_pos_sets: HashSet<String> = HashSet::new();

    for record in records {
        let slug = payer_slug(&record.reporting_entity_name, options);
        let year_month = normalize::year_month(record.last_updated_on.as_deref().unwrap_or(""));
        let version = normalize::version_or_default(record.version.as_deref());
        let batch_id = identity::batch_id(&slug, &year_month, &version);
        if batch.batch_id.is_empty() {
            batch.batch_id = batch_id.clone();
        }

        let raw_group = raw_group_id(&record.provider_group_id, &record.provider_reference_id);
        let pg_uid = identity::provider_group_uid(&batch_id, raw_group.as_deref());

        let pos_members =
            normalize::normalize_service_codes(record.service_codes.as_deref().unwrap_or(""));
        let pos_set_id = identity::pos_set_id(&pos_members);

        let code_type = opt_trimmed(&record.billing_code_type);
        let code = opt_trimmed(&record.billing_code);

        if let (Some(code_type), Some(code)) = (&code_type, &code) {
            if seen_codes.insert((code_type.clone(), code.clone())) {
                batch.code_rows.push(CodeDimRow {
                    code_type: code_type.clone(),
                    code: code.clone(),
                    code_description: record.description.clone(),
                    code_name: record.name.clone(),
                });
            }
        }
        if !slug.is_empty() && seen_payers.insert(slug.clone()) {
            batch.payer_rows.push(PayerDimRow {
                payer_slug: slug.clone(),
                reporting_entity_name: record.reporting_entity_name.clone(),
                version: version.clone(),
            });
        }
        if seen_groups.insert(pg_uid.clone()) {
            batch.provider_group_rows.push(ProviderGroupDimRow {
                pg_uid: pg_uid.clone(),
                payer_slug: slug.clone(),
                provider_group_id_raw: raw_group.clone(),
                version: version.clone(),
            });
        }
        if seen_pos_sets.insert(pos_set_id.clone()) {
            batch.pos_set_rows.push(PosSetDimRow {
                pos_set_id: pos_set_id.clone(),
                members: pos_members.clone(),
            });
        }

        let mut fact = FactRecord {
            fact_uid: String::new(),
            state: options.state.clone(),
            year_month,
            payer_slug: slug,
            billing_class: record.billing_class.clone().unwrap_or_default(),
            code_type: code_type.unwrap_or_default(),
            code: code.unwrap_or_default(),
            pg_uid,
            pos_set_id,
            negotiated_type: record.negotiated_type.clone(),
            negotiation_arrangement: record.negotiation_arrangement.clone(),
            negotiated_rate: record.negotiated_rate,
            expiration_date: normalize::expiration_date(record.expiration_date.as_deref()),
            provider_group_id_raw: raw_group,
            reporting_entity_name: record.reporting_entity_name.clone(),
        };
        fact.fact_uid = fact.minted_uid();
        if seen_facts.insert(fact.fact_uid.clone()) {
            batch.facts.push(fact);
        }
    }
    batch
}

/// Normalize a roster extract into provider-group dimension rows plus the
/// NPI/TIN crosswalk rows. Rows with no NPI (resp. TIN value) produce no
/// crosswalk entry.
pub fn normalize_roster_batch(
    records: &[RosterRecord],
    options: &BatchOptions,
) -> NormalizedRosterBatch {
    let mut batch = NormalizedRosterBatch::default();

    let mut seen_groups: HashSet<String> = HashSet::new();
    let mut seen_npis: HashSet<(String, String)> = HashSet::new();
    let mut seen_tins: HashSet<(String, String)> = HashSet::new();

    for record in records {
        let slug = payer_slug(&record.reporting_entity_name, options);
        let year_month = normalize::year_month(record.last_updated_on.as_deref().unwrap_or(""));
        let version = normalize::version_or_default(record.version.as_deref());
        let batch_id = identity::batch_id(&slug, &year_month, &version);
        if batch.batch_id.is_empty() {
            batch.batch_id = batch_id.clone();
        }

        let raw_group = raw_group_id(&record.provider_group_id, &record.provider_reference_id);
        let pg_uid = identity::provider_group_uid(&batch_id, raw_group.as_deref());

        if seen_groups.insert(pg_uid.clone()) {
            batch.provider_group_rows.push(ProviderGroupDimRow {
                pg_uid: pg_uid.clone(),
                payer_slug: slug,
                provider_group_id_raw: raw_group,
                version,
            });
        }
        if let Some(npi) = opt_trimmed(&record.npi) {
            if seen_npis.insert((pg_uid.clone(), npi.clone())) {
                batch.npi_rows.push(NpiXrefRow {
                    pg_uid: pg_uid.clone(),
                    npi,
                });
            }
        }
        if let Some(tin_value) = opt_trimmed(&record.tin_value) {
            if seen_tins.insert((pg_uid.clone(), tin_value.clone())) {
                batch.tin_rows.push(TinXrefRow {
                    pg_uid: pg_uid.clone(),
                    tin_type: record.tin_type.clone(),
                    tin_value,
                });
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options() -> BatchOptions {
        BatchOptions {
            state: "GA".to_string(),
            payer_slug_override: None,
        }
    }

    fn rate_record(code: &str, rate: f64, pos: &str) -> RatesRecord {
        RatesRecord {
            last_updated_on: Some("2025-03-14".to_string()),
            reporting_entity_name: Some("Acme Health, Inc.".to_string()),
            billing_class: Some("professional".to_string()),
            billing_code_type: Some("CPT".to_string()),
            billing_code: Some(code.to_string()),
            service_codes: Some(pos.to_string()),
            negotiated_type: Some("negotiated".to_string()),
            negotiation_arrangement: Some("ffs".to_string()),
            negotiated_rate: Some(rate),
            provider_group_id: Some("pg-1".to_string()),
            ..RatesRecord::default()
        }
    }

    #[test]
    fn normalization_attaches_ids_and_splits_rows() {
        let batch = normalize_rates_batch(
            &[rate_record("99213", 82.5, "['11','02']"), rate_record("99214", 120.0, "02 11")],
            &options(),
        );
        assert_eq!(batch.facts.len(), 2);
        assert_eq!(batch.code_rows.len(), 2);
        assert_eq!(batch.payer_rows.len(), 1);
        assert_eq!(batch.payer_rows[0].payer_slug, "acme-health-inc");
        assert_eq!(batch.provider_group_rows.len(), 1);
        // Same logical POS set regardless of formatting.
        assert_eq!(batch.pos_set_rows.len(), 1);
        assert_eq!(batch.facts[0].year_month, "2025-03");
        assert!(!batch.batch_id.is_empty());
    }

    #[test]
    fn duplicate_rows_collapse_to_one_fact() {
        let rows = vec![rate_record("99213", 82.5, "11"), rate_record("99213", 82.5, "11")];
        let batch = normalize_rates_batch(&rows, &options());
        assert_eq!(batch.facts.len(), 1);
    }

    #[test]
    fn override_wins_over_slugified_name() {
        let opts = BatchOptions {
            state: "GA".to_string(),
            payer_slug_override: Some("acme-gold".to_string()),
        };
        let batch = normalize_rates_batch(&[rate_record("99213", 82.5, "11")], &opts);
        assert_eq!(batch.facts[0].payer_slug, "acme-gold");
    }

    #[test]
    fn expiration_sentinel_is_nulled() {
        let mut record = rate_record("99213", 82.5, "11");
        record.expiration_date = Some("9999-12-31".to_string());
        let batch = normalize_rates_batch(&[record], &options());
        assert_eq!(batch.facts[0].expiration_date, None);
    }

    #[test]
    fn roster_rows_without_identifiers_emit_no_xrefs() {
        let records = vec![
            RosterRecord {
                reporting_entity_name: Some("Acme Health".to_string()),
                provider_group_id: Some("pg-1".to_string()),
                npi: Some("1234567890".to_string()),
                tin_type: Some("ein".to_string()),
                tin_value: Some("12-3456789".to_string()),
                ..RosterRecord::default()
            },
            RosterRecord {
                reporting_entity_name: Some("Acme Health".to_string()),
                provider_group_id: Some("pg-1".to_string()),
                ..RosterRecord::default()
            },
        ];
        let batch = normalize_roster_batch(&records, &options());
        assert_eq!(batch.provider_group_rows.len(), 1);
        assert_eq!(batch.npi_rows.len(), 1);
        assert_eq!(batch.tin_rows.len(), 1);
    }

    #[test]
    fn csv_reader_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "reporting_entity_name,billing_code_type,billing_code,negotiated_rate").unwrap();
        writeln!(file, "Acme Health,CPT,99213,82.5").unwrap();
        writeln!(file, "Acme Health,CPT,99214,not-a-number").unwrap();
        drop(file);

        let records = read_rates_csv(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].negotiated_rate, Some(82.5));
        // Non-numeric rate degrades to absent rather than killing the row.
        assert_eq!(records[1].negotiated_rate, None);
    }

    #[test]
    fn parquet_round_trip_backfills_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.parquet");
        let narrow: &[ColumnSpec] = &[utf8("billing_code_type"), utf8("billing_code")];
        store::write_table(
            &path,
            narrow,
            &[vec![Value::text("CPT"), Value::text("99213")]],
        )
        .unwrap();

        let records = read_rates_parquet(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].billing_code.as_deref(), Some("99213"));
        assert_eq!(records[0].negotiated_rate, None);
        assert_eq!(records[0].reporting_entity_name, None);
    }
}
