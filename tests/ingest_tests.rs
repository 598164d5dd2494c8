use mrf_warehouse::dims::{DIM_CODE, DIM_PAYER, DIM_POS_SET, DIM_PROVIDER_GROUP, XREF_PG_NPI, XREF_PG_TIN};
use mrf_warehouse::{BatchOptions, RatesRecord, RosterRecord, Warehouse};
use std::collections::HashSet;

fn options() -> BatchOptions {
    BatchOptions {
        state: "GA".to_string(),
        payer_slug_override: None,
    }
}

fn rate(code: &str, rate: f64, pos: &str) -> RatesRecord {
    RatesRecord {
        last_updated_on: Some("2025-01-15".to_string()),
        reporting_entity_name: Some("Acme Health, Inc.".to_string()),
        billing_class: Some("professional".to_string()),
        billing_code_type: Some("CPT".to_string()),
        billing_code: Some(code.to_string()),
        service_codes: Some(pos.to_string()),
        negotiated_type: Some("negotiated".to_string()),
        negotiation_arrangement: Some("ffs".to_string()),
        negotiated_rate: Some(rate),
        description: Some("Office visit".to_string()),
        provider_group_id: Some("pg-1".to_string()),
        ..RatesRecord::default()
    }
}

fn roster(group: &str, npi: &str, tin: &str) -> RosterRecord {
    RosterRecord {
        reporting_entity_name: Some("Acme Health, Inc.".to_string()),
        last_updated_on: Some("2025-01-15".to_string()),
        provider_group_id: Some(group.to_string()),
        npi: Some(npi.to_string()),
        tin_type: Some("ein".to_string()),
        tin_value: Some(tin.to_string()),
        ..RosterRecord::default()
    }
}

#[test]
fn reingesting_the_same_batch_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let wh = Warehouse::open(dir.path()).unwrap();
    let batch = vec![rate("99213", 82.5, "['11','02']"), rate("99214", 120.0, "11")];

    let first = wh.ingest_rates_batch(&batch, &options()).unwrap();
    assert_eq!(first.facts.rows_written, 2);
    assert_eq!(first.code_rows_appended, 2);
    assert_eq!(first.payer_rows_appended, 1);

    let second = wh.ingest_rates_batch(&batch, &options()).unwrap();
    assert_eq!(second.facts.rows_written, 2);
    assert_eq!(second.code_rows_appended, 0);
    assert_eq!(second.payer_rows_appended, 0);
    assert_eq!(second.provider_group_rows_appended, 0);
    assert_eq!(second.pos_set_rows_appended, 0);

    let facts = wh.load_facts().unwrap();
    assert_eq!(facts.len(), 2);
    let uids: HashSet<&str> = facts.iter().map(|f| f.fact_uid.as_str()).collect();
    assert_eq!(uids.len(), 2);

    assert_eq!(wh.dim_row_count(&DIM_CODE).unwrap(), 2);
    assert_eq!(wh.dim_row_count(&DIM_PAYER).unwrap(), 1);
    assert_eq!(wh.dim_row_count(&DIM_PROVIDER_GROUP).unwrap(), 1);
    assert_eq!(wh.dim_row_count(&DIM_POS_SET).unwrap(), 2);
}

#[test]
fn rate_change_preserves_history_instead_of_updating() {
    let dir = tempfile::tempdir().unwrap();
    let wh = Warehouse::open(dir.path()).unwrap();

    wh.ingest_rates_batch(&[rate("99213", 82.5, "11")], &options()).unwrap();
    wh.ingest_rates_batch(&[rate("99213", 90.0, "11")], &options()).unwrap();

    let facts = wh.load_facts().unwrap();
    assert_eq!(facts.len(), 2);
    let mut rates: Vec<f64> = facts.iter().filter_map(|f| f.negotiated_rate).collect();
    rates.sort_by(f64::total_cmp);
    assert_eq!(rates, vec![82.5, 90.0]);

    let uids: HashSet<&str> = facts.iter().map(|f| f.fact_uid.as_str()).collect();
    assert_eq!(uids.len(), 2);
}

#[test]
fn pos_set_formatting_variants_share_one_dimension_row() {
    let dir = tempfile::tempdir().unwrap();
    let wh = Warehouse::open(dir.path()).unwrap();

    // Same member set in three encodings.
    let batch = vec![
        rate("99213", 82.5, "['11','02']"),
        rate("99214", 91.0, "02, 11"),
        rate("99215", 99.0, "11|02"),
    ];
    wh.ingest_rates_batch(&batch, &options()).unwrap();
    assert_eq!(wh.dim_row_count(&DIM_POS_SET).unwrap(), 1);

    let facts = wh.load_facts().unwrap();
    let pos_ids: HashSet<&str> = facts.iter().map(|f| f.pos_set_id.as_str()).collect();
    assert_eq!(pos_ids.len(), 1);
}

#[test]
fn roster_ingest_builds_crosswalks() {
    let dir = tempfile::tempdir().unwrap();
    let wh = Warehouse::open(dir.path()).unwrap();

    let batch = vec![
        roster("pg-1", "1234567890", "12-3456789"),
        roster("pg-1", "1987654321", "12-3456789"),
        roster("pg-2", "1234567890", "98-7654321"),
    ];
    let summary = wh.ingest_roster_batch(&batch, &options()).unwrap();
    assert_eq!(summary.provider_group_rows_appended, 2);
    assert_eq!(summary.npi_rows_appended, 3);
    assert_eq!(summary.tin_rows_appended, 2);

    // Re-running appends nothing.
    let again = wh.ingest_roster_batch(&batch, &options()).unwrap();
    assert_eq!(again.provider_group_rows_appended, 0);
    assert_eq!(again.npi_rows_appended, 0);
    assert_eq!(again.tin_rows_appended, 0);

    assert_eq!(wh.dim_row_count(&XREF_PG_NPI).unwrap(), 3);
    assert_eq!(wh.dim_row_count(&XREF_PG_TIN).unwrap(), 2);
}

#[test]
fn rates_and_roster_mint_the_same_provider_group() {
    let dir = tempfile::tempdir().unwrap();
    let wh = Warehouse::open(dir.path()).unwrap();

    wh.ingest_rates_batch(&[rate("99213", 82.5, "11")], &options()).unwrap();
    let summary = wh
        .ingest_roster_batch(&[roster("pg-1", "1234567890", "12-3456789")], &options())
        .unwrap();

    // The roster's provider group was already minted by the rates batch.
    assert_eq!(summary.provider_group_rows_appended, 0);
    assert_eq!(wh.dim_row_count(&DIM_PROVIDER_GROUP).unwrap(), 1);
}

#[test]
fn partitions_split_on_billing_class_and_code_type() {
    let dir = tempfile::tempdir().unwrap();
    let wh = Warehouse::open(dir.path()).unwrap();

    let mut institutional = rate("0213T", 300.0, "11");
    institutional.billing_class = Some("institutional".to_string());
    institutional.billing_code_type = Some("HCPCS".to_string());
    wh.ingest_rates_batch(&[rate("99213", 82.5, "11"), institutional], &options())
        .unwrap();

    let fact_root = wh.fact_root();
    let state_dir = fact_root.join("state=GA").join("year_month=2025-01");
    let payer_dir = state_dir.join("payer_slug=acme-health-inc");
    assert!(payer_dir.join("billing_class=professional").join("code_type=CPT").is_dir());
    assert!(payer_dir.join("billing_class=institutional").join("code_type=HCPCS").is_dir());
    assert_eq!(wh.load_facts().unwrap().len(), 2);
}
