use crate::fact::FactRecord;
use crate::normalize;
use crate::store::{self, ColumnSpec, Row, Value, float64, utf8};
use anyhow::{Context, Result, bail, ensure};
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Per-year Medicare constants. These change annually, so they are
/// configuration rather than call-site literals. Defaults are CY2025.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct YearConstants {
    pub year: i32,
    pub opps_conversion_factor: f64,
    pub asc_conversion_factor: f64,
    pub opps_labor_share: f64,
    pub asc_labor_share: f64,
}

impl Default for YearConstants {
    fn default() -> YearConstants {
        YearConstants {
            year: 2025,
            opps_conversion_factor: 89.169,
            asc_conversion_factor: 54.895,
            opps_labor_share: 0.60,
            asc_labor_share: 0.50,
        }
    }
}

impl YearConstants {
    pub fn from_json_file(path: &Path) -> Result<YearConstants> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed reading {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed parsing year constants from {}", path.display()))
    }

    /// Benchmark period tag; benchmark tables are pinned to January of the
    /// reference year.
    pub fn year_month(&self) -> String {
        format!("{}-01", self.year)
    }
}

#[derive(Debug, Clone)]
struct LocalityMapRow {
    zip_code: String,
    carrier_code: String,
    locality_code: String,
}

#[derive(Debug, Clone)]
struct LocalityMetaRow {
    mac_code: String,
    locality_code: String,
    fee_schedule_area: String,
    state_name: String,
}

#[derive(Debug, Clone)]
struct GpciRow {
    locality_code: String,
    locality_name: String,
    work_gpci: Option<f64>,
    pe_gpci: Option<f64>,
    mp_gpci: Option<f64>,
}

#[derive(Debug, Clone)]
struct RvuRow {
    procedure_code: String,
    work_rvu: Option<f64>,
    practice_expense_rvu: Option<f64>,
    malpractice_rvu: Option<f64>,
}

#[derive(Debug, Clone)]
struct OppsRow {
    hcpcs: String,
    relative_weight: Option<f64>,
}

#[derive(Debug, Clone)]
struct AscRow {
    hcpcs: String,
    national_rate: Option<f64>,
}

#[derive(Debug, Clone)]
struct WageIndexRow {
    cbsa: String,
    state: String,
    wage_index: Option<f64>,
    is_rural: Option<f64>,
}

#[derive(Debug)]
struct ProfessionalReference {
    locality_map: Vec<LocalityMapRow>,
    locality_meta: Vec<LocalityMetaRow>,
    gpci: Vec<GpciRow>,
    rvu: Vec<RvuRow>,
    conversion_factor: f64,
}

#[derive(Debug)]
struct FacilityReference {
    opps: Vec<OppsRow>,
    asc: Vec<AscRow>,
    wage_index: Vec<WageIndexRow>,
    zip_cbsa: HashMap<String, String>,
}

fn cell_f64(row: &rusqlite::Row<'_>, idx: usize) -> Option<f64> {
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => Some(v as f64),
        Ok(ValueRef::Real(v)) => Some(v),
        Ok(ValueRef::Text(t)) => std::str::from_utf8(t).ok()?.trim().parse().ok(),
        _ => None,
    }
}

fn cell_text(row: &rusqlite::Row<'_>, idx: usize) -> String {
    match row.get_ref(idx) {
        Ok(ValueRef::Text(t)) => String::from_utf8_lossy(t).trim().to_string(),
        Ok(ValueRef::Integer(v)) => v.to_string(),
        Ok(ValueRef::Real(v)) => v.to_string(),
        _ => String::new(),
    }
}

fn zfill5(raw: &str) -> String {
    normalize::zip5(raw).unwrap_or_default()
}

/// Two-letter uppercase prefix of a free-text state/area name
/// (`"AL BIRMINGHAM"` → `AL`).
fn state_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut chars = trimmed.chars();
    let a = chars.next()?;
    let b = chars.next()?;
    if a.is_ascii_uppercase() && b.is_ascii_uppercase() {
        Some(format!("{a}{b}"))
    } else {
        None
    }
}

/// First embedded run of five digits in a CBSA value, if any.
fn cbsa5(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    if bytes.len() < 5 {
        return None;
    }
    for i in 0..=bytes.len() - 5 {
        if bytes[i..i + 5].iter().all(u8::is_ascii_digit) {
            return Some(raw[i..i + 5].to_string());
        }
    }
    None
}

fn find_column(names: &[String], candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|cand| names.iter().position(|n| n.eq_ignore_ascii_case(cand)))
}

fn load_professional(db_path: &Path, year: i32) -> Result<ProfessionalReference> {
    ensure!(
        db_path.exists(),
        "Professional reference database not found: {}",
        db_path.display()
    );
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed opening {}", db_path.display()))?;

    let mut stmt = conn
        .prepare("SELECT zip_code, carrier_code, locality_code FROM medicare_locality_map")
        .context("Failed preparing medicare_locality_map query")?;
    let locality_map = stmt
        .query_map([], |row| {
            Ok(LocalityMapRow {
                zip_code: zfill5(&cell_text(row, 0)),
                carrier_code: cell_text(row, 1),
                locality_code: cell_text(row, 2),
            })
        })
        .context("Failed querying medicare_locality_map")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading medicare_locality_map rows")?;

    let mut stmt = conn
        .prepare(
            "SELECT mac_code, locality_code, fee_schedule_area, state_name \
             FROM medicare_locality_meta",
        )
        .context("Failed preparing medicare_locality_meta query")?;
    let locality_meta = stmt
        .query_map([], |row| {
            Ok(LocalityMetaRow {
                mac_code: cell_text(row, 0),
                locality_code: cell_text(row, 1),
                fee_schedule_area: cell_text(row, 2),
                state_name: cell_text(row, 3),
            })
        })
        .context("Failed querying medicare_locality_meta")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading medicare_locality_meta rows")?;

    let mut stmt = conn
        .prepare(
            "SELECT locality_code, locality_name, work_gpci, pe_gpci, mp_gpci \
             FROM cms_gpci WHERE year = ?1",
        )
        .context("Failed preparing cms_gpci query")?;
    let gpci: Vec<GpciRow> = stmt
        .query_map([year], |row| {
            Ok(GpciRow {
                locality_code: cell_text(row, 0),
                locality_name: cell_text(row, 1),
                work_gpci: cell_f64(row, 2),
                pe_gpci: cell_f64(row, 3),
                mp_gpci: cell_f64(row, 4),
            })
        })
        .context("Failed querying cms_gpci")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading cms_gpci rows")?
        .into_iter()
        // Some source years embed a stray header row in the data.
        .filter(|row| row.locality_code != "locality_code")
        .collect();

    let mut stmt = conn
        .prepare(
            "SELECT procedure_code, work_rvu, practice_expense_rvu, malpractice_rvu \
             FROM cms_rvu WHERE year = ?1 AND (modifier IS NULL OR modifier = '')",
        )
        .context("Failed preparing cms_rvu query")?;
    let rvu = stmt
        .query_map([year], |row| {
            Ok(RvuRow {
                procedure_code: normalize::normalize_code(&cell_text(row, 0)),
                work_rvu: cell_f64(row, 1),
                practice_expense_rvu: cell_f64(row, 2),
                malpractice_rvu: cell_f64(row, 3),
            })
        })
        .context("Failed querying cms_rvu")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading cms_rvu rows")?;

    let mut stmt = conn
        .prepare("SELECT conversion_factor FROM cms_conversion_factor WHERE year = ?1")
        .context("Failed preparing cms_conversion_factor query")?;
    let factors = stmt
        .query_map([year], |row| Ok(cell_f64(row, 0)))
        .context("Failed querying cms_conversion_factor")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading cms_conversion_factor rows")?;
    let conversion_factor = match factors.first() {
        Some(Some(cf)) => *cf,
        _ => bail!("No conversion factor row for year {year} in {}", db_path.display()),
    };

    info!(
        localities = locality_map.len(),
        gpci = gpci.len(),
        rvu = rvu.len(),
        conversion_factor,
        "professional reference tables loaded"
    );
    Ok(ProfessionalReference {
        locality_map,
        locality_meta,
        gpci,
        rvu,
        conversion_factor,
    })
}

fn load_facility(db_path: &Path) -> Result<FacilityReference> {
    ensure!(
        db_path.exists(),
        "Facility reference database not found: {}",
        db_path.display()
    );
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed opening {}", db_path.display()))?;

    let mut stmt = conn
        .prepare("SELECT hcpcs, rel_wt FROM opps_addendum_b")
        .context("Failed preparing opps_addendum_b query")?;
    let opps = stmt
        .query_map([], |row| {
            Ok(OppsRow {
                hcpcs: normalize::normalize_code(&cell_text(row, 0)),
                relative_weight: cell_f64(row, 1),
            })
        })
        .context("Failed querying opps_addendum_b")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading opps_addendum_b rows")?;

    let mut stmt = conn
        .prepare("SELECT hcpcs, nat_rate FROM asc_addendum_aa")
        .context("Failed preparing asc_addendum_aa query")?;
    let asc = stmt
        .query_map([], |row| {
            Ok(AscRow {
                hcpcs: normalize::normalize_code(&cell_text(row, 0)),
                national_rate: cell_f64(row, 1),
            })
        })
        .context("Failed querying asc_addendum_aa")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading asc_addendum_aa rows")?;

    // The wage-index table's column names drift between source vintages, so
    // resolve them by name from a full projection.
    let mut stmt = conn
        .prepare("SELECT * FROM cbsa_wage_index")
        .context("Failed preparing cbsa_wage_index query")?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let cbsa_idx = find_column(&names, &["cbsa"])
        .context("cbsa_wage_index has no cbsa column")?;
    let state_idx = find_column(&names, &["state"])
        .context("cbsa_wage_index has no state column")?;
    let wi_idx = find_column(&names, &["wi_pre", "wage_index", "wi", "wageindex"]);
    if wi_idx.is_none() {
        warn!("cbsa_wage_index has no wage-index column; state averages default to 1.0");
    }
    let rural_idx = find_column(&names, &["is_state_rural"]);
    let wage_index = stmt
        .query_map([], |row| {
            Ok(WageIndexRow {
                cbsa: cell_text(row, cbsa_idx),
                state: cell_text(row, state_idx).to_ascii_uppercase(),
                wage_index: wi_idx.and_then(|idx| cell_f64(row, idx)),
                is_rural: rural_idx.and_then(|idx| cell_f64(row, idx)),
            })
        })
        .context("Failed querying cbsa_wage_index")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading cbsa_wage_index rows")?;
    let has_wage_index = wi_idx.is_some();

    let mut stmt = conn
        .prepare("SELECT * FROM zip_cbsa")
        .context("Failed preparing zip_cbsa query")?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let zip_idx = find_column(&names, &["zip", "zip_code", "zip5"])
        .context("zip_cbsa has no zip column")?;
    let cbsa_idx = find_column(&names, &["cbsa", "cbsa_code"])
        .context("zip_cbsa has no cbsa column")?;
    let mut zip_cbsa: HashMap<String, String> = HashMap::new();
    let pairs = stmt
        .query_map([], |row| {
            Ok((zfill5(&cell_text(row, zip_idx)), cell_text(row, cbsa_idx)))
        })
        .context("Failed querying zip_cbsa")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed reading zip_cbsa rows")?;
    for (zip, cbsa) in pairs {
        if !zip.is_empty() {
            zip_cbsa.entry(zip).or_insert(cbsa);
        }
    }

    info!(
        opps = opps.len(),
        asc = asc.len(),
        wage_index = wage_index.len(),
        zips = zip_cbsa.len(),
        has_wage_index,
        "facility reference tables loaded"
    );
    Ok(FacilityReference {
        opps,
        asc,
        wage_index,
        zip_cbsa,
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn value(self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Averaged GPCI components for one geography.
#[derive(Debug, Clone, Copy, Default)]
struct GpciAverages {
    work: Option<f64>,
    pe: Option<f64>,
    mp: Option<f64>,
}

impl GpciAverages {
    /// Missing index components fall back to the neutral multiplier.
    fn work_or_neutral(&self) -> f64 {
        self.work.unwrap_or(1.0)
    }

    fn pe_or_neutral(&self) -> f64 {
        self.pe.unwrap_or(1.0)
    }

    fn mp_or_neutral(&self) -> f64 {
        self.mp.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BenchmarkType {
    Professional,
    Opps,
    Asc,
}

impl BenchmarkType {
    pub fn as_str(self) -> &'static str {
        match self {
            BenchmarkType::Professional => "professional",
            BenchmarkType::Opps => "opps",
            BenchmarkType::Asc => "asc",
        }
    }

    pub fn parse(raw: &str) -> Option<BenchmarkType> {
        match raw {
            "professional" => Some(BenchmarkType::Professional),
            "opps" => Some(BenchmarkType::Opps),
            "asc" => Some(BenchmarkType::Asc),
            _ => None,
        }
    }
}

pub const BENCHMARK_COLUMNS: &[ColumnSpec] = &[
    utf8("state"),
    utf8("year_month"),
    utf8("code_type"),
    utf8("code"),
    utf8("benchmark_type"),
    float64("national_rate"),
    float64("stateavg_rate"),
    float64("work_rvu"),
    float64("practice_expense_rvu"),
    float64("malpractice_rvu"),
    float64("work_gpci"),
    float64("pe_gpci"),
    float64("mp_gpci"),
    float64("conversion_factor"),
    float64("relative_weight"),
    float64("state_wage_index"),
    float64("adjustment_factor"),
];

/// One benchmark row: national and state-averaged rates plus the raw
/// components that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkRecord {
    pub state: String,
    pub year_month: String,
    pub code_type: String,
    pub code: String,
    pub benchmark_type: BenchmarkType,
    pub national_rate: Option<f64>,
    pub stateavg_rate: Option<f64>,
    pub work_rvu: Option<f64>,
    pub practice_expense_rvu: Option<f64>,
    pub malpractice_rvu: Option<f64>,
    pub work_gpci: Option<f64>,
    pub pe_gpci: Option<f64>,
    pub mp_gpci: Option<f64>,
    pub conversion_factor: Option<f64>,
    pub relative_weight: Option<f64>,
    pub state_wage_index: Option<f64>,
    pub adjustment_factor: Option<f64>,
}

impl BenchmarkRecord {
    fn blank(
        state: &str,
        year_month: &str,
        code_type: &str,
        code: &str,
        benchmark_type: BenchmarkType,
    ) -> BenchmarkRecord {
        BenchmarkRecord {
            state: state.to_string(),
            year_month: year_month.to_string(),
            code_type: code_type.to_string(),
            code: code.to_string(),
            benchmark_type,
            national_rate: None,
            stateavg_rate: None,
            work_rvu: None,
            practice_expense_rvu: None,
            malpractice_rvu: None,
            work_gpci: None,
            pe_gpci: None,
            mp_gpci: None,
            conversion_factor: None,
            relative_weight: None,
            state_wage_index: None,
            adjustment_factor: None,
        }
    }

    pub fn to_row(&self) -> Row {
        vec![
            Value::text(self.state.clone()),
            Value::text(self.year_month.clone()),
            Value::text(self.code_type.clone()),
            Value::text(self.code.clone()),
            Value::text(self.benchmark_type.as_str()),
            Value::opt_float(self.national_rate),
            Value::opt_float(self.stateavg_rate),
            Value::opt_float(self.work_rvu),
            Value::opt_float(self.practice_expense_rvu),
            Value::opt_float(self.malpractice_rvu),
            Value::opt_float(self.work_gpci),
            Value::opt_float(self.pe_gpci),
            Value::opt_float(self.mp_gpci),
            Value::opt_float(self.conversion_factor),
            Value::opt_float(self.relative_weight),
            Value::opt_float(self.state_wage_index),
            Value::opt_float(self.adjustment_factor),
        ]
    }

    pub fn from_row(row: &Row) -> Option<BenchmarkRecord> {
        let text = |idx: usize| -> String {
            row.get(idx)
                .and_then(|v| v.as_text().map(str::to_string))
                .unwrap_or_default()
        };
        let float = |idx: usize| row.get(idx).and_then(Value::as_float);
        Some(BenchmarkRecord {
            state: text(0),
            year_month: text(1),
            code_type: text(2),
            code: text(3),
            benchmark_type: BenchmarkType::parse(&text(4))?,
            national_rate: float(5),
            stateavg_rate: float(6),
            work_rvu: float(7),
            practice_expense_rvu: float(8),
            malpractice_rvu: float(9),
            work_gpci: float(10),
            pe_gpci: float(11),
            mp_gpci: float(12),
            conversion_factor: float(13),
            relative_weight: float(14),
            state_wage_index: float(15),
            adjustment_factor: float(16),
        })
    }
}

/// Loaded reference data plus year constants; all benchmark computation is a
/// pure function of this state.
#[derive(Debug)]
pub struct BenchmarkEngine {
    constants: YearConstants,
    professional: ProfessionalReference,
    facility: FacilityReference,
}

impl BenchmarkEngine {
    /// Load both reference databases once. Absent files or missing tables are
    /// fatal; no partial state is returned.
    pub fn load(
        prof_db: &Path,
        facility_db: &Path,
        constants: YearConstants,
    ) -> Result<BenchmarkEngine> {
        let professional = load_professional(prof_db, constants.year)?;
        let facility = load_facility(facility_db)?;
        Ok(BenchmarkEngine {
            constants,
            professional,
            facility,
        })
    }

    pub fn constants(&self) -> &YearConstants {
        &self.constants
    }

    fn locality_state(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = HashMap::new();
        for meta in &self.professional.locality_meta {
            if let Some(state) = state_prefix(&meta.state_name) {
                map.entry(meta.locality_code.clone()).or_insert(state);
            }
        }
        map
    }

    fn state_gpci_averages(&self) -> HashMap<String, GpciAverages> {
        let locality_state = self.locality_state();
        let mut acc: HashMap<String, (Mean, Mean, Mean)> = HashMap::new();
        for row in &self.professional.gpci {
            let Some(state) = locality_state.get(&row.locality_code) else {
                continue;
            };
            let entry = acc.entry(state.clone()).or_default();
            if let Some(v) = row.work_gpci {
                entry.0.push(v);
            }
            if let Some(v) = row.pe_gpci {
                entry.1.push(v);
            }
            if let Some(v) = row.mp_gpci {
                entry.2.push(v);
            }
        }
        acc.into_iter()
            .map(|(state, (work, pe, mp))| {
                (
                    state,
                    GpciAverages {
                        work: work.value(),
                        pe: pe.value(),
                        mp: mp.value(),
                    },
                )
            })
            .collect()
    }

    fn national_gpci_averages(&self) -> GpciAverages {
        let mut work = Mean::default();
        let mut pe = Mean::default();
        let mut mp = Mean::default();
        for row in &self.professional.gpci {
            if let Some(v) = row.work_gpci {
                work.push(v);
            }
            if let Some(v) = row.pe_gpci {
                pe.push(v);
            }
            if let Some(v) = row.mp_gpci {
                mp.push(v);
            }
        }
        GpciAverages {
            work: work.value(),
            pe: pe.value(),
            mp: mp.value(),
        }
    }

    /// Non-rural state-averaged wage indices, keyed by two-letter state. With
    /// no wage-index column in the source, every state averages to 1.0.
    fn state_wage_index_averages(&self) -> HashMap<String, Option<f64>> {
        let mut acc: HashMap<String, Mean> = HashMap::new();
        let mut states: BTreeSet<String> = BTreeSet::new();
        for row in &self.facility.wage_index {
            if cbsa5(&row.cbsa).is_none() || row.state.is_empty() {
                continue;
            }
            if matches!(row.is_rural, Some(flag) if flag != 0.0) {
                continue;
            }
            states.insert(row.state.clone());
            if let Some(wi) = row.wage_index {
                acc.entry(row.state.clone()).or_default().push(wi);
            }
        }
        states
            .into_iter()
            .map(|state| {
                let avg = acc.get(&state).copied().and_then(Mean::value);
                (state, avg.or(Some(1.0)))
            })
            .collect()
    }

    fn professional_states(&self) -> Vec<String> {
        let states: BTreeSet<String> = self
            .professional
            .locality_meta
            .iter()
            .filter_map(|meta| state_prefix(&meta.state_name))
            .collect();
        states.into_iter().collect()
    }

    fn facility_states(&self) -> Vec<String> {
        let states: BTreeSet<String> = self
            .facility
            .wage_index
            .iter()
            .map(|row| row.state.clone())
            .filter(|s| !s.is_empty())
            .collect();
        states.into_iter().collect()
    }

    fn professional_rate(&self, rvu: &RvuRow, gpci: &GpciAverages) -> f64 {
        let work = rvu.work_rvu.unwrap_or(0.0);
        let pe = rvu.practice_expense_rvu.unwrap_or(0.0);
        let mp = rvu.malpractice_rvu.unwrap_or(0.0);
        (work * gpci.work_or_neutral() + pe * gpci.pe_or_neutral() + mp * gpci.mp_or_neutral())
            * self.professional.conversion_factor
    }

    /// Professional benchmarks for the full cross product of states and
    /// procedure codes: national (mean of all localities' indices) and
    /// state-averaged variants.
    pub fn professional_benchmarks(&self) -> Vec<BenchmarkRecord> {
        let year_month = self.constants.year_month();
        let states = self.professional_states();
        let state_gpci = self.state_gpci_averages();
        let national_gpci = self.national_gpci_averages();

        let mut records = Vec::with_capacity(states.len() * self.professional.rvu.len());
        for state in &states {
            let gpci = state_gpci.get(state).copied().unwrap_or_default();
            for rvu in &self.professional.rvu {
                let mut record = BenchmarkRecord::blank(
                    state,
                    &year_month,
                    "CPT",
                    &rvu.procedure_code,
                    BenchmarkType::Professional,
                );
                record.national_rate = Some(self.professional_rate(rvu, &national_gpci));
                record.stateavg_rate = Some(self.professional_rate(rvu, &gpci));
                record.work_rvu = rvu.work_rvu;
                record.practice_expense_rvu = rvu.practice_expense_rvu;
                record.malpractice_rvu = rvu.malpractice_rvu;
                record.work_gpci = gpci.work;
                record.pe_gpci = gpci.pe;
                record.mp_gpci = gpci.mp;
                record.conversion_factor = Some(self.professional.conversion_factor);
                records.push(record);
            }
        }
        info!(rows = records.len(), "professional benchmarks computed");
        records
    }

    /// OPPS benchmarks: `national = relative_weight × OPPS conversion
    /// factor`, state-averaged via the wage-index-adjusted labor share.
    pub fn opps_benchmarks(&self) -> Vec<BenchmarkRecord> {
        let year_month = self.constants.year_month();
        let states = self.facility_states();
        let state_wi = self.state_wage_index_averages();

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let codes: Vec<&OppsRow> = self
            .facility
            .opps
            .iter()
            .filter(|row| seen.insert(row.hcpcs.as_str()))
            .collect();

        let mut records = Vec::with_capacity(states.len() * codes.len());
        for state in &states {
            let wage_index = state_wi.get(state).copied().flatten();
            for opps in &codes {
                let mut record = BenchmarkRecord::blank(
                    state,
                    &year_month,
                    "HCPCS",
                    &opps.hcpcs,
                    BenchmarkType::Opps,
                );
                record.relative_weight = opps.relative_weight;
                record.state_wage_index = wage_index;
                record.national_rate = opps
                    .relative_weight
                    .map(|wt| wt * self.constants.opps_conversion_factor);
                record.adjustment_factor = wage_index.map(|wi| {
                    self.constants.opps_labor_share * wi + (1.0 - self.constants.opps_labor_share)
                });
                record.stateavg_rate = match (record.national_rate, record.adjustment_factor) {
                    (Some(national), Some(adj)) => Some(national * adj),
                    _ => None,
                };
                records.push(record);
            }
        }
        info!(rows = records.len(), "opps benchmarks computed");
        records
    }

    /// ASC benchmarks: the national figure is the published dollar rate; the
    /// state-averaged variant applies the ASC labor share to the wage index.
    pub fn asc_benchmarks(&self) -> Vec<BenchmarkRecord> {
        let year_month = self.constants.year_month();
        let states = self.facility_states();
        let state_wi = self.state_wage_index_averages();

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let codes: Vec<&AscRow> = self
            .facility
            .asc
            .iter()
            .filter(|row| seen.insert(row.hcpcs.as_str()))
            .collect();

        let mut records = Vec::with_capacity(states.len() * codes.len());
        for state in &states {
            let wage_index = state_wi.get(state).copied().flatten();
            for asc in &codes {
                let mut record = BenchmarkRecord::blank(
                    state,
                    &year_month,
                    "CPT",
                    &asc.hcpcs,
                    BenchmarkType::Asc,
                );
                record.state_wage_index = wage_index;
                record.national_rate = asc.national_rate;
                record.adjustment_factor = wage_index.map(|wi| {
                    self.constants.asc_labor_share * wi + (1.0 - self.constants.asc_labor_share)
                });
                record.stateavg_rate = match (record.national_rate, record.adjustment_factor) {
                    (Some(national), Some(adj)) => Some(national * adj),
                    _ => None,
                };
                records.push(record);
            }
        }
        info!(rows = records.len(), "asc benchmarks computed");
        records
    }

    /// Professional rate for one (zip, code) pair: zip → carrier/locality →
    /// fee schedule area → locality GPCI → RVU × GPCI × CF. Any broken link
    /// in that chain yields `None`.
    pub fn professional_rate_for_zip(&self, zip: &str, code: &str) -> Option<f64> {
        let zip = normalize::zip5(zip)?;
        let code = normalize::normalize_code(code);

        let mloc = self
            .professional
            .locality_map
            .iter()
            .find(|row| row.zip_code == zip)?;
        let meta = self.professional.locality_meta.iter().find(|row| {
            row.mac_code == mloc.carrier_code && row.locality_code == mloc.locality_code
        })?;
        let gpci = self.professional.gpci.iter().find(|row| {
            row.locality_name == meta.fee_schedule_area
                && row.locality_code == mloc.locality_code
        })?;
        let rvu = self
            .professional
            .rvu
            .iter()
            .find(|row| row.procedure_code == code)?;

        let gpci = GpciAverages {
            work: gpci.work_gpci,
            pe: gpci.pe_gpci,
            mp: gpci.mp_gpci,
        };
        Some(self.professional_rate(rvu, &gpci))
    }

    /// Wage index for one zip via the zip→CBSA crosswalk; the mean when a
    /// CBSA carries multiple wage-index rows.
    pub fn wage_index_for_zip(&self, zip: &str) -> Option<f64> {
        let zip = normalize::zip5(zip)?;
        let cbsa = self.facility.zip_cbsa.get(&zip)?;
        let target = cbsa5(cbsa).unwrap_or_else(|| cbsa.clone());
        let mut mean = Mean::default();
        for row in &self.facility.wage_index {
            if cbsa5(&row.cbsa).as_deref() == Some(target.as_str()) {
                if let Some(wi) = row.wage_index {
                    mean.push(wi);
                }
            }
        }
        mean.value()
    }
}

/// The built benchmark tables, indexable for fact annotation.
#[derive(Debug, Default)]
pub struct BenchmarkTables {
    records: Vec<BenchmarkRecord>,
    index: HashMap<(BenchmarkType, String, String, String, String), usize>,
}

impl BenchmarkTables {
    pub fn build(engine: &BenchmarkEngine) -> BenchmarkTables {
        let mut records = engine.professional_benchmarks();
        records.extend(engine.opps_benchmarks());
        records.extend(engine.asc_benchmarks());
        BenchmarkTables::from_records(records)
    }

    pub fn from_records(records: Vec<BenchmarkRecord>) -> BenchmarkTables {
        let mut index = HashMap::with_capacity(records.len());
        for (pos, record) in records.iter().enumerate() {
            index.insert(
                (
                    record.benchmark_type,
                    record.state.clone(),
                    record.year_month.clone(),
                    record.code_type.clone(),
                    normalize::normalize_code(&record.code),
                ),
                pos,
            );
        }
        BenchmarkTables { records, index }
    }

    pub fn records(&self) -> &[BenchmarkRecord] {
        &self.records
    }

    pub fn lookup(
        &self,
        benchmark_type: BenchmarkType,
        state: &str,
        year_month: &str,
        code_type: &str,
        code: &str,
    ) -> Option<&BenchmarkRecord> {
        let key = (
            benchmark_type,
            state.to_string(),
            year_month.to_string(),
            code_type.to_string(),
            normalize::normalize_code(code),
        );
        self.index.get(&key).map(|&pos| &self.records[pos])
    }

    fn table_path(dir: &Path, benchmark_type: BenchmarkType) -> std::path::PathBuf {
        dir.join(format!("bench_medicare_{}.parquet", benchmark_type.as_str()))
    }

    /// Write the three per-type tables plus the unioned comprehensive table.
    pub fn write(&self, dir: &Path) -> Result<()> {
        for benchmark_type in [
            BenchmarkType::Professional,
            BenchmarkType::Opps,
            BenchmarkType::Asc,
        ] {
            let rows: Vec<Row> = self
                .records
                .iter()
                .filter(|r| r.benchmark_type == benchmark_type)
                .map(BenchmarkRecord::to_row)
                .collect();
            store::write_table(
                &Self::table_path(dir, benchmark_type),
                BENCHMARK_COLUMNS,
                &rows,
            )?;
        }
        let all: Vec<Row> = self.records.iter().map(BenchmarkRecord::to_row).collect();
        store::write_table(
            &dir.join("bench_medicare_comprehensive.parquet"),
            BENCHMARK_COLUMNS,
            &all,
        )?;
        info!(rows = self.records.len(), dir = %dir.display(), "benchmark tables written");
        Ok(())
    }

    /// Load previously written tables back from the comprehensive file.
    pub fn load(dir: &Path) -> Result<BenchmarkTables> {
        let path = dir.join("bench_medicare_comprehensive.parquet");
        let rows = store::read_table(&path, BENCHMARK_COLUMNS)?;
        let records: Vec<BenchmarkRecord> =
            rows.iter().filter_map(BenchmarkRecord::from_row).collect();
        Ok(BenchmarkTables::from_records(records))
    }
}

/// A fact row joined against the benchmark tables.
#[derive(Debug, Clone)]
pub struct AnnotatedFact {
    pub fact: FactRecord,
    pub medicare_prof_national: Option<f64>,
    pub medicare_prof_stateavg: Option<f64>,
    pub pct_of_medicare: Option<f64>,
    pub medicare_opps_national: Option<f64>,
    pub medicare_opps_stateavg: Option<f64>,
    pub pct_of_medicare_opps: Option<f64>,
    pub medicare_asc_national: Option<f64>,
    pub medicare_asc_stateavg: Option<f64>,
    pub pct_of_medicare_asc: Option<f64>,
}

fn pct_of(rate: Option<f64>, benchmark: Option<f64>) -> Option<f64> {
    match (rate, benchmark) {
        (Some(rate), Some(benchmark)) if benchmark > 0.0 => Some(rate / benchmark),
        _ => None,
    }
}

/// Annotate fact rows with benchmark columns. Professional lines join the
/// professional table; institutional lines join both facility tables.
/// Unmatched rows pass through with null benchmark columns.
pub fn annotate_facts(facts: &[FactRecord], tables: &BenchmarkTables) -> Vec<AnnotatedFact> {
    facts
        .iter()
        .map(|fact| {
            let mut annotated = AnnotatedFact {
                fact: fact.clone(),
                medicare_prof_national: None,
                medicare_prof_stateavg: None,
                pct_of_medicare: None,
                medicare_opps_national: None,
                medicare_opps_stateavg: None,
                pct_of_medicare_opps: None,
                medicare_asc_national: None,
                medicare_asc_stateavg: None,
                pct_of_medicare_asc: None,
            };
            match fact.billing_class.as_str() {
                "professional" => {
                    if let Some(bench) = tables.lookup(
                        BenchmarkType::Professional,
                        &fact.state,
                        &fact.year_month,
                        &fact.code_type,
                        &fact.code,
                    ) {
                        annotated.medicare_prof_national = bench.national_rate;
                        annotated.medicare_prof_stateavg = bench.stateavg_rate;
                        annotated.pct_of_medicare =
                            pct_of(fact.negotiated_rate, bench.stateavg_rate);
                    }
                }
                "institutional" => {
                    if let Some(bench) = tables.lookup(
                        BenchmarkType::Opps,
                        &fact.state,
                        &fact.year_month,
                        &fact.code_type,
                        &fact.code,
                    ) {
                        annotated.medicare_opps_national = bench.national_rate;
                        annotated.medicare_opps_stateavg = bench.stateavg_rate;
                        annotated.pct_of_medicare_opps =
                            pct_of(fact.negotiated_rate, bench.stateavg_rate);
                    }
                    if let Some(bench) = tables.lookup(
                        BenchmarkType::Asc,
                        &fact.state,
                        &fact.year_month,
                        &fact.code_type,
                        &fact.code,
                    ) {
                        annotated.medicare_asc_national = bench.national_rate;
                        annotated.medicare_asc_stateavg = bench.stateavg_rate;
                        annotated.pct_of_medicare_asc =
                            pct_of(fact.negotiated_rate, bench.stateavg_rate);
                    }
                }
                _ => {}
            }
            annotated
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_constants_are_cy2025() {
        let constants = YearConstants::default();
        assert_eq!(constants.year, 2025);
        assert_eq!(constants.opps_conversion_factor, 89.169);
        assert_eq!(constants.asc_conversion_factor, 54.895);
        assert_eq!(constants.opps_labor_share, 0.60);
        assert_eq!(constants.asc_labor_share, 0.50);
        assert_eq!(constants.year_month(), "2025-01");
    }

    #[test]
    fn constants_deserialize_with_partial_overrides() {
        let constants: YearConstants =
            serde_json::from_str(r#"{"year": 2026, "opps_conversion_factor": 91.0}"#).unwrap();
        assert_eq!(constants.year, 2026);
        assert_eq!(constants.opps_conversion_factor, 91.0);
        assert_eq!(constants.asc_labor_share, 0.50);
    }

    #[test]
    fn state_prefix_requires_two_uppercase_letters() {
        assert_eq!(state_prefix(" AL BIRMINGHAM "), Some("AL".to_string()));
        assert_eq!(state_prefix("GEORGIA"), Some("GE".to_string()));
        assert_eq!(state_prefix("rest of state"), None);
        assert_eq!(state_prefix(""), None);
    }

    #[test]
    fn cbsa5_extracts_embedded_digits() {
        assert_eq!(cbsa5("12060"), Some("12060".to_string()));
        assert_eq!(cbsa5("CBSA 12060.0"), Some("12060".to_string()));
        assert_eq!(cbsa5("rural"), None);
    }

    #[test]
    fn pct_of_guards_zero_benchmark() {
        assert_eq!(pct_of(Some(50.0), Some(100.0)), Some(0.5));
        assert_eq!(pct_of(Some(50.0), Some(0.0)), None);
        assert_eq!(pct_of(None, Some(100.0)), None);
    }
}
