//! Incremental warehouse build engine for healthcare price-transparency
//! extracts, plus the Medicare benchmark rate engine.
//!
//! Batches of negotiated rates and provider-group rosters are normalized,
//! stamped with content-addressable identities, and folded into a
//! Parquet-backed dimensional store (append-unique dims/xrefs, partitioned
//! fact table with idempotent upserts). Government reference tables (RVUs,
//! GPCIs, OPPS weights, ASC fees, wage indices) feed benchmark tables that
//! priced fact rows can be annotated against.

pub mod batch;
pub mod dims;
pub mod fact;
pub mod identity;
pub mod medicare;
pub mod normalize;
pub mod store;
pub mod warehouse;

pub use batch::{
    BatchOptions, NormalizedRatesBatch, NormalizedRosterBatch, RatesRecord, RosterRecord,
    normalize_rates_batch, normalize_roster_batch, read_rates_csv, read_rates_parquet,
    read_roster_csv, read_roster_parquet,
};
pub use fact::{FactRecord, UpsertSummary, upsert_facts};
pub use medicare::{
    AnnotatedFact, BenchmarkEngine, BenchmarkRecord, BenchmarkTables, BenchmarkType,
    YearConstants, annotate_facts,
};
pub use warehouse::{IngestSummary, RosterIngestSummary, Warehouse};
