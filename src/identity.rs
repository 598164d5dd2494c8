use sha2::{Digest, Sha256};

/// Canonical member used to derive the id of the empty/unknown POS set, so
/// every producer of an empty set lands on the same dimension row.
pub const EMPTY_POS_SET_MEMBER: &str = "none";

/// Digest a tuple of natural-key fields into a stable lower-hex identifier.
///
/// Fields are joined with `|` before hashing so `("ab","c")` and `("a","bc")`
/// cannot collide. Callers are expected to have coerced nulls to `""`.
pub fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            hasher.update([b'|']);
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn co(value: Option<&str>) -> &str {
    value.unwrap_or("")
}

/// Identity of one ingest execution for a (payer, period, extract version).
pub fn batch_id(payer_slug: &str, year_month: &str, version: &str) -> String {
    digest(&[payer_slug, year_month, version])
}

/// Identity of a provider group within a batch. `raw_group_id` is whichever
/// upstream group identifier was present (group id preferred over reference
/// id), already coalesced by the caller.
pub fn provider_group_uid(batch_id: &str, raw_group_id: Option<&str>) -> String {
    digest(&[batch_id, co(raw_group_id)])
}

/// Identity of a normalized place-of-service set. Members must already be
/// sorted and deduplicated; the empty set maps to one canonical id.
pub fn pos_set_id(members: &[String]) -> String {
    if members.is_empty() {
        return digest(&[EMPTY_POS_SET_MEMBER]);
    }
    let parts: Vec<&str> = members.iter().map(String::as_str).collect();
    digest(&parts)
}

/// Render a negotiated rate at fixed four-decimal precision for hashing, so
/// float representation noise cannot split one logical row into two ids.
pub fn rate_hash_key(rate: Option<f64>) -> String {
    match rate {
        Some(value) => format!("{value:.4}"),
        None => String::new(),
    }
}

/// Natural key of one priced fact row, in the fixed field order the fact
/// identity is minted from.
#[derive(Debug, Clone, Default)]
pub struct FactKey<'a> {
    pub state: &'a str,
    pub year_month: &'a str,
    pub payer_slug: &'a str,
    pub billing_class: &'a str,
    pub code_type: &'a str,
    pub code: &'a str,
    pub pg_uid: &'a str,
    pub pos_set_id: &'a str,
    pub negotiated_type: &'a str,
    pub negotiation_arrangement: &'a str,
    pub expiration_date: &'a str,
    pub negotiated_rate: Option<f64>,
    pub provider_group_id_raw: &'a str,
}

/// Deterministic id for one fact row. The rate participates in the hash, so a
/// rate change for an otherwise-identical key mints a new row (history is
/// preserved rather than updated in place).
pub fn fact_uid(key: &FactKey<'_>) -> String {
    let rate = rate_hash_key(key.negotiated_rate);
    digest(&[
        key.state,
        key.year_month,
        key.payer_slug,
        key.billing_class,
        key.code_type,
        key.code,
        key.pg_uid,
        key.pos_set_id,
        key.negotiated_type,
        key.negotiation_arrangement,
        key.expiration_date,
        &rate,
        key.provider_group_id_raw,
    ])
}
