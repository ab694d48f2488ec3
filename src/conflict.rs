//! First-come-first-served de-collision of claimed domain names.
//!
//! A device seen for the first time whose domain is already held by another
//! known device is admitted under `"{domain}-{suffix}"`, where the suffix is
//! derived from its own device id. Admitted devices are never renamed to make
//! room for a newcomer, and a known device claiming a name someone else holds
//! keeps the name it already has.

use crate::membership::MembershipTable;

const SUFFIX_LEN: usize = 6;

// Identity schemes produced by `identity::resolve_device_id`.
const ID_SCHEMES: [&str; 3] = ["mac-", "uuid-", "id-"];

/// Short, stable suffix for a device id: the last six alphanumeric
/// characters of the id with its scheme prefix and separators removed.
///
/// `"mac-00:11:22:33:44:55"` becomes `"334455"`.
pub fn short_suffix(device_id: &str) -> String {
    let body = ID_SCHEMES
        .iter()
        .find_map(|scheme| device_id.strip_prefix(scheme))
        .unwrap_or(device_id);

    let clean: Vec<char> = body
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if clean.is_empty() {
        return device_id.to_string();
    }
    let start = clean.len().saturating_sub(SUFFIX_LEN);
    clean[start..].iter().collect()
}

/// Domain under which a heartbeat from `device_id` should be admitted.
pub fn resolve_domain(table: &MembershipTable, device_id: &str, claimed: &str) -> String {
    if !table.has_domain_conflict(claimed, device_id) {
        return claimed.to_string();
    }
    match table.get(device_id) {
        Some(known) => known.domain,
        None => format!("{}-{}", claimed, short_suffix(device_id)),
    }
}
