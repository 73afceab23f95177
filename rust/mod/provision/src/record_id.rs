//! Record id lexical check.
//!
//! Org record ids are 15 (case-sensitive) or 18 (case-insensitive) ASCII
//! alphanumeric characters. Anything else never reaches a query string.

const SHORT_LEN: usize = 15;
const LONG_LEN: usize = 18;

/// Return the id unchanged if it is well formed, `None` otherwise.
pub fn sanitize(id: &str) -> Option<&str> {
    let well_formed = matches!(id.len(), SHORT_LEN | LONG_LEN)
        && id.bytes().all(|b| b.is_ascii_alphanumeric());
    well_formed.then_some(id)
}

/// Identity of a well-formed id: its case-sensitive 15-character prefix.
///
/// The 3-character suffix of an 18-character id is a case-insensitive
/// checksum of the prefix, so `key` is equal for both forms of one record.
pub fn key(id: &str) -> &str {
    id.get(..SHORT_LEN).unwrap_or(id)
}

/// Whether `a` and `b` name the same record.
pub fn same_record(a: &str, b: &str) -> bool {
    key(a) == key(b)
}

/// Split ids into (accepted, rejected), keeping order and dropping
/// ids that name an already accepted record.
pub fn partition(ids: &[String]) -> (Vec<String>, Vec<String>) {
    let mut accepted: Vec<String> = Vec::with_capacity(ids.len());
    let mut rejected = Vec::new();
    for id in ids {
        match sanitize(id) {
            Some(ok) if !accepted.iter().any(|a| same_record(a, ok)) => {
                accepted.push(ok.to_string())
            }
            Some(_) => {}
            None => rejected.push(id.clone()),
        }
    }
    (accepted, rejected)
}
