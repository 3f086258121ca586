//! Identifier issuance.
//!
//! `job_id` is deterministic over `(wo_no, line, issuance timestamp)` and is
//! minted exactly once per job directory; it never changes afterwards. If the
//! derivation scheme changes, bump [`JOB_ID_VERSION`]; ids across versions
//! are not comparable.
//!
//! `run_id` is a fresh random 128-bit identifier per pipeline attempt. It is
//! recorded in the run record and in trash bucket names, never in `job.json`.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Version of the job id derivation scheme.
pub const JOB_ID_VERSION: u32 = 1;

/// Maximum sanitized length of each identity component inside a job id.
const MAX_ID_COMPONENT_LEN: usize = 20;

/// Derives a job id from the identity tuple and an issuance timestamp.
///
/// Format: `JOB-<wo>-<line>-<hex8>` where `<hex8>` is the first 8 hex chars
/// of `SHA-256("<wo_no>:<line>:<issued_at_nanos>")`. The sanitized components
/// keep the id filesystem-safe; uniqueness rides on the hash suffix.
#[must_use]
pub fn derive_job_id(wo_no: &str, line: &str, issued_at_nanos: i128) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wo_no.as_bytes());
    hasher.update(b":");
    hasher.update(line.as_bytes());
    hasher.update(b":");
    hasher.update(issued_at_nanos.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex8: String = digest
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect();

    format!(
        "JOB-{}-{}-{hex8}",
        sanitize_component(wo_no),
        sanitize_component(line)
    )
}

/// Issues a fresh run id: 128 random bits as 32 hex chars.
#[must_use]
pub fn generate_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Prefix of a run id used in log file names.
#[must_use]
pub fn run_id_prefix(run_id: &str) -> &str {
    &run_id[..run_id.len().min(12)]
}

/// Keeps ASCII alphanumerics, maps separator characters to `_`, drops the
/// rest (including non-ASCII), and bounds the length.
fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_sep = true;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if (c == ' ' || c == '_' || c == '-') && !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_end_matches('_');
    let bounded: String = trimmed.chars().take(MAX_ID_COMPONENT_LEN).collect();
    if bounded.is_empty() {
        "UNKNOWN".to_string()
    } else {
        bounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_deterministic() {
        let a = derive_job_id("WO-001", "L1", 1_700_000_000_000_000_000);
        let b = derive_job_id("WO-001", "L1", 1_700_000_000_000_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_job_id_varies_with_identity_and_time() {
        let base = derive_job_id("WO-001", "L1", 1);
        assert_ne!(base, derive_job_id("WO-002", "L1", 1));
        assert_ne!(base, derive_job_id("WO-001", "L2", 1));
        assert_ne!(base, derive_job_id("WO-001", "L1", 2));
    }

    #[test]
    fn test_job_id_shape() {
        let id = derive_job_id("WO-001", "L1", 42);
        assert!(id.starts_with("JOB-WO_001-L1-"));
        let suffix = id.rsplit('-').next().expect("suffix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sanitize_drops_non_ascii_and_bounds_length() {
        assert_eq!(sanitize_component("라인 A"), "A");
        assert_eq!(sanitize_component(""), "UNKNOWN");
        let long = "x".repeat(50);
        assert_eq!(sanitize_component(&long).len(), MAX_ID_COMPONENT_LEN);
    }

    #[test]
    fn test_run_ids_unique_and_hex() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(run_id_prefix(&a).len(), 12);
    }
}
