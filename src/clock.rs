//! Monotonic time source and fingerprint hashing (spec §4.8, §9).

use sha2::{Digest, Sha256};

/// UTC wall time acquired once per event, used for `occurredAt` and for the
/// fingerprint hash below.
pub fn now_utc() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// A 16-hex-char prefix of a cryptographic hash of
/// `orderCode || '\x1f' || upc || '\x1f' || occurredAtRFC3339 || '\x1f' || stationId`,
/// used by the MES to deduplicate increments (idempotent upload, §4.5).
pub fn fingerprint(
    order_code: &str,
    upc: &str,
    occurred_at: &chrono::DateTime<chrono::Utc>,
    station_id: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(order_code.as_bytes());
    hasher.update([0x1f]);
    hasher.update(upc.as_bytes());
    hasher.update([0x1f]);
    hasher.update(occurred_at.to_rfc3339().as_bytes());
    hasher.update([0x1f]);
    hasher.update(station_id.to_string().as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in bytes {
        if out.len() >= len {
            break;
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_sixteen_hex_chars() {
        let ts = chrono::Utc::now();
        let fp = fingerprint("OF-100", "012345678905", &ts, 7);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_deterministic_for_same_inputs() {
        let ts = chrono::Utc::now();
        let a = fingerprint("OF-100", "012345678905", &ts, 7);
        let b = fingerprint("OF-100", "012345678905", &ts, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_when_order_code_differs() {
        let ts = chrono::Utc::now();
        let a = fingerprint("OF-100", "012345678905", &ts, 7);
        let b = fingerprint("OF-101", "012345678905", &ts, 7);
        assert_ne!(a, b);
    }
}
