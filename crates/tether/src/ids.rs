//! Id and timestamp helpers.
//!
//! All persisted rows are ordered by `(created_at, id)`, so timestamps use a
//! fixed-width RFC3339 form that sorts lexicographically.

use chrono::{SecondsFormat, Utc};
use rand::RngCore;

const ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Current time as an RFC3339 string with microsecond precision.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// New prefixed id, e.g. `ses_f80m2k1q7c3n`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, nanoid::nanoid!(14, &ID_ALPHABET))
}

/// Mint a resume token for an approval gate.
pub fn resume_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("wrf_rt_{}", hex::encode(bytes))
}

/// Token a runner presents when dialing back to the control plane.
pub fn callback_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("cbt_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = now_ts();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_ts();
        assert!(a < b);
    }

    #[test]
    fn ids_carry_prefix_and_are_unique() {
        let a = new_id("msg");
        let b = new_id("msg");
        assert!(a.starts_with("msg_"));
        assert_ne!(a, b);
    }

    #[test]
    fn resume_tokens_are_prefixed_and_distinct() {
        let a = resume_token();
        let b = resume_token();
        assert!(a.starts_with("wrf_rt_"));
        assert_eq!(a.len(), "wrf_rt_".len() + 32);
        assert_ne!(a, b);
    }
}
