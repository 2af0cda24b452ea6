//! Timestamp helpers shared across Lockstep components.

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        let ts = current_timestamp_ms();
        // 2020-01-01 in millis; anything running this test is later.
        assert!(ts > 1_577_836_800_000);
    }
}
