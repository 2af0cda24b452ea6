//! Store key layout.
//!
//! Everything lives under one configurable prefix:
//! - `<prefix>/index`            — the global index counter
//! - `<prefix>/propose`          — the propose lock
//! - `<prefix>/requests/<id>`    — one key per committed lock request
//! - `<prefix>/services/<id>`    — one leased key per live service
//!
//! Request ids are zero-padded so lexicographic key order matches numeric
//! order.

/// Derives and parses the store keys used by the protocol.
#[derive(Clone, Debug)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Prefix covering every protocol key; the replication watcher watches
    /// this so request and service events share one total order.
    pub fn root_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn index_key(&self) -> String {
        format!("{}/index", self.prefix)
    }

    pub fn propose_lock_key(&self) -> String {
        format!("{}/propose", self.prefix)
    }

    pub fn request_prefix(&self) -> String {
        format!("{}/requests/", self.prefix)
    }

    pub fn request_key(&self, id: u64) -> String {
        format!("{}{:020}", self.request_prefix(), id)
    }

    pub fn service_prefix(&self) -> String {
        format!("{}/services/", self.prefix)
    }

    pub fn service_key(&self, service_id: &str) -> String {
        format!("{}{}", self.service_prefix(), service_id)
    }

    /// Extract the request id from a request key, if it is one.
    pub fn parse_request_key(&self, key: &str) -> Option<u64> {
        key.strip_prefix(&self.request_prefix())?.parse().ok()
    }

    /// Extract the service id from a service key, if it is one.
    pub fn parse_service_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let id = key.strip_prefix(&self.service_prefix())?;
        (!id.is_empty()).then_some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        let keys = KeyLayout::new("/lockstep");
        assert_eq!(keys.index_key(), "/lockstep/index");
        assert_eq!(keys.propose_lock_key(), "/lockstep/propose");
        assert_eq!(
            keys.request_key(5),
            "/lockstep/requests/00000000000000000005"
        );
        assert_eq!(keys.service_key("abc"), "/lockstep/services/abc");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let keys = KeyLayout::new("/lockstep/");
        assert_eq!(keys.index_key(), "/lockstep/index");
    }

    #[test]
    fn test_request_key_order_matches_numeric_order() {
        let keys = KeyLayout::new("/lockstep");
        assert!(keys.request_key(9) < keys.request_key(10));
        assert!(keys.request_key(99) < keys.request_key(100));
    }

    #[test]
    fn test_parse_request_key() {
        let keys = KeyLayout::new("/lockstep");
        assert_eq!(keys.parse_request_key(&keys.request_key(42)), Some(42));
        assert_eq!(keys.parse_request_key("/lockstep/index"), None);
        assert_eq!(keys.parse_request_key("/lockstep/services/x"), None);
    }

    #[test]
    fn test_parse_service_key() {
        let keys = KeyLayout::new("/lockstep");
        assert_eq!(
            keys.parse_service_key("/lockstep/services/svc-1"),
            Some("svc-1")
        );
        assert_eq!(keys.parse_service_key("/lockstep/requests/1"), None);
        assert_eq!(keys.parse_service_key("/lockstep/services/"), None);
    }
}
