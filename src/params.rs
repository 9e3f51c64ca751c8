use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single gateway parameter value. The gateway only ever sees text, but
/// amounts are carried as integers until serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(n) => write!(f, "{}", n),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Integer(n)
    }
}

impl From<u64> for ParamValue {
    fn from(n: u64) -> Self {
        match i64::try_from(n) {
            Ok(n) => ParamValue::Integer(n),
            Err(_) => ParamValue::Text(n.to_string()),
        }
    }
}

/// Unordered input to the canonicalizer. Keys are unique by construction.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// Ordered, unique-key sequence of rendered `(key, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    pairs: Vec<(String, String)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Appends a pair, replacing the value in place if the key already exists.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    /// Query string for the gateway redirect. Values are not percent-encoded,
    /// matching what was signed.
    pub fn to_query_string(&self) -> String {
        serialize(self)
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.pairs.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a (String, String);
    type IntoIter = std::slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

impl From<&ParameterSet> for ParamMap {
    fn from(set: &ParameterSet) -> Self {
        set.iter()
            .map(|(k, v)| (k.to_string(), ParamValue::Text(v.to_string())))
            .collect()
    }
}

/// Sort parameters by key in byte order and render every value as text.
///
/// The result is independent of the input's iteration order and running it
/// over an already canonical set is a no-op.
pub fn canonicalize<'a, I, V>(params: I) -> ParameterSet
where
    I: IntoIterator<Item = (&'a String, V)>,
    V: fmt::Display,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    // `str` ordering is byte-wise, never locale-aware.
    pairs.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    pairs.dedup_by(|a, b| a.0 == b.0);
    ParameterSet { pairs }
}

/// `k1=v1&k2=v2...` with values copied verbatim.
///
/// Must not percent-encode: the gateway hashes the raw values and any
/// escaping here produces signatures it rejects.
pub fn serialize(set: &ParameterSet) -> String {
    let mut out = String::new();
    for (i, (k, v)) in set.pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamMap {
        let mut p = ParamMap::new();
        p.insert("vnp_TxnRef".into(), "070155".into());
        p.insert("vnp_Amount".into(), 1_000_000i64.into());
        p.insert("vnp_Locale".into(), "vn".into());
        p
    }

    #[test]
    fn sorts_by_byte_order() {
        let mut p = ParamMap::new();
        p.insert("b".into(), "1".into());
        p.insert("B".into(), "2".into());
        p.insert("a".into(), "3".into());
        let set = canonicalize(&p);
        let keys: Vec<&str> = set.iter().map(|(k, _)| k).collect();
        // Uppercase sorts before lowercase in ordinal comparison.
        assert_eq!(keys, vec!["B", "a", "b"]);
    }

    #[test]
    fn renders_integers_as_decimal() {
        let set = canonicalize(&sample());
        assert_eq!(set.get("vnp_Amount"), Some("1000000"));
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let once = canonicalize(&sample());
        let twice = canonicalize(&ParamMap::from(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn order_independent_from_unsorted_source() {
        let a = vec![
            ("z".to_string(), "1"),
            ("m".to_string(), "2"),
            ("a".to_string(), "3"),
        ];
        let b = vec![
            ("a".to_string(), "3"),
            ("z".to_string(), "1"),
            ("m".to_string(), "2"),
        ];
        let ca = canonicalize(a.iter().map(|(k, v)| (k, v)));
        let cb = canonicalize(b.iter().map(|(k, v)| (k, v)));
        assert_eq!(ca, cb);
    }

    #[test]
    fn serialize_does_not_escape() {
        let mut p = ParamMap::new();
        p.insert("vnp_OrderInfo".into(), "Thanh toan don hang test".into());
        p.insert("vnp_ReturnUrl".into(), "https://example.com/return?a=1&b=2".into());
        let s = serialize(&canonicalize(&p));
        assert_eq!(
            s,
            "vnp_OrderInfo=Thanh toan don hang test&vnp_ReturnUrl=https://example.com/return?a=1&b=2"
        );
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let set = canonicalize(&ParamMap::new());
        assert!(set.is_empty());
        assert_eq!(serialize(&set), "");
    }

    #[test]
    fn push_replaces_existing_value() {
        let mut set = ParameterSet::new();
        set.push("a", "1");
        set.push("a", "2");
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("a"), Some("2"));
    }
}
