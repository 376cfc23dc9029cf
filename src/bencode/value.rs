use std::collections::BTreeMap;

/// A decoded bencode value. Dictionary keys are raw byte strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    String(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Non-negative integers only; lengths, counts and intervals are never negative
    pub fn as_u64(&self) -> Option<u64> {
        self.as_integer().and_then(|i| u64::try_from(i).ok())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_dict(&self) -> bool {
        matches!(self, BencodeValue::Dict(_))
    }

    /// Get a value from a dictionary by key
    pub fn dict_get(&self, key: &[u8]) -> Option<&BencodeValue> {
        match self {
            BencodeValue::Dict(d) => d.get(key),
            _ => None,
        }
    }

    pub fn dict_get_str(&self, key: &[u8]) -> Option<&str> {
        self.dict_get(key)?.as_str()
    }

    pub fn dict_get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.dict_get(key)?.as_bytes()
    }

    pub fn dict_get_u64(&self, key: &[u8]) -> Option<u64> {
        self.dict_get(key)?.as_u64()
    }
}
