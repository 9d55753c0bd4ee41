// Notification values, name/value bundles, and key material.
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::xdr;
use crate::{Error, Result};

pub(crate) const TYPE_INT32: u32 = 1;
pub(crate) const TYPE_INT64: u32 = 2;
pub(crate) const TYPE_FLOAT64: u32 = 3;
pub(crate) const TYPE_STRING: u32 = 4;
pub(crate) const TYPE_OPAQUE: u32 = 5;

/// A single attribute value carried in a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Str(String),
    Opaque(Bytes),
}

/// Name/value bundle emitted by publishers and delivered to subscribers.
///
/// A sorted map keeps encodings canonical; attribute order is not part of
/// the protocol.
pub type NameValue = BTreeMap<String, Value>;

pub(crate) fn put_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Int32(v) => {
            buf.put_u32(TYPE_INT32);
            buf.put_i32(*v);
        }
        Value::Int64(v) => {
            buf.put_u32(TYPE_INT64);
            buf.put_i64(*v);
        }
        Value::Float64(v) => {
            buf.put_u32(TYPE_FLOAT64);
            buf.put_f64(*v);
        }
        Value::Str(v) => {
            buf.put_u32(TYPE_STRING);
            xdr::put_string(buf, v);
        }
        Value::Opaque(v) => {
            buf.put_u32(TYPE_OPAQUE);
            xdr::put_opaque(buf, v);
        }
    }
}

pub(crate) fn get_value(buf: &mut Bytes) -> Result<Value> {
    let tag = xdr::get_u32(buf)?;
    match tag {
        TYPE_INT32 => Ok(Value::Int32(xdr::get_i32(buf)?)),
        TYPE_INT64 => Ok(Value::Int64(xdr::get_i64(buf)?)),
        TYPE_FLOAT64 => Ok(Value::Float64(xdr::get_f64(buf)?)),
        TYPE_STRING => Ok(Value::Str(xdr::get_string(buf)?)),
        TYPE_OPAQUE => Ok(Value::Opaque(xdr::get_opaque(buf)?)),
        other => Err(Error::UnknownValueTag(other)),
    }
}

pub(crate) fn put_name_value(buf: &mut BytesMut, nv: &NameValue) {
    buf.put_u32(nv.len() as u32);
    for (name, value) in nv {
        xdr::put_string(buf, name);
        put_value(buf, value);
    }
}

pub(crate) fn get_name_value(buf: &mut Bytes) -> Result<NameValue> {
    let count = xdr::get_u32(buf)?;
    let mut nv = NameValue::new();
    for _ in 0..count {
        let name = xdr::get_string(buf)?;
        let value = get_value(buf)?;
        nv.insert(name, value);
    }
    Ok(nv)
}

pub(crate) fn put_values(buf: &mut BytesMut, values: &[Value]) {
    buf.put_u32(values.len() as u32);
    for value in values {
        put_value(buf, value);
    }
}

pub(crate) fn get_values(buf: &mut Bytes) -> Result<Vec<Value>> {
    let count = xdr::get_u32(buf)?;
    let mut values = Vec::new();
    for _ in 0..count {
        values.push(get_value(buf)?);
    }
    Ok(values)
}

/// A set of opaque key blocks used for access filtering.
///
/// Keys are deduplicated on insert; equality ignores order.
#[derive(Debug, Clone, Default, Eq)]
pub struct Keyset {
    keys: Vec<Bytes>,
}

impl Keyset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let mut keyset = Self::new();
        for key in keys {
            keyset.insert(key.into());
        }
        keyset
    }

    pub fn insert(&mut self, key: Bytes) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        let before = self.keys.len();
        self.keys.retain(|existing| existing.as_ref() != key);
        self.keys.len() != before
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.keys.iter().any(|existing| existing.as_ref() == key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.keys.iter()
    }
}

impl PartialEq for Keyset {
    fn eq(&self, other: &Self) -> bool {
        // Both sides are deduplicated, so mutual containment is set equality.
        self.keys.len() == other.keys.len()
            && self.keys.iter().all(|key| other.contains(key))
    }
}

/// Apply keyset additions and removals. Adding a keyset that is already
/// present or removing one that is not are both no-ops, not errors.
pub fn merge_keysets(existing: &[Keyset], add: &[Keyset], del: &[Keyset]) -> Vec<Keyset> {
    let mut merged: Vec<Keyset> = existing
        .iter()
        .filter(|keyset| !del.contains(keyset))
        .cloned()
        .collect();
    for keyset in add {
        if !merged.contains(keyset) {
            merged.push(keyset.clone());
        }
    }
    merged
}

/// The key-matching relation: producer and consumer key material match when
/// any key block appears on both sides.
pub fn keysets_match(producer: &[Keyset], consumer: &[Keyset]) -> bool {
    producer.iter().any(|keyset| {
        keyset
            .iter()
            .any(|key| consumer.iter().any(|other| other.contains(key)))
    })
}

pub(crate) fn put_keysets(buf: &mut BytesMut, keysets: &[Keyset]) {
    buf.put_u32(keysets.len() as u32);
    for keyset in keysets {
        buf.put_u32(keyset.len() as u32);
        for key in keyset.iter() {
            xdr::put_opaque(buf, key);
        }
    }
}

pub(crate) fn get_keysets(buf: &mut Bytes) -> Result<Vec<Keyset>> {
    let count = xdr::get_u32(buf)?;
    let mut keysets = Vec::new();
    for _ in 0..count {
        let key_count = xdr::get_u32(buf)?;
        let mut keyset = Keyset::new();
        for _ in 0..key_count {
            keyset.insert(xdr::get_opaque(buf)?);
        }
        keysets.push(keyset);
    }
    Ok(keysets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_value_round_trip() {
        let mut nv = NameValue::new();
        nv.insert("count".into(), Value::Int32(-7));
        nv.insert("total".into(), Value::Int64(1 << 40));
        nv.insert("ratio".into(), Value::Float64(0.25));
        nv.insert("who".into(), Value::Str("syrinx".into()));
        nv.insert("blob".into(), Value::Opaque(Bytes::from_static(b"\x00\x01")));

        let mut buf = BytesMut::new();
        put_name_value(&mut buf, &nv);
        let decoded = get_name_value(&mut buf.freeze()).expect("decode");
        assert_eq!(decoded, nv);
    }

    #[test]
    fn keyset_equality_ignores_order() {
        let a = Keyset::from_keys([&b"one"[..], &b"two"[..]]);
        let b = Keyset::from_keys([&b"two"[..], &b"one"[..]]);
        assert_eq!(a, b);
        let c = Keyset::from_keys([&b"one"[..]]);
        assert_ne!(a, c);
    }

    #[test]
    fn keyset_insert_deduplicates() {
        let mut keyset = Keyset::new();
        assert!(keyset.insert(Bytes::from_static(b"k")));
        assert!(!keyset.insert(Bytes::from_static(b"k")));
        assert_eq!(keyset.len(), 1);
        assert!(keyset.remove(b"k"));
        assert!(!keyset.remove(b"k"));
    }

    #[test]
    fn keysets_match_requires_shared_key() {
        let producer = vec![Keyset::from_keys([&b"alpha"[..]])];
        let consumer = vec![
            Keyset::from_keys([&b"beta"[..]]),
            Keyset::from_keys([&b"alpha"[..], &b"gamma"[..]]),
        ];
        assert!(keysets_match(&producer, &consumer));
        assert!(!keysets_match(&producer, &[Keyset::from_keys([&b"beta"[..]])]));
        assert!(!keysets_match(&[], &consumer));
    }

    #[test]
    fn merge_keysets_is_idempotent_on_duplicates() {
        let existing = vec![Keyset::from_keys([&b"one"[..]])];
        let add = vec![
            Keyset::from_keys([&b"one"[..]]),
            Keyset::from_keys([&b"two"[..]]),
        ];
        let merged = merge_keysets(&existing, &add, &[]);
        assert_eq!(merged.len(), 2);
        // Removing a keyset that is not present is a no-op.
        let merged = merge_keysets(&merged, &[], &[Keyset::from_keys([&b"three"[..]])]);
        assert_eq!(merged.len(), 2);
        let merged = merge_keysets(&merged, &[], &[Keyset::from_keys([&b"one"[..]])]);
        assert_eq!(merged, vec![Keyset::from_keys([&b"two"[..]])]);
    }

    #[test]
    fn keysets_round_trip() {
        let keysets = vec![
            Keyset::from_keys([&b"one"[..], &b"two"[..]]),
            Keyset::new(),
        ];
        let mut buf = BytesMut::new();
        put_keysets(&mut buf, &keysets);
        let decoded = get_keysets(&mut buf.freeze()).expect("decode");
        assert_eq!(decoded, keysets);
    }

    #[test]
    fn unknown_value_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(99);
        let err = get_value(&mut buf.freeze()).expect_err("tag");
        assert!(matches!(err, Error::UnknownValueTag(99)));
    }
}
