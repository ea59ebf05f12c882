// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::Cid;
use fvm_ipld_encoding::{from_slice, to_vec};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::util::cid::{DAG_CBOR, IPLD_RAW};
use crate::{deal_error, DealError};

/// The IPLD data model: what a decoded block looks like to selectors and traversals.
///
/// Map entries keep the order they were decoded in, which for DAG-CBOR is the canonical
/// key order.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Null,
    Bool(bool),
    Integer(i128),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Node>),
    Map(Vec<(String, Node)>),
    Link(Cid),
}

/// One step into a node: a map key or a list index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl Node {
    /// Decodes a block according to the codec in its CID.
    pub fn decode(cid: &Cid, data: &[u8]) -> Result<Self, DealError> {
        match cid.codec() {
            DAG_CBOR => from_slice(data)
                .map_err(|e| deal_error!(serialization; "failed to decode block {}: {}", cid, e)),
            IPLD_RAW => Ok(Node::Bytes(data.to_vec())),
            codec => Err(deal_error!(illegal_argument; "unsupported codec {:#x} for block {}", codec, cid)),
        }
    }

    /// Encodes the node as DAG-CBOR.
    pub fn encode(&self) -> Result<Vec<u8>, DealError> {
        Ok(to_vec(self)?)
    }

    /// Builds a map node with keys in DAG-CBOR canonical order (length first, then bytes).
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Node)>) -> Self {
        let mut entries: Vec<(String, Node)> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        Node::Map(entries)
    }

    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Node::Link(cid) => Some(cid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Node::Integer(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Looks up a map entry.
    pub fn field(&self, name: &str) -> Option<&Node> {
        match self {
            Node::Map(entries) => entries.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn index(&self, i: usize) -> Option<&Node> {
        match self {
            Node::List(items) => items.get(i),
            _ => None,
        }
    }

    pub fn get(&self, segment: &PathSegment) -> Option<&Node> {
        match segment {
            PathSegment::Field(name) => self.field(name),
            PathSegment::Index(i) => self.index(*i),
        }
    }

    /// Direct children in iteration order: map values in key order, list items in order.
    pub fn children(&self) -> Vec<(PathSegment, &Node)> {
        match self {
            Node::Map(entries) => {
                entries.iter().map(|(k, v)| (PathSegment::Field(k.clone()), v)).collect()
            }
            Node::List(items) => {
                items.iter().enumerate().map(|(i, v)| (PathSegment::Index(i), v)).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Number of children of a list, or entries of a map.
    pub fn len(&self) -> usize {
        match self {
            Node::Map(entries) => entries.len(),
            Node::List(items) => items.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every link reachable without leaving this block, in pre-order.
    pub fn links(&self) -> Vec<Cid> {
        let mut out = Vec::new();
        self.collect_links(&mut out);
        out
    }

    fn collect_links(&self, out: &mut Vec<Cid>) {
        match self {
            Node::Link(cid) => out.push(*cid),
            Node::List(items) => items.iter().for_each(|n| n.collect_links(out)),
            Node::Map(entries) => entries.iter().for_each(|(_, n)| n.collect_links(out)),
            _ => {}
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Node::Null => serializer.serialize_none(),
            Node::Bool(b) => serializer.serialize_bool(*b),
            Node::Integer(i) => {
                if let Ok(u) = u64::try_from(*i) {
                    serializer.serialize_u64(u)
                } else if let Ok(s) = i64::try_from(*i) {
                    serializer.serialize_i64(s)
                } else {
                    Err(serde::ser::Error::custom(format!("integer {} out of range", i)))
                }
            }
            Node::Float(f) => serializer.serialize_f64(*f),
            Node::String(s) => serializer.serialize_str(s),
            Node::Bytes(b) => serializer.serialize_bytes(b),
            Node::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Node::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Node::Link(cid) => cid.serialize(serializer),
        }
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any IPLD value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Node, E> {
        Ok(Node::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Node, E> {
        Ok(Node::Integer(v.into()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Node, E> {
        Ok(Node::Integer(v.into()))
    }

    fn visit_i128<E: de::Error>(self, v: i128) -> Result<Node, E> {
        Ok(Node::Integer(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Node, E> {
        Ok(Node::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
        Ok(Node::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
        Ok(Node::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Node, E> {
        Ok(Node::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Node, E> {
        Ok(Node::Bytes(v))
    }

    fn visit_none<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Node, D::Error> {
        Node::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Node, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Node::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Node, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry::<String, Node>()? {
            entries.push((k, v));
        }
        Ok(Node::Map(entries))
    }

    // DAG-CBOR hands tag 42 links to the visitor as a newtype wrapping the CID bytes.
    fn visit_newtype_struct<D: Deserializer<'de>>(self, d: D) -> Result<Node, D::Error> {
        d.deserialize_bytes(LinkVisitor).map(Node::Link)
    }
}

struct LinkVisitor;

impl<'de> Visitor<'de> for LinkVisitor {
    type Value = Cid;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CID bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Cid, E> {
        Cid::try_from(v).map_err(|e| E::custom(format!("invalid link: {}", e)))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Cid, E> {
        self.visit_bytes(&v)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cid::{cbor_cid, raw_cid};

    #[test]
    fn links_survive_encoding() {
        let leaf = raw_cid(b"leaf").unwrap();
        let node = Node::map([
            ("Links", Node::List(vec![Node::Link(leaf), Node::Link(leaf)])),
            ("Data", Node::Bytes(vec![1, 2, 3])),
            ("n", Node::Integer(-4)),
        ]);
        let bytes = node.encode().unwrap();
        let cid = cbor_cid(&bytes).unwrap();
        let back = Node::decode(&cid, &bytes).unwrap();

        assert_eq!(back, node);
        assert_eq!(back.links(), vec![leaf, leaf]);
        assert_eq!(back.field("Data"), Some(&Node::Bytes(vec![1, 2, 3])));
        // Canonical order puts the one-letter key first.
        assert_eq!(back.children()[0].0, PathSegment::Field("n".into()));
    }

    #[test]
    fn raw_blocks_are_bytes() {
        let cid = raw_cid(b"hello").unwrap();
        assert_eq!(Node::decode(&cid, b"hello").unwrap(), Node::Bytes(b"hello".to_vec()));
        assert!(Node::decode(&cid, b"hello").unwrap().links().is_empty());
    }
}
