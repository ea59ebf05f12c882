// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ipld::{Node, PathSegment};
use crate::{deal_error, DealError};

/// How many times a recursive selector may follow its recursion edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecursionLimit {
    None,
    Depth(u64),
}

/// Declarative description of which part of a DAG to walk.
///
/// Encodes to the usual single-letter IPLD selector form (`.` matcher, `a` explore all,
/// `f` fields, `i` index, `r` range, `|` union, `R` recursive, `@` recursion edge).
#[derive(Clone, Debug, PartialEq)]
pub enum Selector {
    Matcher,
    ExploreAll { next: Box<Selector> },
    ExploreFields { fields: Vec<(String, Selector)> },
    ExploreIndex { index: usize, next: Box<Selector> },
    ExploreRange { start: usize, end: usize, next: Box<Selector> },
    ExploreUnion(Vec<Selector>),
    ExploreRecursive { limit: RecursionLimit, sequence: Box<Selector> },
    ExploreRecursiveEdge,
}

impl Selector {
    /// Selects every node of the DAG.
    pub fn all() -> Self {
        Selector::ExploreRecursive {
            limit: RecursionLimit::None,
            sequence: Box::new(Selector::ExploreAll { next: Box::new(Selector::ExploreRecursiveEdge) }),
        }
    }

    /// Selects the root block only.
    pub fn root_only() -> Self {
        Selector::Matcher
    }

    /// Selects the DAG down to `depth` levels of links below the root.
    pub fn depth(depth: u64) -> Self {
        Selector::ExploreRecursive {
            limit: RecursionLimit::Depth(depth),
            sequence: Box::new(Selector::ExploreAll { next: Box::new(Selector::ExploreRecursiveEdge) }),
        }
    }

    pub fn to_node(&self) -> Node {
        let inner = match self {
            Selector::Matcher => ('.', Node::Map(vec![])),
            Selector::ExploreAll { next } => ('a', Node::map([(">", next.to_node())])),
            Selector::ExploreFields { fields } => (
                'f',
                Node::map([(
                    "f>",
                    Node::map(fields.iter().map(|(k, s)| (k.clone(), s.to_node()))),
                )]),
            ),
            Selector::ExploreIndex { index, next } => (
                'i',
                Node::map([("i", Node::Integer(*index as i128)), (">", next.to_node())]),
            ),
            Selector::ExploreRange { start, end, next } => (
                'r',
                Node::map([
                    ("^", Node::Integer(*start as i128)),
                    ("$", Node::Integer(*end as i128)),
                    (">", next.to_node()),
                ]),
            ),
            Selector::ExploreUnion(members) => {
                ('|', Node::List(members.iter().map(Selector::to_node).collect()))
            }
            Selector::ExploreRecursive { limit, sequence } => {
                let limit = match limit {
                    RecursionLimit::None => Node::map([("none", Node::Map(vec![]))]),
                    RecursionLimit::Depth(d) => Node::map([("depth", Node::Integer(*d as i128))]),
                };
                ('R', Node::map([("l", limit), (":>", sequence.to_node())]))
            }
            Selector::ExploreRecursiveEdge => ('@', Node::Map(vec![])),
        };
        Node::Map(vec![(inner.0.to_string(), inner.1)])
    }

    pub fn from_node(node: &Node) -> Result<Self, DealError> {
        let (key, body) = match node {
            Node::Map(entries) if entries.len() == 1 => (&entries[0].0, &entries[0].1),
            _ => return Err(deal_error!(illegal_argument; "selector must be a single-entry map")),
        };
        let next = |body: &Node| -> Result<Box<Selector>, DealError> {
            let n = body
                .field(">")
                .ok_or_else(|| deal_error!(illegal_argument; "selector '{}' has no next selector", key))?;
            Ok(Box::new(Selector::from_node(n)?))
        };
        let uint = |body: &Node, field: &str| -> Result<usize, DealError> {
            body.field(field)
                .and_then(Node::as_u64)
                .map(|v| v as usize)
                .ok_or_else(|| deal_error!(illegal_argument; "selector '{}' needs integer '{}'", key, field))
        };
        Ok(match key.as_str() {
            "." => Selector::Matcher,
            "a" => Selector::ExploreAll { next: next(body)? },
            "f" => {
                let fields = match body.field("f>") {
                    Some(Node::Map(entries)) => entries
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), Selector::from_node(v)?)))
                        .collect::<Result<Vec<_>, DealError>>()?,
                    _ => return Err(deal_error!(illegal_argument; "explore fields needs a 'f>' map")),
                };
                Selector::ExploreFields { fields }
            }
            "i" => Selector::ExploreIndex { index: uint(body, "i")?, next: next(body)? },
            "r" => {
                let (start, end) = (uint(body, "^")?, uint(body, "$")?);
                if end < start {
                    return Err(deal_error!(illegal_argument; "explore range end {} before start {}", end, start));
                }
                Selector::ExploreRange { start, end, next: next(body)? }
            }
            "|" => match body {
                Node::List(members) => Selector::ExploreUnion(
                    members.iter().map(Selector::from_node).collect::<Result<_, _>>()?,
                ),
                _ => return Err(deal_error!(illegal_argument; "explore union needs a list")),
            },
            "R" => {
                let limit = match body.field("l") {
                    Some(l) if l.field("none").is_some() => RecursionLimit::None,
                    Some(l) => RecursionLimit::Depth(
                        l.field("depth").and_then(Node::as_u64).ok_or_else(
                            || deal_error!(illegal_argument; "recursion limit needs 'none' or 'depth'"),
                        )?,
                    ),
                    None => return Err(deal_error!(illegal_argument; "explore recursive needs a limit")),
                };
                let sequence = body
                    .field(":>")
                    .ok_or_else(|| deal_error!(illegal_argument; "explore recursive needs a sequence"))?;
                Selector::ExploreRecursive { limit, sequence: Box::new(Selector::from_node(sequence)?) }
            }
            "@" => Selector::ExploreRecursiveEdge,
            other => return Err(deal_error!(illegal_argument; "unknown selector kind '{}'", other)),
        })
    }

    /// Which children of `node` this selector visits, each with the selector to apply there.
    /// Recursion edges are resolved against `frames`; an exhausted edge drops the child.
    pub(crate) fn explore(
        &self,
        node: &Node,
        frames: &[Frame],
    ) -> Result<Vec<(PathSegment, Cursor)>, DealError> {
        let mut out: Vec<(PathSegment, Cursor)> = Vec::new();
        match self {
            Selector::Matcher | Selector::ExploreRecursiveEdge => {}
            Selector::ExploreAll { next } => {
                for (seg, _) in node.children() {
                    push_resolved(&mut out, seg, next, frames)?;
                }
            }
            Selector::ExploreFields { fields } => {
                for (name, next) in fields {
                    if node.field(name).is_some() {
                        push_resolved(&mut out, PathSegment::Field(name.clone()), next, frames)?;
                    }
                }
            }
            Selector::ExploreIndex { index, next } => {
                if node.index(*index).is_some() {
                    push_resolved(&mut out, PathSegment::Index(*index), next, frames)?;
                }
            }
            Selector::ExploreRange { start, end, next } => {
                for i in *start..(*end).min(node.len()) {
                    if node.index(i).is_some() {
                        push_resolved(&mut out, PathSegment::Index(i), next, frames)?;
                    }
                }
            }
            Selector::ExploreUnion(members) => {
                for member in members {
                    for (seg, cursor) in member.explore(node, frames)? {
                        match out.iter_mut().find(|(s, _)| *s == seg) {
                            Some((_, existing)) => existing.merge(cursor),
                            None => out.push((seg, cursor)),
                        }
                    }
                }
            }
            Selector::ExploreRecursive { .. } => {
                let cursor = Cursor::resolve(self, frames)?;
                if let Some(cursor) = cursor {
                    return cursor.explore(node);
                }
            }
        }
        Ok(out)
    }
}

fn push_resolved(
    out: &mut Vec<(PathSegment, Cursor)>,
    seg: PathSegment,
    next: &Selector,
    frames: &[Frame],
) -> Result<(), DealError> {
    if let Some(cursor) = Cursor::resolve(next, frames)? {
        out.push((seg, cursor));
    }
    Ok(())
}

/// An entered recursive selector and the edges it may still follow.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Frame {
    pub(crate) remaining: Option<u64>,
    pub(crate) sequence: Selector,
}

/// The selectors applying at one node, with the recursion frames they run under.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Cursor {
    pub(crate) paths: Vec<(Selector, Vec<Frame>)>,
}

impl Cursor {
    /// Resolves recursive selectors and edges into the selector that actually runs at a node.
    /// Returns `None` when the only thing left is an exhausted recursion edge.
    pub(crate) fn resolve(selector: &Selector, frames: &[Frame]) -> Result<Option<Self>, DealError> {
        match selector {
            Selector::ExploreRecursive { limit, sequence } => {
                let mut frames = frames.to_vec();
                frames.push(Frame {
                    remaining: match limit {
                        RecursionLimit::None => None,
                        RecursionLimit::Depth(d) => Some(*d),
                    },
                    sequence: (**sequence).clone(),
                });
                Cursor::resolve(sequence, &frames)
            }
            Selector::ExploreRecursiveEdge => {
                let mut frames = frames.to_vec();
                let top = frames
                    .last_mut()
                    .ok_or_else(|| deal_error!(illegal_argument; "recursion edge outside a recursive selector"))?;
                match top.remaining {
                    Some(0) => return Ok(None),
                    Some(ref mut n) => *n -= 1,
                    None => {}
                }
                let sequence = top.sequence.clone();
                Ok(Some(Cursor { paths: vec![(sequence, frames)] }))
            }
            other => Ok(Some(Cursor { paths: vec![(other.clone(), frames.to_vec())] })),
        }
    }

    fn merge(&mut self, other: Cursor) {
        for path in other.paths {
            if !self.paths.contains(&path) {
                self.paths.push(path);
            }
        }
    }

    /// Children of `node` selected by any of this cursor's selectors, in first-selected order.
    pub(crate) fn explore(&self, node: &Node) -> Result<Vec<(PathSegment, Cursor)>, DealError> {
        let mut out: Vec<(PathSegment, Cursor)> = Vec::new();
        for (selector, frames) in &self.paths {
            for (seg, cursor) in selector.explore(node, frames)? {
                match out.iter_mut().find(|(s, _)| *s == seg) {
                    Some((_, existing)) => existing.merge(cursor),
                    None => out.push((seg, cursor)),
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn to_node(&self) -> Node {
        Node::List(
            self.paths
                .iter()
                .map(|(selector, frames)| {
                    Node::List(vec![
                        selector.to_node(),
                        Node::List(
                            frames
                                .iter()
                                .map(|f| {
                                    Node::List(vec![
                                        f.remaining.map_or(Node::Null, |r| Node::Integer(r as i128)),
                                        f.sequence.to_node(),
                                    ])
                                })
                                .collect(),
                        ),
                    ])
                })
                .collect(),
        )
    }

    pub(crate) fn from_node(node: &Node) -> Result<Self, DealError> {
        let bad = || deal_error!(serialization; "malformed traversal cursor");
        let Node::List(paths) = node else { return Err(bad()) };
        let paths = paths
            .iter()
            .map(|p| {
                let (Some(sel), Some(Node::List(frames))) = (p.index(0), p.index(1)) else {
                    return Err(bad());
                };
                let frames = frames
                    .iter()
                    .map(|f| {
                        let remaining = match f.index(0) {
                            Some(Node::Null) => None,
                            Some(n) => Some(n.as_u64().ok_or_else(bad)?),
                            None => return Err(bad()),
                        };
                        let sequence = Selector::from_node(f.index(1).ok_or_else(bad)?)?;
                        Ok(Frame { remaining, sequence })
                    })
                    .collect::<Result<Vec<_>, DealError>>()?;
                Ok((Selector::from_node(sel)?, frames))
            })
            .collect::<Result<Vec<_>, DealError>>()?;
        Ok(Cursor { paths })
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_node().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let node = Node::deserialize(deserializer)?;
        Selector::from_node(&node).map_err(|e| serde::de::Error::custom(e.msg()))
    }
}

#[cfg(test)]
mod tests {
    use fvm_ipld_encoding::{from_slice, to_vec};
    use test_case::test_case;

    use super::*;

    #[test_case(Selector::all(); "all")]
    #[test_case(Selector::depth(2); "depth")]
    #[test_case(Selector::ExploreFields { fields: vec![
        ("Links".into(), Selector::ExploreIndex { index: 1, next: Box::new(Selector::Matcher) }),
    ] }; "fields")]
    #[test_case(Selector::ExploreUnion(vec![
        Selector::Matcher,
        Selector::ExploreRange { start: 0, end: 2, next: Box::new(Selector::Matcher) },
    ]); "union")]
    fn selectors_encode_as_ipld(selector: Selector) {
        let bytes = to_vec(&selector).unwrap();
        let back: Selector = from_slice(&bytes).unwrap();
        assert_eq!(back, selector);
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        assert!(Selector::from_node(&Node::map([("x", Node::Null)])).is_err());
        assert!(Selector::from_node(&Node::map([(
            "r",
            Node::map([("^", Node::Integer(3)), ("$", Node::Integer(1)), (">", Selector::Matcher.to_node())]),
        )]))
        .is_err());
        assert!(Cursor::resolve(&Selector::ExploreRecursiveEdge, &[]).is_err());
    }

    #[test]
    fn exhausted_edges_drop_children() {
        let node = Node::List(vec![Node::Integer(1), Node::Integer(2)]);
        let root = Cursor::resolve(&Selector::depth(0), &[]).unwrap().unwrap();
        assert!(root.explore(&node).unwrap().is_empty());

        let root = Cursor::resolve(&Selector::depth(1), &[]).unwrap().unwrap();
        let children = root.explore(&node).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children[0].1.explore(&node).unwrap().is_empty());
    }
}
