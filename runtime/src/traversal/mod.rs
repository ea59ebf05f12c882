// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Selector-driven DAG traversal that can be paused between any two blocks.

use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use log::debug;

use crate::ipld::Node;
use crate::util::cid::verify_block;
use crate::util::AsDealErrors;
use crate::{deal_error, DealError};

pub use self::prefix::BlockPrefix;
pub use self::selector::{RecursionLimit, Selector};

use self::selector::Cursor;

mod prefix;
mod selector;

#[derive(Clone, Debug, PartialEq)]
struct PendingLink {
    cid: Cid,
    cursor: Cursor,
}

/// Serialisable position of a [`Traverser`].
#[derive(Serialize_tuple, Deserialize_tuple, Clone, Debug, PartialEq)]
pub struct TraversalState {
    pub root: Cid,
    pub started: bool,
    /// Links still to visit, next one last.
    pub pending: Vec<(Cid, Node)>,
}

/// Walks the blocks a selector picks out of a DAG rooted at `root`, one block at a time.
///
/// Blocks are visited in pre-order. The caller feeds each requested block's bytes through
/// [`Traverser::advance`]; links found in it are queued so that nothing already visited is
/// walked again.
#[derive(Debug)]
pub struct Traverser {
    root: Cid,
    selector: Selector,
    started: bool,
    stack: Vec<PendingLink>,
    error: Option<DealError>,
}

impl Traverser {
    pub fn new(root: Cid, selector: Selector) -> Self {
        Self { root, selector, started: false, stack: Vec::new(), error: None }
    }

    pub fn root(&self) -> &Cid {
        &self.root
    }

    /// Positions the traversal on the root block.
    pub fn start(&mut self) -> Result<(), DealError> {
        if self.started {
            return Ok(());
        }
        let cursor = Cursor::resolve(&self.selector, &[])?
            .unwrap_or(Cursor { paths: vec![(Selector::Matcher, Vec::new())] });
        self.stack = vec![PendingLink { cid: self.root, cursor }];
        self.started = true;
        Ok(())
    }

    /// True once every selected block has been visited, or the traversal failed.
    pub fn is_complete(&self) -> bool {
        self.started && (self.stack.is_empty() || self.error.is_some())
    }

    /// The block the traversal is waiting for.
    pub fn current_request(&self) -> Option<Cid> {
        if self.error.is_some() {
            return None;
        }
        self.stack.last().map(|p| p.cid)
    }

    /// Supplies the bytes of the current request and moves to the next required block.
    pub fn advance(&mut self, data: &[u8]) -> Result<(), DealError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let pending = self
            .stack
            .pop()
            .ok_or_else(|| deal_error!(illegal_state; "traversal of {} is already complete", self.root))?;
        let result = self.expand(&pending, data);
        if let Err(e) = &result {
            self.stack.push(pending);
            self.error = Some(e.clone());
        }
        result
    }

    /// Aborts the traversal, e.g. when a block could not be loaded.
    pub fn fail(&mut self, err: DealError) {
        self.error = Some(err);
    }

    pub fn error(&self) -> Option<&DealError> {
        self.error.as_ref()
    }

    pub fn snapshot(&self) -> TraversalState {
        TraversalState {
            root: self.root,
            started: self.started,
            pending: self.stack.iter().map(|p| (p.cid, p.cursor.to_node())).collect(),
        }
    }

    /// Rebuilds a traverser at a saved position.
    pub fn resume(selector: Selector, state: &TraversalState) -> Result<Self, DealError> {
        let stack = state
            .pending
            .iter()
            .map(|(cid, cursor)| Ok(PendingLink { cid: *cid, cursor: Cursor::from_node(cursor)? }))
            .collect::<Result<Vec<_>, DealError>>()?;
        Ok(Self { root: state.root, selector, started: state.started, stack, error: None })
    }

    fn expand(&mut self, pending: &PendingLink, data: &[u8]) -> Result<(), DealError> {
        verify_block(&pending.cid, data)?;
        let node = Node::decode(&pending.cid, data)?;
        let mut found = Vec::new();
        collect_links(&node, &pending.cursor, &mut found)?;
        debug!("traversal of {}: block {} yields {} links", self.root, pending.cid, found.len());
        self.stack.extend(found.into_iter().rev());
        Ok(())
    }
}

// Walks inline children in order; links end the walk and are queued for loading.
fn collect_links(node: &Node, cursor: &Cursor, out: &mut Vec<PendingLink>) -> Result<(), DealError> {
    for (seg, child_cursor) in cursor.explore(node)? {
        let Some(child) = node.get(&seg) else { continue };
        match child {
            Node::Link(cid) => out.push(PendingLink { cid: *cid, cursor: child_cursor }),
            _ => collect_links(child, &child_cursor, out)?,
        }
    }
    Ok(())
}

/// Runs a whole traversal against a blockstore, returning the visited blocks in order.
pub fn traverse_blockstore<BS: Blockstore>(
    store: &BS,
    root: Cid,
    selector: Selector,
) -> Result<Vec<(Cid, Vec<u8>)>, DealError> {
    let mut traverser = Traverser::new(root, selector);
    traverser.start()?;
    let mut out = Vec::new();
    while let Some(cid) = traverser.current_request() {
        let data = store
            .get(&cid)
            .or_with_illegal_state(|| format!("failed to load block {}", cid))?
            .ok_or_else(|| deal_error!(not_found; "block {} not found", cid))?;
        traverser.advance(&data)?;
        out.push((cid, data));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use fvm_ipld_encoding::{from_slice, to_vec};

    use super::*;
    use crate::blockstore::MemoryBlockstore;
    use crate::util::cid::{cbor_cid, raw_cid};

    fn put(bs: &MemoryBlockstore, node: &Node) -> Cid {
        let bytes = node.encode().unwrap();
        let cid = cbor_cid(&bytes).unwrap();
        bs.put_keyed(&cid, &bytes).unwrap();
        cid
    }

    fn put_raw(bs: &MemoryBlockstore, data: &[u8]) -> Cid {
        let cid = raw_cid(data).unwrap();
        bs.put_keyed(&cid, data).unwrap();
        cid
    }

    // root -> [mid -> [a, b], c]
    fn dag(bs: &MemoryBlockstore) -> (Cid, Vec<Cid>) {
        let a = put_raw(bs, b"a");
        let b = put_raw(bs, b"b");
        let c = put_raw(bs, b"c");
        let mid = put(bs, &Node::map([("Links", Node::List(vec![Node::Link(a), Node::Link(b)]))]));
        let root = put(
            bs,
            &Node::map([
                ("Links", Node::List(vec![Node::Link(mid), Node::Link(c)])),
                ("Data", Node::String("root".into())),
            ]),
        );
        (root, vec![root, mid, a, b, c])
    }

    #[test]
    fn visits_whole_dag_in_preorder() {
        let bs = MemoryBlockstore::new();
        let (root, order) = dag(&bs);
        let visited: Vec<Cid> =
            traverse_blockstore(&bs, root, Selector::all()).unwrap().into_iter().map(|(c, _)| c).collect();
        assert_eq!(visited, order);
    }

    #[test]
    fn depth_limit_and_root_only() {
        let bs = MemoryBlockstore::new();
        let (root, order) = dag(&bs);
        // The inline Links list takes one level.
        let visited = traverse_blockstore(&bs, root, Selector::depth(2)).unwrap();
        assert_eq!(visited.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![order[0], order[1], order[4]]);

        let mut t = Traverser::new(root, Selector::root_only());
        t.start().unwrap();
        assert!(!t.is_complete());
        t.advance(&bs.get(&root).unwrap().unwrap()).unwrap();
        assert!(t.is_complete());
        assert_eq!(t.current_request(), None);
    }

    #[test]
    fn resumed_traversal_continues_where_it_stopped() {
        let bs = MemoryBlockstore::new();
        let (root, order) = dag(&bs);

        let mut t = Traverser::new(root, Selector::all());
        t.start().unwrap();
        for cid in &order[..2] {
            t.advance(&bs.get(cid).unwrap().unwrap()).unwrap();
        }
        let saved: TraversalState = from_slice(&to_vec(&t.snapshot()).unwrap()).unwrap();
        drop(t);

        let mut resumed = Traverser::resume(Selector::all(), &saved).unwrap();
        let mut rest = Vec::new();
        while let Some(cid) = resumed.current_request() {
            resumed.advance(&bs.get(&cid).unwrap().unwrap()).unwrap();
            rest.push(cid);
        }
        assert_eq!(rest, order[2..].to_vec());
    }

    #[test]
    fn wrong_bytes_fail_the_traversal() {
        let bs = MemoryBlockstore::new();
        let (root, _) = dag(&bs);
        let mut t = Traverser::new(root, Selector::all());
        t.start().unwrap();
        assert!(t.advance(b"not the root").is_err());
        assert!(t.is_complete());
        assert!(t.error().is_some());
        assert!(t.advance(b"again").is_err());
    }

    #[test]
    fn fields_selector_follows_named_paths() {
        let bs = MemoryBlockstore::new();
        let (root, order) = dag(&bs);
        let selector = Selector::ExploreFields {
            fields: vec![(
                "Links".into(),
                Selector::ExploreIndex { index: 1, next: Box::new(Selector::Matcher) },
            )],
        };
        let visited = traverse_blockstore(&bs, root, selector).unwrap();
        assert_eq!(visited.iter().map(|(c, _)| *c).collect::<Vec<_>>(), vec![root, order[4]]);
    }
}
