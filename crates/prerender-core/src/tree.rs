//! Frame-tree arena and whole-subtree transfer.
//!
//! Speculative and live trees are arenas of [`FrameNode`]s keyed by
//! [`NodeId`]. Ids come from one shared [`NodeIdSource`], so nodes keep
//! their identity when a speculative tree is adopted into a live one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::attributes::Url;
use crate::navigation::SandboxPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyId(pub u64);

/// Monotonic id allocator shared by every tree of one owner.
#[derive(Debug, Clone)]
pub struct NodeIdSource {
    next: Arc<AtomicU64>,
}

impl Default for NodeIdSource {
    fn default() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl NodeIdSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn next_node(&self) -> NodeId {
        NodeId(self.bump())
    }

    #[must_use]
    pub fn next_proxy(&self) -> ProxyId {
        ProxyId(self.bump())
    }

    /// Both handles allocate from the same counter.
    #[must_use]
    pub fn shares_with(&self, other: &NodeIdSource) -> bool {
        Arc::ptr_eq(&self.next, &other.next)
    }
}

/// One frame in a tree.
#[derive(Debug, Clone)]
pub struct FrameNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub url: Option<Url>,
    pub sandbox: SandboxPolicy,
    pub proxies: Vec<ProxyId>,
    /// Still part of a hidden speculative tree.
    pub speculative: bool,
}

impl FrameNode {
    fn new(id: NodeId, parent: Option<NodeId>, url: Option<Url>, speculative: bool) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            url,
            sandbox: SandboxPolicy::default(),
            proxies: Vec::new(),
            speculative,
        }
    }
}

/// Stand-in for a frame in another process; owned by exactly one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proxy {
    pub id: ProxyId,
    pub owner: NodeId,
}

/// Result of adopting a speculative tree into a live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredTree {
    /// New root of the live tree (the speculative root).
    pub root: NodeId,
    /// Every adopted node, pre-order from the root.
    pub nodes: Vec<NodeId>,
    pub proxies: Vec<ProxyId>,
    /// Root that was replaced.
    pub displaced_root: NodeId,
    /// Number of nodes discarded with the displaced root.
    pub displaced: usize,
}

fn walk(nodes: &BTreeMap<NodeId, FrameNode>, start: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        let Some(node) = nodes.get(&id) else {
            continue;
        };
        out.push(id);
        stack.extend(node.children.iter().rev().copied());
    }
    out
}

#[derive(Debug, Clone)]
pub struct FrameTree {
    ids: NodeIdSource,
    root: NodeId,
    nodes: BTreeMap<NodeId, FrameNode>,
    proxies: BTreeMap<ProxyId, Proxy>,
}

impl FrameTree {
    /// Live tree with a fresh root.
    #[must_use]
    pub fn new(ids: &NodeIdSource) -> Self {
        Self::with_root(ids, false)
    }

    /// Hidden tree whose nodes are marked speculative.
    #[must_use]
    pub fn speculative(ids: &NodeIdSource) -> Self {
        Self::with_root(ids, true)
    }

    fn with_root(ids: &NodeIdSource, speculative: bool) -> Self {
        let root = ids.next_node();
        let mut nodes = BTreeMap::new();
        nodes.insert(root, FrameNode::new(root, None, None, speculative));
        Self {
            ids: ids.clone(),
            root,
            nodes,
            proxies: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&FrameNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut FrameNode> {
        self.nodes.get_mut(&id)
    }

    #[must_use]
    pub fn root_node(&self) -> &FrameNode {
        &self.nodes[&self.root]
    }

    pub fn root_node_mut(&mut self) -> &mut FrameNode {
        self.nodes
            .get_mut(&self.root)
            .unwrap_or_else(|| unreachable!("root node always present"))
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn proxy(&self, id: ProxyId) -> Option<&Proxy> {
        self.proxies.get(&id)
    }

    #[must_use]
    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Add a child frame. Returns `None` if `parent` is not in this tree.
    pub fn append_child(&mut self, parent: NodeId, url: Option<Url>) -> Option<NodeId> {
        let speculative = self.nodes.get(&parent)?.speculative;
        let id = self.ids.next_node();
        self.nodes
            .insert(id, FrameNode::new(id, Some(parent), url, speculative));
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.push(id);
        }
        Some(id)
    }

    pub fn add_proxy(&mut self, owner: NodeId) -> Option<ProxyId> {
        let node = self.nodes.get_mut(&owner)?;
        let id = self.ids.next_proxy();
        node.proxies.push(id);
        self.proxies.insert(id, Proxy { id, owner });
        Some(id)
    }

    /// Pre-order walk from `start`, `start` included.
    #[must_use]
    pub fn descendants(&self, start: NodeId) -> Vec<NodeId> {
        walk(&self.nodes, start)
    }

    /// Remove a non-root subtree. Returns the number of nodes removed.
    pub fn remove_subtree(&mut self, id: NodeId) -> usize {
        if id == self.root {
            return 0;
        }
        let Some(parent) = self.nodes.get(&id).and_then(|n| n.parent) else {
            return 0;
        };
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.retain(|c| *c != id);
        }
        let doomed = self.descendants(id);
        self.drop_nodes(&doomed)
    }

    fn drop_nodes(&mut self, ids: &[NodeId]) -> usize {
        for id in ids {
            if let Some(node) = self.nodes.remove(id) {
                for proxy in node.proxies {
                    self.proxies.remove(&proxy);
                }
            }
        }
        ids.len()
    }

    /// Replace this tree's root with the whole of `source`.
    ///
    /// Every node and proxy of `source` moves over with its id unchanged
    /// and stops being speculative. The old root subtree is discarded.
    ///
    /// Both trees must draw ids from the same [`NodeIdSource`]; ids from
    /// separate sources can collide and silently overwrite live nodes.
    /// Debug builds assert this.
    pub fn adopt(&mut self, source: FrameTree) -> TransferredTree {
        debug_assert!(
            self.ids.shares_with(&source.ids),
            "adopted tree allocates ids from a different NodeIdSource"
        );
        let displaced_root = self.root;
        let displaced_ids = self.descendants(displaced_root);
        let displaced = self.drop_nodes(&displaced_ids);

        let FrameTree {
            root,
            nodes,
            proxies,
            ..
        } = source;
        let order = walk(&nodes, root);
        for (id, mut node) in nodes {
            node.speculative = false;
            self.nodes.insert(id, node);
        }
        let mut moved_proxies = Vec::with_capacity(proxies.len());
        for (id, proxy) in proxies {
            moved_proxies.push(id);
            self.proxies.insert(id, proxy);
        }
        self.root = root;
        if let Some(node) = self.nodes.get_mut(&root) {
            node.parent = None;
        }

        TransferredTree {
            root,
            nodes: order,
            proxies: moved_proxies,
            displaced_root,
            displaced,
        }
    }
}
