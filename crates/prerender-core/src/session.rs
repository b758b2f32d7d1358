//! The hidden document context owned by one speculation host.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::attributes::{Origin, Url};
use crate::navigation::{NavigationId, NavigationRequest, NavigationStart, SandboxPolicy};
use crate::tree::{FrameTree, NodeId, NodeIdSource, TransferredTree};

/// Stable identity of a speculation; equal to the root node id of its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    #[must_use]
    pub const fn root(self) -> NodeId {
        NodeId(self.0)
    }
}

impl From<NodeId> for SessionId {
    fn from(id: NodeId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Loading pipeline entry point used to begin the initial navigation.
pub trait NavigationLoader {
    fn begin_navigation(&mut self, root: NodeId, request: &NavigationRequest) -> NavigationStart;
}

// =============================================================================
// Client hints
// =============================================================================

/// Client-hint grants keyed by origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHintStore {
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl ClientHintStore {
    pub fn grant<I, S>(&mut self, origin: &Origin, hints: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(origin.ascii_serialization())
            .or_default()
            .extend(hints.into_iter().map(Into::into));
    }

    #[must_use]
    pub fn hints_for(&self, origin: &Origin) -> Vec<&str> {
        self.grants
            .get(&origin.ascii_serialization())
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Union `other`'s grants into this store.
    pub fn merge(&mut self, other: &Self) {
        for (origin, hints) in &other.grants {
            self.grants
                .entry(origin.clone())
                .or_default()
                .extend(hints.iter().cloned());
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// The visible tree a session is activated into.
#[derive(Debug, Clone)]
pub struct PrimaryContents {
    pub tree: FrameTree,
    pub client_hints: ClientHintStore,
}

impl PrimaryContents {
    /// `ids` must be the source the registry hands its sessions (see
    /// `SpeculationRegistry::node_ids`). Activation adopts speculative
    /// trees with their ids intact, so a separate source would let ids
    /// collide.
    #[must_use]
    pub fn new(ids: &NodeIdSource) -> Self {
        Self {
            tree: FrameTree::new(ids),
            client_hints: ClientHintStore::default(),
        }
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug)]
pub struct SpeculativeSession {
    id: SessionId,
    tree: Option<FrameTree>,
    initial_navigation: Option<NavigationId>,
    history: Vec<Url>,
    load_complete: bool,
    client_hints: ClientHintStore,
}

impl SpeculativeSession {
    #[must_use]
    pub fn new(ids: &NodeIdSource) -> Self {
        let tree = FrameTree::speculative(ids);
        Self {
            id: SessionId::from(tree.root()),
            tree: Some(tree),
            initial_navigation: None,
            history: Vec::new(),
            load_complete: false,
            client_hints: ClientHintStore::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The speculative tree, until it has been transferred.
    #[must_use]
    pub fn tree(&self) -> Option<&FrameTree> {
        self.tree.as_ref()
    }

    pub fn tree_mut(&mut self) -> Option<&mut FrameTree> {
        self.tree.as_mut()
    }

    #[must_use]
    pub fn is_transferred(&self) -> bool {
        self.tree.is_none()
    }

    /// Ask the loader to start the root navigation.
    pub fn begin_initial_navigation(
        &mut self,
        loader: &mut dyn NavigationLoader,
        request: &NavigationRequest,
    ) -> NavigationStart {
        let start = loader.begin_navigation(self.id.root(), request);
        if let NavigationStart::Started { navigation, .. } = &start {
            self.initial_navigation = Some(*navigation);
            self.history.push(request.url.clone());
        }
        start
    }

    #[must_use]
    pub fn initial_navigation(&self) -> Option<NavigationId> {
        self.initial_navigation
    }

    pub fn record_redirect(&mut self, url: &Url) {
        self.history.push(url.clone());
    }

    /// The root document committed at `url`.
    pub fn record_commit(&mut self, url: &Url) {
        if let Some(tree) = self.tree.as_mut() {
            tree.root_node_mut().url = Some(url.clone());
        }
    }

    pub fn mark_load_complete(&mut self) {
        self.load_complete = true;
    }

    #[must_use]
    pub fn is_load_complete(&self) -> bool {
        self.load_complete
    }

    /// URLs visited by the root navigation: the initial URL then each
    /// redirect target.
    #[must_use]
    pub fn history(&self) -> &[Url] {
        &self.history
    }

    /// Sandbox policy of the speculative root.
    #[must_use]
    pub fn root_sandbox(&self) -> SandboxPolicy {
        self.tree
            .as_ref()
            .map(|tree| tree.root_node().sandbox)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn client_hints(&self) -> &ClientHintStore {
        &self.client_hints
    }

    pub fn client_hints_mut(&mut self) -> &mut ClientHintStore {
        &mut self.client_hints
    }

    /// Move the whole speculative tree into `target`.
    ///
    /// # Panics
    ///
    /// Panics if the tree was already transferred.
    pub fn transfer_into(&mut self, target: &mut FrameTree) -> TransferredTree {
        let Some(tree) = self.tree.take() else {
            panic!("session {} already transferred", self.id);
        };
        target.adopt(tree)
    }
}
