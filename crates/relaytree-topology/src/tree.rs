//! Tree view - the shape of the relay network as seen from one root
//!
//! A tree view is computed on demand from a peer population and never
//! stored. It follows only links whose state passes a [`LinkFilter`]
//! (by default `established`), so in-progress links do not make a peer part
//! of the tree. Peers not reachable from the root are left out silently.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

use relaytree_core::{LinkFilter, LinkId, Peer, PeerConnection, PeerId, PeerNode};

/// One node of a tree view
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub peer: Peer,
    /// Every link the peer is a party to, in any state
    pub links: Vec<PeerConnection>,
    /// Peers attached below this one by filtered links
    pub children: Vec<TreeNode>,
    /// Child links held by this peer that the filter did not follow
    pub pending_children: usize,
}

impl TreeNode {
    #[inline]
    pub fn id(&self) -> PeerId {
        self.peer.id
    }

    /// Child slots in use: attached children plus in-progress reservations
    #[inline]
    pub fn load(&self) -> usize {
        self.children.len() + self.pending_children
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Computed broadcast tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreeView {
    pub root: TreeNode,
}

impl TreeView {
    /// Nodes in breadth-first order, root first
    pub fn bfs(&self) -> Vec<&TreeNode> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([&self.root]);

        while let Some(node) = queue.pop_front() {
            order.push(node);
            queue.extend(node.children.iter());
        }

        order
    }

    /// Nodes in depth-first pre-order, root first
    pub fn dfs(&self) -> Vec<&TreeNode> {
        let mut order = Vec::new();
        let mut stack = vec![&self.root];

        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(node.children.iter().rev());
        }

        order
    }

    /// Find the node for a peer
    pub fn find(&self, peer: PeerId) -> Option<&TreeNode> {
        self.bfs().into_iter().find(|n| n.id() == peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.find(peer).is_some()
    }

    /// Number of peers in the tree, root included
    pub fn len(&self) -> usize {
        self.bfs().len()
    }

    /// A tree always has its root
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Number of edges on the longest root-to-leaf path
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(&self.root, 0usize)];

        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(node.children.iter().map(|c| (c, depth + 1)));
        }

        deepest
    }

    /// Largest number of children any node has
    pub fn max_children(&self) -> usize {
        self.bfs().iter().map(|n| n.children.len()).max().unwrap_or(0)
    }

    /// Peer ids in breadth-first order
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.bfs().iter().map(|n| n.id()).collect()
    }

    /// Every link id referenced by any node
    pub fn link_ids(&self) -> impl Iterator<Item = LinkId> + '_ {
        self.bfs()
            .into_iter()
            .flat_map(|n| n.links.iter().map(|l| l.id))
    }
}

/// Build the tree rooted at `root`
///
/// Breadth-first: for each dequeued parent, scan the whole population for
/// unvisited peers of the root's channel holding a filtered link whose
/// endpoint is that parent. Found peers are marked visited, attached, and
/// enqueued. Children keep population order.
pub fn build_tree(root: &PeerNode, population: &[PeerNode], filter: LinkFilter) -> TreeView {
    let channel = root.channel();

    // Arena of (population index or root, child arena indices); children
    // always land after their parent.
    let mut arena: Vec<(Option<usize>, Vec<usize>)> = vec![(None, Vec::new())];
    let mut visited: HashSet<PeerId> = HashSet::from([root.id()]);
    let mut queue = VecDeque::from([0usize]);

    while let Some(parent_slot) = queue.pop_front() {
        let parent_id = match arena[parent_slot].0 {
            None => root.id(),
            Some(idx) => population[idx].id(),
        };

        for (idx, candidate) in population.iter().enumerate() {
            if candidate.channel() != channel || visited.contains(&candidate.id()) {
                continue;
            }
            if !candidate.has_parent_link_to(parent_id, filter) {
                continue;
            }

            visited.insert(candidate.id());
            let slot = arena.len();
            arena.push((Some(idx), Vec::new()));
            arena[parent_slot].1.push(slot);
            queue.push_back(slot);

            tracing::trace!(parent = %parent_id, child = %candidate.id(), "tree edge");
        }
    }

    // Assemble bottom-up so deep trees need no recursion.
    let mut built: Vec<Option<TreeNode>> = vec![None; arena.len()];
    for slot in (0..arena.len()).rev() {
        let source = match arena[slot].0 {
            None => root,
            Some(idx) => &population[idx],
        };
        let children: Vec<TreeNode> = arena[slot]
            .1
            .iter()
            .filter_map(|child| built[*child].take())
            .collect();
        let pending_children = source
            .child_links(LinkFilter::Any)
            .filter(|l| !filter.matches(l.state))
            .count();

        built[slot] = Some(TreeNode {
            peer: source.peer.clone(),
            links: source.links.clone(),
            children,
            pending_children,
        });
    }

    let root_node = built[0].take().unwrap_or_else(|| TreeNode {
        peer: root.peer.clone(),
        links: root.links.clone(),
        children: Vec::new(),
        pending_children: 0,
    });

    tracing::debug!(
        root = %root.id(),
        peers = arena.len(),
        "built tree"
    );

    TreeView { root: root_node }
}
