//! Subtree link collection
//!
//! Used on peer departure: every link referenced anywhere in the departing
//! peer's subtree, in either direction, belongs to the teardown batch.

use std::collections::BTreeSet;

use relaytree_core::LinkId;

use crate::tree::TreeView;

/// Collect every link id referenced by any node of `tree`, deduplicated
pub fn collect_subtree_links(tree: &TreeView) -> BTreeSet<LinkId> {
    let mut collected = BTreeSet::new();
    let mut stack = vec![&tree.root];

    while let Some(node) = stack.pop() {
        collected.extend(node.links.iter().map(|l| l.id));
        stack.extend(node.children.iter());
    }

    collected
}
