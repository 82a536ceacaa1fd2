//! Upstream selection
//!
//! Picks a relay parent for a joining peer. The walk is breadth-first from
//! the root and takes the first node with a free child slot, so shallower
//! and earlier branches fill up first. Selection never mutates anything;
//! the caller reserves the link as a separate step.

use std::collections::VecDeque;

use relaytree_core::{Peer, PeerId};

use crate::tree::{TreeNode, TreeView};

/// First node in breadth-first order that can take another child
///
/// A node qualifies when it is not `candidate` and its load (attached plus
/// in-progress children) is below `fanout`. The candidate's own subtree is
/// never searched, so a peer cannot be placed below itself. Returns `None`
/// when the tree is saturated.
pub fn choose_upstream(candidate: PeerId, tree: &TreeView, fanout: usize) -> Option<&Peer> {
    let mut queue: VecDeque<&TreeNode> = VecDeque::from([&tree.root]);

    while let Some(node) = queue.pop_front() {
        if node.id() == candidate {
            continue;
        }
        if node.load() < fanout {
            tracing::debug!(
                candidate = %candidate,
                upstream = %node.id(),
                load = node.load(),
                "selected upstream"
            );
            return Some(&node.peer);
        }
        queue.extend(node.children.iter());
    }

    tracing::debug!(candidate = %candidate, peers = tree.len(), "no upstream capacity");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PopulationBuilder;
    use proptest::prelude::*;
    use relaytree_core::{ChannelId, LinkFilter, LinkState};

    fn channel() -> PopulationBuilder {
        PopulationBuilder::new(ChannelId::new(1))
    }

    fn pick(builder: PopulationBuilder, candidate: u64) -> Option<u64> {
        let population = builder.build();
        let tree = population.build_tree(PeerId::new(1), LinkFilter::default()).unwrap();
        choose_upstream(PeerId::new(candidate), &tree, 2).map(|p| p.id.0)
    }

    #[test]
    fn test_empty_root_is_chosen() {
        assert_eq!(pick(channel().broadcaster(1).viewer(2), 2), Some(1));
    }

    #[test]
    fn test_root_with_one_child_still_chosen() {
        let builder = channel()
            .broadcaster(1)
            .viewer(2)
            .viewer(3)
            .link(1, 2, 1, LinkState::Established);
        assert_eq!(pick(builder, 3), Some(1));
    }

    #[test]
    fn test_saturated_root_moves_down_in_bfs_order() {
        let builder = channel()
            .broadcaster(1)
            .viewer(2)
            .viewer(3)
            .viewer(4)
            .link(1, 2, 1, LinkState::Established)
            .link(2, 3, 1, LinkState::Established);
        assert_eq!(pick(builder, 4), Some(2));
    }

    #[test]
    fn test_in_progress_links_occupy_slots() {
        // root has one established and one connecting child
        let builder = channel()
            .broadcaster(1)
            .viewer(2)
            .viewer(3)
            .viewer(4)
            .link(1, 2, 1, LinkState::Established)
            .link(2, 3, 1, LinkState::Connecting);
        assert_eq!(pick(builder, 4), Some(2));
    }

    #[test]
    fn test_saturated_tree_returns_none() {
        // root full of in-progress children that are not part of the tree
        let builder = channel()
            .broadcaster(1)
            .viewer(2)
            .viewer(3)
            .viewer(4)
            .link(1, 2, 1, LinkState::Reserved)
            .link(2, 3, 1, LinkState::Connecting);
        assert_eq!(pick(builder, 4), None);
    }

    #[test]
    fn test_candidate_and_its_subtree_skipped() {
        // 2 sits under a full root and has a free slot itself
        let builder = channel()
            .broadcaster(1)
            .viewer(2)
            .viewer(3)
            .viewer(4)
            .link(1, 2, 1, LinkState::Established)
            .link(2, 3, 1, LinkState::Established)
            .link(3, 4, 2, LinkState::Established);
        assert_eq!(pick(builder.clone(), 2), Some(3));
        assert_eq!(pick(builder, 5), Some(2));
    }

    #[test]
    fn test_fanout_bound_respected() {
        let population = channel()
            .broadcaster(1)
            .viewer(2)
            .viewer(3)
            .link(1, 2, 1, LinkState::Established)
            .link(2, 3, 1, LinkState::Established)
            .build();
        let tree = population.build_tree(PeerId::new(1), LinkFilter::default()).unwrap();

        assert_eq!(choose_upstream(PeerId::new(9), &tree, 3).map(|p| p.id.0), Some(1));
        assert_eq!(choose_upstream(PeerId::new(9), &tree, 2).map(|p| p.id.0), Some(2));
        assert_eq!(choose_upstream(PeerId::new(9), &tree, 0), None);
    }

    /// A random population built by letting each new viewer pick a parent
    /// among the peers before it, with a random link state.
    fn arb_population() -> impl Strategy<Value = (Vec<(u64, u8)>, u64)> {
        (
            prop::collection::vec((any::<u64>(), 0u8..5), 1..40),
            any::<u64>(),
        )
    }

    fn grow(shape: &[(u64, u8)]) -> PopulationBuilder {
        let mut builder = channel().broadcaster(1);
        for (i, (parent_seed, state)) in shape.iter().enumerate() {
            let id = i as u64 + 2;
            let parent = 1 + parent_seed % (id - 1);
            builder = builder
                .viewer(id)
                .link(id, id, parent, LinkState::ALL[*state as usize]);
        }
        builder
    }

    proptest! {
        #[test]
        fn prop_selection_is_deterministic((shape, candidate) in arb_population()) {
            let population = grow(&shape).build();
            let candidate = PeerId::new(2 + candidate % (shape.len() as u64 + 1));

            let first_tree = population.build_tree(PeerId::new(1), LinkFilter::default()).unwrap();
            let second_tree = population.build_tree(PeerId::new(1), LinkFilter::default()).unwrap();
            prop_assert_eq!(&first_tree, &second_tree);

            let first = choose_upstream(candidate, &first_tree, 2).map(|p| p.id);
            let second = choose_upstream(candidate, &second_tree, 2).map(|p| p.id);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_selected_parent_has_free_slot((shape, candidate) in arb_population()) {
            let population = grow(&shape).build();
            let tree = population.build_tree(PeerId::new(1), LinkFilter::default()).unwrap();
            let candidate = PeerId::new(2 + candidate % (shape.len() as u64 + 1));

            if let Some(parent) = choose_upstream(candidate, &tree, 2) {
                prop_assert_ne!(parent.id, candidate);
                let node = tree.find(parent.id).unwrap();
                prop_assert!(node.load() < 2);
            }
        }
    }
}
