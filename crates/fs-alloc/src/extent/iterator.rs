use log::error;
use snafu::ensure;
use snafu_utils::Report;

use crate::{
    error::{ErrorKind, FsError, IoDataIntegritySnafu},
    node::{CONTAINER_MAX_EXTENTS, Extent, ExtentContainer, Inode, Node, NodeFinder},
};

/// Walks the extents of one inode across its node chain.
///
/// Every link is checked before it is followed. A bad link yields a single
/// `IoDataIntegrity` error, after which the iterator is exhausted.
pub struct AllocatedExtentIterator<'a, F: ?Sized> {
    finder: &'a F,
    inode: Inode,
    node_index: u32,
    container: Option<ExtentContainer>,
    local_index: usize,
    extent_index: usize,
    block_index: u64,
    failed: bool,
}

impl<'a, F> AllocatedExtentIterator<'a, F>
where
    F: NodeFinder + ?Sized,
{
    /// Starts at inode `ino`, which must be an allocated inode.
    pub fn new(finder: &'a F, ino: u32) -> Result<Self, FsError> {
        let Node::Inode(inode) = finder.get_node(ino)? else {
            return IoDataIntegritySnafu {
                node: ino,
                reason: "chain does not start at an inode",
            }
            .fail();
        };
        ensure!(
            inode.prelude.is_allocated(),
            IoDataIntegritySnafu {
                node: ino,
                reason: "inode is not allocated",
            }
        );
        Ok(Self {
            finder,
            inode,
            node_index: ino,
            container: None,
            local_index: 0,
            extent_index: 0,
            block_index: 0,
            failed: false,
        })
    }

    #[must_use]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// `true` once every extent of the inode has been returned, or after an
    /// error.
    #[must_use]
    pub fn done(&self) -> bool {
        self.failed || self.extent_index >= usize::from(self.inode.extent_count)
    }

    /// Node holding the most recently returned extent.
    #[must_use]
    pub fn node_index(&self) -> u32 {
        self.node_index
    }

    /// Extents returned so far.
    #[must_use]
    pub fn extent_index(&self) -> usize {
        self.extent_index
    }

    /// Blocks covered by the extents returned so far.
    #[must_use]
    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    fn current_extents(&self) -> &[Extent] {
        match &self.container {
            None => self.inode.inline_extents(),
            Some(container) => container.extents(),
        }
    }

    fn corrupt(&self, reason: &'static str) -> FsError {
        IoDataIntegritySnafu {
            node: self.node_index,
            reason,
        }
        .build()
    }

    fn advance_node(&mut self) -> Result<(), FsError> {
        let current = self.node_index;
        let next = match &self.container {
            None => self.inode.prelude.next_node,
            Some(container) => container.prelude.next_node,
        };
        if next == current {
            return Err(self.corrupt("next node refers to itself"));
        }
        let node = self.finder.get_node(next).map_err(|err| {
            if err.kind() == ErrorKind::InvalidArgument {
                self.corrupt("next node is out of range")
            } else {
                err
            }
        })?;
        if !node.prelude().is_allocated() {
            return Err(self.corrupt("next node is not allocated"));
        }
        let Node::Container(container) = node else {
            return Err(self.corrupt("next node is not an extent container"));
        };
        if container.previous_node != current {
            return Err(self.corrupt("next node does not link back"));
        }
        let count = usize::from(container.extent_count);
        if count == 0 || count > CONTAINER_MAX_EXTENTS {
            return Err(self.corrupt("extent container has a bad extent count"));
        }
        self.node_index = next;
        self.container = Some(container);
        self.local_index = 0;
        Ok(())
    }
}

impl<F> Iterator for AllocatedExtentIterator<'_, F>
where
    F: NodeFinder + ?Sized,
{
    type Item = Result<Extent, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done() {
            return None;
        }
        if self.local_index >= self.current_extents().len() {
            if let Err(err) = self.advance_node() {
                error!("extent chain walk failed: {}", Report::new(&err));
                self.failed = true;
                return Some(Err(err));
            }
        }
        let extent = self.current_extents()[self.local_index];
        self.local_index += 1;
        self.extent_index += 1;
        self.block_index += u64::from(extent.length());
        Some(Ok(extent))
    }
}

#[cfg(test)]
mod tests {
    use alloc::{collections::BTreeMap, vec::Vec};

    use super::*;
    use crate::{error::InvalidArgumentSnafu, node::INLINE_MAX_EXTENTS};

    #[derive(Default)]
    struct Table {
        nodes: BTreeMap<u32, Node>,
        size: u32,
    }

    impl NodeFinder for Table {
        fn get_node(&self, index: u32) -> Result<Node, FsError> {
            ensure!(
                index < self.size,
                InvalidArgumentSnafu {
                    what: "node",
                    value: u64::from(index),
                    limit: u64::from(self.size),
                }
            );
            Ok(self.nodes.get(&index).copied().unwrap_or_else(Node::free))
        }
    }

    fn extents(range: core::ops::Range<u64>) -> Vec<Extent> {
        range.map(|i| Extent::new(i * 10, 2)).collect()
    }

    /// Inode 1 with six extents: four inline, two in container 5.
    fn chained() -> Table {
        let all = extents(0..6);
        let mut inode = Inode::new();
        inode.extent_count = 6;
        inode.inline_extents.copy_from_slice(&all[..INLINE_MAX_EXTENTS]);
        inode.prelude.next_node = 5;
        let container = ExtentContainer::new(1, &all[INLINE_MAX_EXTENTS..]);
        let mut table = Table {
            size: 16,
            ..Table::default()
        };
        table.nodes.insert(1, Node::Inode(inode));
        table.nodes.insert(5, Node::Container(container));
        table
    }

    fn container_mut(table: &mut Table, index: u32) -> &mut ExtentContainer {
        match table.nodes.get_mut(&index) {
            Some(Node::Container(container)) => container,
            _ => panic!("node {index} is not a container"),
        }
    }

    fn inode_mut(table: &mut Table, index: u32) -> &mut Inode {
        match table.nodes.get_mut(&index) {
            Some(Node::Inode(inode)) => inode,
            _ => panic!("node {index} is not an inode"),
        }
    }

    fn integrity_failure(table: &Table) -> (Vec<Extent>, u32) {
        let mut iter = AllocatedExtentIterator::new(table, 1).unwrap();
        let mut seen = Vec::new();
        loop {
            match iter.next() {
                Some(Ok(extent)) => seen.push(extent),
                Some(Err(FsError::IoDataIntegrity { node, .. })) => {
                    assert!(iter.done());
                    assert!(iter.next().is_none());
                    return (seen, node);
                }
                Some(Err(err)) => panic!("unexpected error: {err}"),
                None => panic!("chain walk did not fail"),
            }
        }
    }

    #[test]
    fn test_walks_inline_and_container_extents() {
        let table = chained();
        let mut iter = AllocatedExtentIterator::new(&table, 1).unwrap();
        let walked: Vec<Extent> = iter.by_ref().map(Result::unwrap).collect();
        assert_eq!(walked, extents(0..6));
        assert!(iter.done());
        assert_eq!(iter.node_index(), 5);
        assert_eq!(iter.extent_index(), 6);
        assert_eq!(iter.block_index(), 12);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_self_referencing_container() {
        let mut table = chained();
        inode_mut(&mut table, 1).extent_count = 40;
        container_mut(&mut table, 5).prelude.next_node = 5;
        let (seen, node) = integrity_failure(&table);
        assert_eq!(seen, extents(0..6));
        assert_eq!(node, 5);
    }

    #[test]
    fn test_self_referencing_inode() {
        let mut table = chained();
        inode_mut(&mut table, 1).prelude.next_node = 1;
        let (seen, node) = integrity_failure(&table);
        assert_eq!(seen.len(), INLINE_MAX_EXTENTS);
        assert_eq!(node, 1);
    }

    #[test]
    fn test_unallocated_next_node() {
        let mut table = chained();
        inode_mut(&mut table, 1).prelude.next_node = 9;
        let (seen, node) = integrity_failure(&table);
        assert_eq!(seen.len(), INLINE_MAX_EXTENTS);
        assert_eq!(node, 1);
    }

    #[test]
    fn test_out_of_range_next_node() {
        let mut table = chained();
        inode_mut(&mut table, 1).prelude.next_node = 100;
        let (_, node) = integrity_failure(&table);
        assert_eq!(node, 1);
    }

    #[test]
    fn test_next_node_is_an_inode() {
        let mut table = chained();
        table.nodes.insert(6, Node::Inode(Inode::new()));
        inode_mut(&mut table, 1).prelude.next_node = 6;
        let (_, node) = integrity_failure(&table);
        assert_eq!(node, 1);
    }

    #[test]
    fn test_broken_back_link() {
        let mut table = chained();
        container_mut(&mut table, 5).previous_node = 3;
        let (_, node) = integrity_failure(&table);
        assert_eq!(node, 1);
    }

    #[test]
    fn test_empty_container() {
        let mut table = chained();
        container_mut(&mut table, 5).extent_count = 0;
        let (_, node) = integrity_failure(&table);
        assert_eq!(node, 1);
    }

    #[test]
    fn test_two_node_cycle_is_detected() {
        let mut table = chained();
        inode_mut(&mut table, 1).extent_count = 200;
        let more = extents(6..8);
        let mut second = ExtentContainer::new(5, &more);
        second.prelude.next_node = 5;
        table.nodes.insert(7, Node::Container(second));
        container_mut(&mut table, 5).prelude.next_node = 7;
        let (seen, node) = integrity_failure(&table);
        assert_eq!(seen, extents(0..8));
        assert_eq!(node, 7);
    }

    #[test]
    fn test_start_must_be_allocated_inode() {
        let table = chained();
        assert!(matches!(
            AllocatedExtentIterator::new(&table, 2),
            Err(FsError::IoDataIntegrity { node: 2, .. })
        ));
        assert!(matches!(
            AllocatedExtentIterator::new(&table, 5),
            Err(FsError::IoDataIntegrity { node: 5, .. })
        ));
    }
}
