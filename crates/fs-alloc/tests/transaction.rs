#![cfg(test)]

use std::sync::Arc;

use fs_alloc::{
    AllocatedExtentIterator, BlockDevice as _, BufferedOperation, DirectWriteback, ErrorKind,
    Extent, Filesystem, FormatOptions, Inode, MountOptions, Node, NodeFinder as _, RamDevice,
    format,
    layout::{BLOCK_SIZE, INODES_PER_BLOCK, inode_position},
};

fn mount(device: &Arc<RamDevice>, options: MountOptions) -> Filesystem {
    let writeback = Box::new(DirectWriteback::new(device.clone()));
    Filesystem::open(device.clone(), writeback, options).unwrap()
}

fn plain_device() -> Arc<RamDevice> {
    let device = Arc::new(RamDevice::new(512));
    format(device.as_ref(), &FormatOptions { inode_count: 64 }).unwrap();
    device
}

fn fvm_device(slice_count: u64) -> Arc<RamDevice> {
    let device = Arc::new(RamDevice::with_fvm((BLOCK_SIZE * 16) as u64, slice_count));
    format(device.as_ref(), &FormatOptions::default()).unwrap();
    device
}

/// Writes a file of `extent_count` single-block extents and returns its
/// inode number and extents.
fn write_file(fs: &Filesystem, extent_count: usize) -> (u32, Vec<Extent>) {
    let containers = fs_alloc::containers_needed(extent_count);
    let mut transaction = fs.begin_transaction(1 + containers, extent_count).unwrap();
    let ino = transaction.create_inode(&Inode::new()).unwrap();
    let extents: Vec<Extent> = (0..extent_count)
        .map(|_| Extent::new(transaction.allocate_block() as u64, 1))
        .collect();
    let nodes = transaction.populate_inode(ino, &extents).unwrap();
    assert_eq!(nodes.len(), containers);
    transaction.commit().unwrap();
    (ino, extents)
}

fn walk(fs: &Filesystem, ino: u32) -> Vec<Extent> {
    AllocatedExtentIterator::new(fs.inodes(), ino)
        .unwrap()
        .map(Result::unwrap)
        .collect()
}

#[test]
fn committed_file_survives_remount() {
    let device = plain_device();
    let (ino, extents) = {
        let fs = mount(&device, MountOptions::default());
        write_file(&fs, 40)
    };

    let fs = mount(&device, MountOptions::default());
    assert_eq!(walk(&fs, ino), extents);
    assert_eq!(fs.inodes().load(ino).unwrap().block_count, 40);
    for extent in &extents {
        assert!(fs.block_allocator().is_allocated(extent.start() as usize));
    }
    let info = fs.superblock();
    assert_eq!(info.alloc_block_count, 41);
    assert_eq!(info.alloc_inode_count, 4);
    assert_eq!(fs.block_allocator().pool_allocated(), 41);
}

#[test]
fn dropped_transaction_leaves_device_untouched() {
    let device = plain_device();
    let fs = mount(&device, MountOptions::default());
    let before = fs.superblock();
    {
        let mut transaction = fs.begin_transaction(1, 3).unwrap();
        let ino = transaction.create_inode(&Inode::new()).unwrap();
        transaction.allocate_block();
        assert!(fs.inodes().allocator().is_allocated(ino as usize));
    }
    assert_eq!(fs.superblock(), before);
    assert_eq!(fs.block_allocator().pool_reserved(), 0);
    assert_eq!(fs.block_allocator().runs(), vec![0..1]);

    let fs = mount(&device, MountOptions::default());
    assert_eq!(fs.superblock(), before);
    assert_eq!(fs.inodes().allocator().runs(), vec![0..1]);
}

#[test]
fn released_inode_frees_everything_on_commit() {
    let device = plain_device();
    let fs = mount(&device, MountOptions::default());
    let blocks = fs.block_allocator().pool_available();
    let inodes = fs.inodes().allocator().pool_available();
    let (ino, extents) = write_file(&fs, 12);

    let mut transaction = fs.begin_transaction(0, 0).unwrap();
    transaction.release_inode(ino).unwrap();
    // Frees are deferred until commit.
    assert!(fs.block_allocator().is_allocated(extents[0].start() as usize));
    assert!(fs.inodes().allocator().is_allocated(ino as usize));
    transaction.commit().unwrap();

    assert_eq!(fs.block_allocator().pool_available(), blocks);
    assert_eq!(fs.inodes().allocator().pool_available(), inodes);
    let fs = mount(&device, MountOptions::default());
    assert_eq!(fs.block_allocator().pool_available(), blocks);
    assert_eq!(fs.inodes().allocator().pool_available(), inodes);
    assert_eq!(fs.superblock().alloc_inode_count, 1);
    assert!(AllocatedExtentIterator::new(fs.inodes(), ino).is_err());
}

#[test]
fn swapped_block_is_freed_on_commit() {
    let device = plain_device();
    let fs = mount(&device, MountOptions::default());
    let mut transaction = fs.begin_transaction(0, 1).unwrap();
    let old = transaction.allocate_block();
    transaction.commit().unwrap();

    let mut transaction = fs.begin_transaction(0, 1).unwrap();
    let new = transaction.swap_block(Some(old));
    assert_ne!(new, old);
    assert!(fs.block_allocator().is_allocated(old));
    transaction.enqueue_data(BufferedOperation::write(
        fs.data_block(new),
        vec![3; BLOCK_SIZE],
    ));
    transaction.commit().unwrap();

    assert!(!fs.block_allocator().is_allocated(old));
    assert!(fs.block_allocator().is_allocated(new));
    let mut buf = vec![0; BLOCK_SIZE];
    device.read_blocks(fs.data_block(new), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 3));
}

#[test]
fn corrupted_container_is_reported() {
    let device = plain_device();
    let (ino, container) = {
        let fs = mount(&device, MountOptions::default());
        let (ino, _) = write_file(&fs, 10);
        let container = fs.inodes().load(ino).unwrap().prelude.next_node;
        (ino, container)
    };

    let fs = mount(&device, MountOptions::default());
    let (block, offset) = inode_position(container);
    let table_block = u64::from(fs.superblock().ino_block) + block as u64;
    let mut buf = vec![0; BLOCK_SIZE];
    device.read_blocks(table_block, &mut buf).unwrap();
    // Point the container's back link somewhere else.
    buf[offset + 8..offset + 12].copy_from_slice(&(container + 7).to_le_bytes());
    device.write_blocks(table_block, &buf).unwrap();

    let fs = mount(&device, MountOptions::default());
    let mut iter = AllocatedExtentIterator::new(fs.inodes(), ino).unwrap();
    let results: Vec<_> = iter.by_ref().collect();
    assert_eq!(results.len(), 5);
    assert!(results[..4].iter().all(Result::is_ok));
    let err = results[4].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoDataIntegrity);
    assert!(iter.done());
    assert_eq!(iter.next().map(|r| r.is_ok()), None);
}

#[test]
fn block_pool_grows_by_a_slice() {
    let device = fvm_device(8);
    let fs = mount(&device, MountOptions::default());
    assert_eq!(fs.block_allocator().pool_available(), 15);

    let mut transaction = fs.begin_transaction(0, 20).unwrap();
    assert_eq!(fs.superblock().block_count, 32);
    let blocks: Vec<usize> = (0..20).map(|_| transaction.allocate_block()).collect();
    let last = *blocks.last().unwrap();
    transaction.enqueue_data(BufferedOperation::write(
        fs.data_block(last),
        vec![1; BLOCK_SIZE],
    ));
    transaction.commit().unwrap();
    assert_eq!(device.volume_info().unwrap().allocated_slices, 6);

    let fs = mount(&device, MountOptions::default());
    let info = fs.superblock();
    assert_eq!(info.block_count, 32);
    assert_eq!(info.dat_slices, 2);
    assert_eq!(info.alloc_block_count, 21);
    assert_eq!(fs.block_allocator().pool_available(), 11);
    for block in blocks {
        assert!(fs.block_allocator().is_allocated(block));
    }
}

#[test]
fn inode_pool_grows_with_a_zeroed_table() {
    let device = fvm_device(8);
    let fs = mount(&device, MountOptions::default());
    let initial = fs.inodes().inode_count();
    assert_eq!(initial, 16 * INODES_PER_BLOCK);

    let mut transaction = fs.begin_transaction(initial, 0).unwrap();
    let mut last = 0;
    for _ in 0..initial {
        last = transaction.create_inode(&Inode::new()).unwrap();
    }
    assert!(last as usize >= initial);
    transaction.commit().unwrap();

    let fs = mount(&device, MountOptions::default());
    assert_eq!(fs.inodes().inode_count(), initial * 2);
    assert_eq!(fs.superblock().ino_slices, 2);
    assert!(fs.inodes().load(last).unwrap().prelude.is_allocated());
    let unused = u32::try_from(initial * 2 - 1).unwrap();
    assert!(!fs.inodes().load(unused).unwrap().prelude.is_allocated());
}

#[test]
fn growth_can_be_disabled() {
    let device = fvm_device(8);
    let fs = mount(
        &device,
        MountOptions {
            allow_growth: false,
            ..MountOptions::default()
        },
    );
    let err = fs.begin_transaction(0, 20).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::OutOfSpace);
    assert_eq!(fs.superblock().block_count, 16);
    assert_eq!(fs.block_allocator().pool_reserved(), 0);
    assert!(fs.begin_transaction(0, 15).is_ok());
}

#[test]
fn exhausted_volume_reports_out_of_space() {
    // Slice 0 plus one slice per region leaves nothing to grow into.
    let device = fvm_device(5);
    let fs = mount(&device, MountOptions::default());
    let err = fs.begin_transaction(0, 16).err().unwrap();
    assert!(err.kind().is_out_of_space());
    assert_eq!(fs.superblock().block_count, 16);
}

#[test]
fn dropped_release_keeps_the_chain() {
    let fs = mount(&plain_device(), MountOptions::default());
    let (ino, extents) = write_file(&fs, 10);
    {
        let mut transaction = fs.begin_transaction(0, 0).unwrap();
        transaction.release_inode(ino).unwrap();
        assert!(AllocatedExtentIterator::new(fs.inodes(), ino).is_err());
    }
    assert_eq!(walk(&fs, ino), extents);
    assert!(fs.inodes().allocator().is_allocated(ino as usize));
    for extent in &extents {
        assert!(fs.block_allocator().is_allocated(extent.start() as usize));
    }

    let mut transaction = fs.begin_transaction(0, 0).unwrap();
    transaction.release_inode(ino).unwrap();
    transaction.commit().unwrap();
    assert!(!fs.inodes().allocator().is_allocated(ino as usize));
    assert_eq!(fs.block_allocator().pool_allocated(), 1);
}

#[test]
fn dropped_populate_leaves_the_inode_empty() {
    let fs = mount(&plain_device(), MountOptions::default());
    let mut transaction = fs.begin_transaction(1, 0).unwrap();
    let ino = transaction.create_inode(&Inode::new()).unwrap();
    transaction.commit().unwrap();

    let extent_count = 10;
    let containers = fs_alloc::containers_needed(extent_count);
    let nodes = {
        let mut transaction = fs.begin_transaction(containers, extent_count).unwrap();
        let extents: Vec<Extent> = (0..extent_count)
            .map(|_| Extent::new(transaction.allocate_block() as u64, 1))
            .collect();
        let nodes = transaction.populate_inode(ino, &extents).unwrap();
        assert_eq!(fs.inodes().load(ino).unwrap().extent_count, 10);
        nodes
    };
    assert_eq!(nodes.len(), containers);
    assert_eq!(fs.inodes().load(ino).unwrap().extent_count, 0);
    for node in nodes {
        assert_eq!(fs.inodes().get_node(node).unwrap(), Node::free());
    }
    assert!(walk(&fs, ino).is_empty());

    let mut transaction = fs.begin_transaction(containers, extent_count).unwrap();
    let extents: Vec<Extent> = (0..extent_count)
        .map(|_| Extent::new(transaction.allocate_block() as u64, 1))
        .collect();
    transaction.populate_inode(ino, &extents).unwrap();
    transaction.commit().unwrap();
    assert_eq!(walk(&fs, ino), extents);
}
