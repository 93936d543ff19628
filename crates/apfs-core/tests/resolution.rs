#![forbid(unsafe_code)]
//! End-to-end resolution against synthesized container images.

use apfs_btree::{OidKeyComparer, SearchMode};
use apfs_core::{
    AddressResolver, ApfsError, BlockSource, ByteBlockSource, Container, Endian, MemoryByteDevice,
    ObjectId, ObjectRef, OmapKey, OmapValue, Paddr, ResolverOptions, Xid,
};
use apfs_harness::{ContainerBuilder, EntryLayout, ImageBuilder, TreeBuilder, u64_entries};
use apfs_ondisk::KvGeometry;
use apfs_ondisk::omap::{OMAP_SNAPSHOT_DELETED, OMAP_VAL_DELETED, OMAP_VAL_ENCRYPTED};
use apfs_types::{OBJECT_TYPE_FS, OBJECT_TYPE_FSTREE, OBJECT_TYPE_SPACEMAN};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

type MemContainer = Container<ByteBlockSource<MemoryByteDevice>>;

const ENDIANS: [Endian; 2] = [Endian::Little, Endian::Big];

fn open(builder: &ContainerBuilder, options: ResolverOptions) -> MemContainer {
    let source = builder.build().expect("build image").into_source().expect("source");
    Container::open(source, options).expect("open container")
}

fn virtual_ref(oid: u64, xid: u64) -> ObjectRef {
    ObjectRef::Virtual {
        oid: ObjectId(oid),
        xid: Xid(xid),
    }
}

#[test]
fn three_entry_tree_through_the_resolver() {
    for endian in ENDIANS {
        let tree = TreeBuilder::new(
            endian,
            4096,
            EntryLayout::Fixed(KvGeometry {
                key_size: 8,
                value_size: 8,
            }),
        )
        .first_paddr(3)
        .build(&u64_entries(endian, &[(10, 100), (20, 200), (30, 300)]))
        .expect("tree");
        let mut image = ImageBuilder::new(4096, 8);
        for node in &tree.nodes {
            image.put(node.paddr, &node.bytes).expect("place node");
        }
        let resolver = AddressResolver::new(
            image.into_source().expect("source"),
            endian,
            ResolverOptions::default(),
        );
        let navigator = resolver.navigator(OidKeyComparer);
        let root = tree.root_ref(Xid(1));
        let find = |key: u64| {
            navigator
                .find(root, &key, SearchMode::ClosestLower)
                .map(|entry| endian.read_u64(&entry.value, 0).expect("value"))
        };

        assert!(find(5).unwrap_err().is_not_found());
        assert_eq!(find(10).unwrap(), 100);
        assert_eq!(find(25).unwrap(), 200);
        assert_eq!(find(30).unwrap(), 300);
        assert!(find(40).unwrap_err().is_not_found());
    }
}

#[test]
fn composite_keys_pick_newest_version_not_after_xid() {
    let key = |oid: u64, xid: u64| OmapKey {
        oid: ObjectId(oid),
        xid: Xid(xid),
    };
    let value = |paddr: u64| OmapValue {
        flags: 0,
        size: 4096,
        paddr: Paddr(paddr),
    };
    for endian in ENDIANS {
        let container = open(
            &ContainerBuilder::new(endian)
                .mapping(key(10, 5), value(105))
                .mapping(key(10, 10), value(110))
                .mapping(key(20, 3), value(203)),
            ResolverOptions::default(),
        );
        let resolver = container.resolver();
        let omap = resolver.object_map().expect("object map");
        let paddr = |oid: u64, xid: u64| {
            omap.resolve(resolver, ObjectId(oid), Xid(xid))
                .map(|v| v.paddr)
        };

        assert_eq!(paddr(10, 8).unwrap(), Paddr(105));
        assert_eq!(paddr(10, 100).unwrap(), Paddr(110));
        assert_eq!(paddr(20, 5).unwrap(), Paddr(203));
        assert!(paddr(99, 0).unwrap_err().is_not_found());
        assert_eq!(
            omap.resolve_latest(resolver, ObjectId(10)).unwrap().paddr,
            Paddr(110)
        );
    }
}

#[test]
fn virtual_objects_resolve_in_both_byte_orders() {
    for endian in ENDIANS {
        let builder = ContainerBuilder::new(endian)
            .volume(0x402, 4)
            .volume(0x402, 12)
            .virtual_object(0x500, 2, OBJECT_TYPE_FSTREE, 0)
            .virtual_object(0x500, 7, OBJECT_TYPE_FSTREE, 0);
        let container = open(&builder, ResolverOptions::default());
        assert_eq!(container.endian(), endian);
        assert_eq!(container.xid(), Xid(10));

        // The container checkpoint is at xid 10, so version 12 is invisible.
        let volume = container.volume(0).expect("volume");
        assert_eq!(volume.header.xid, Xid(4));
        assert_eq!(volume.header.type_code(), OBJECT_TYPE_FS);
        assert_eq!(container.volumes().expect("volumes").len(), 1);

        let resolver = container.resolver();
        assert_eq!(
            resolver.resolve(virtual_ref(0x500, 6)).unwrap().header.xid,
            Xid(2)
        );
        assert_eq!(
            resolver.resolve(virtual_ref(0x500, 7)).unwrap().header.xid,
            Xid(7)
        );
        assert_eq!(
            resolver
                .resolve(ObjectRef::Virtual {
                    oid: ObjectId(0x500),
                    xid: Xid::LATEST
                })
                .unwrap()
                .header
                .xid,
            Xid(7)
        );
        assert!(resolver.resolve(virtual_ref(0x500, 1)).unwrap_err().is_not_found());
        assert!(resolver.resolve(virtual_ref(0x501, 9)).unwrap_err().is_not_found());
        assert!(container.volume(1).unwrap_err().is_not_found());
    }
}

#[test]
fn multi_level_object_map() {
    let mut builder = ContainerBuilder::new(Endian::Little).omap_fanout(4);
    for i in 0..40_u64 {
        builder = builder.virtual_object(0x1000 + i, 3 + i % 5, OBJECT_TYPE_FSTREE, 0);
    }
    let built = builder.build().expect("build");
    assert!(built.layout.omap_tree_nodes > 4);
    let placed = built.layout.virtual_objects.clone();
    let container = Container::open(built.into_source().expect("source"), ResolverOptions::default())
        .expect("open");

    for object in placed {
        let resolved = container
            .resolver()
            .resolve(ObjectRef::Virtual {
                oid: object.oid,
                xid: Xid::LATEST,
            })
            .expect("resolve");
        assert_eq!(resolved.paddr, object.paddr);
        assert_eq!(resolved.header.oid, object.oid);
    }
}

#[test]
fn deleted_and_encrypted_mappings() {
    let container = open(
        &ContainerBuilder::new(Endian::Little)
            .virtual_object(0x600, 5, OBJECT_TYPE_FSTREE, 0)
            .virtual_object(0x600, 7, OBJECT_TYPE_FSTREE, OMAP_VAL_DELETED)
            .virtual_object(0x601, 5, OBJECT_TYPE_FSTREE, OMAP_VAL_ENCRYPTED),
        ResolverOptions::default(),
    );
    let resolver = container.resolver();

    assert_eq!(resolver.resolve(virtual_ref(0x600, 6)).unwrap().header.xid, Xid(5));
    let err = resolver.resolve(virtual_ref(0x600, 7)).unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert!(!err.is_corruption());

    let raw = resolver
        .lookup_mapping(ObjectId(0x600), Xid(9))
        .expect("deleted record is still a record");
    assert!(raw.is_deleted());

    assert!(matches!(
        resolver.resolve(virtual_ref(0x601, 5)).unwrap_err(),
        ApfsError::UnsupportedFeature(_)
    ));
}

#[test]
fn resolution_is_idempotent() {
    let container = open(
        &ContainerBuilder::new(Endian::Big)
            .ephemeral(0x400, OBJECT_TYPE_SPACEMAN)
            .volume(0x402, 3),
        ResolverOptions::default(),
    );
    let resolver = container.resolver();
    for reference in [
        virtual_ref(0x402, 10),
        ObjectRef::Ephemeral(ObjectId(0x400)),
        ObjectRef::Physical(container.superblock().omap_oid),
    ] {
        let first = resolver.resolve(reference).expect("first");
        let second = resolver.resolve(reference).expect("second");
        assert_eq!(first, second);
    }
}

#[test]
fn cache_does_not_change_results() {
    let mut builder = ContainerBuilder::new(Endian::Little)
        .omap_fanout(3)
        .ephemeral(0x400, OBJECT_TYPE_SPACEMAN);
    for i in 0..12_u64 {
        builder = builder
            .virtual_object(0x700 + i, 2, OBJECT_TYPE_FSTREE, 0)
            .virtual_object(0x700 + i, 6, OBJECT_TYPE_FSTREE, 0);
    }
    let cached = open(&builder, ResolverOptions::default());
    let uncached = open(&builder, ResolverOptions::uncached());
    assert!(!uncached.resolver().cache().is_enabled());

    for round in 0..2 {
        for oid in 0x6FF..0x70D_u64 {
            for xid in [1, 2, 4, 6, 9] {
                let a = cached.resolver().resolve(virtual_ref(oid, xid));
                let b = uncached.resolver().resolve(virtual_ref(oid, xid));
                match (a, b) {
                    (Ok(a), Ok(b)) => assert_eq!(a, b),
                    (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
                    (a, b) => panic!("round {round} oid {oid:#x} xid {xid}: {a:?} vs {b:?}"),
                }
            }
        }
    }
    assert!(cached.resolver().cache().hits() > 0);
    assert!(uncached.resolver().cache().is_empty());
    assert_eq!(uncached.resolver().cache().misses(), 0);
}

#[test]
fn flipped_bytes_are_corruption() {
    let builder = ContainerBuilder::new(Endian::Little)
        .volume(0x402, 3)
        .ephemeral(0x400, OBJECT_TYPE_SPACEMAN);
    let built = builder.build().expect("build");
    let layout = built.layout.clone();

    // Payload of the mapped object.
    let mut image = built.image.clone();
    let volume_paddr = layout.virtual_objects[0].paddr;
    image.block_mut(volume_paddr).expect("volume block")[200] ^= 0x40;
    let container =
        Container::open(image.into_source().expect("source"), ResolverOptions::default())
            .expect("open");
    let err = container.volume(0).unwrap_err();
    assert!(
        matches!(err, ApfsError::CorruptObject { block, .. } if block == volume_paddr.0),
        "{err:?}"
    );

    // An object-map tree node on the way.
    let mut image = built.image.clone();
    image.block_mut(layout.omap_tree_root).expect("omap root")[60] ^= 0x01;
    let container =
        Container::open(image.into_source().expect("source"), ResolverOptions::default())
            .expect("open");
    let err = container.volume(0).unwrap_err();
    assert!(
        matches!(err, ApfsError::CorruptObject { block, .. } if block == layout.omap_tree_root.0),
        "{err:?}"
    );
    // Unrelated ephemeral objects still resolve.
    container
        .resolver()
        .resolve(ObjectRef::Ephemeral(ObjectId(0x400)))
        .expect("ephemeral unaffected");

    // The container superblock itself.
    let mut image = built.image.clone();
    image.block_mut(Paddr(0)).expect("block 0")[0x50] ^= 0xFF;
    let err = Container::open(image.into_source().expect("source"), ResolverOptions::default())
        .unwrap_err();
    assert!(matches!(err, ApfsError::CorruptObject { block: 0, .. }), "{err:?}");
}

#[test]
fn wrong_magic_is_a_format_error() {
    let mut image = ImageBuilder::new(4096, 4);
    image.put(Paddr(0), &[0_u8; 4096]).expect("put");
    let err = Container::open(image.into_source().expect("source"), ResolverOptions::default())
        .unwrap_err();
    assert!(matches!(err, ApfsError::Format(_)), "{err:?}");
}

#[test]
fn snapshot_tree_is_listed() {
    let container = open(
        &ContainerBuilder::new(Endian::Big)
            .snapshot(4, 0)
            .snapshot(8, OMAP_SNAPSHOT_DELETED)
            .snapshot(6, 0),
        ResolverOptions::default(),
    );
    let resolver = container.resolver();
    let omap = resolver.object_map().expect("object map");
    assert_eq!(omap.most_recent_snapshot_xid(), Some(Xid(8)));

    let snapshots = omap.snapshots(resolver).expect("snapshots");
    let xids: Vec<Xid> = snapshots.iter().map(|(xid, _)| *xid).collect();
    assert_eq!(xids, vec![Xid(4), Xid(6), Xid(8)]);
    assert!(!snapshots[0].1.is_deleted());
    assert!(snapshots[2].1.is_deleted());

    let plain = open(&ContainerBuilder::new(Endian::Big), ResolverOptions::default());
    let omap = plain.resolver().object_map().expect("object map");
    assert_eq!(omap.most_recent_snapshot_xid(), None);
    assert!(omap.snapshots(plain.resolver()).expect("snapshots").is_empty());
}

#[test]
fn shared_container_across_threads() {
    let mut builder = ContainerBuilder::new(Endian::Little).omap_fanout(4);
    for i in 0..24_u64 {
        builder = builder.virtual_object(0x800 + i, 4, OBJECT_TYPE_FSTREE, 0);
    }
    let container = Arc::new(open(
        &builder,
        ResolverOptions {
            node_cache_capacity: 8,
            node_cache_shards: 4,
            ..ResolverOptions::default()
        },
    ));
    let expected: Vec<Paddr> = (0..24_u64)
        .map(|i| {
            container
                .resolver()
                .resolve(virtual_ref(0x800 + i, 9))
                .expect("resolve")
                .paddr
        })
        .collect();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let container = Arc::clone(&container);
            let expected = expected.clone();
            thread::spawn(move || {
                for round in 0..10_u64 {
                    let i = (round * 7 + t) % 24;
                    let index = usize::try_from(i).expect("index");
                    let got = container
                        .resolver()
                        .resolve(virtual_ref(0x800 + i, 9))
                        .expect("resolve");
                    assert_eq!(got.paddr, expected[index]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }
}

#[test]
fn open_file_sniffs_block_size() {
    use std::io::Write;

    let bytes = ContainerBuilder::new(Endian::Little)
        .block_size(8192)
        .volume(0x402, 2)
        .build()
        .expect("build")
        .into_bytes()
        .expect("bytes");
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(&bytes).expect("write");
    file.flush().expect("flush");

    let container = Container::open_file(file.path(), ResolverOptions::default()).expect("open");
    assert_eq!(container.resolver().source().block_size(), 8192);
    assert_eq!(container.volume(0).expect("volume").bytes.len(), 8192);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn omap_lookup_matches_model(
        records in proptest::collection::btree_set((0x400_u64..0x410, 1_u64..20), 1..60),
        probes in proptest::collection::vec((0x3FF_u64..0x411, 0_u64..24), 1..40),
    ) {
        let model: BTreeMap<(u64, u64), u64> = records
            .iter()
            .enumerate()
            .map(|(i, key)| (*key, 5000 + i as u64))
            .collect();
        let mut builder = ContainerBuilder::new(Endian::Little).omap_fanout(4);
        for ((oid, xid), paddr) in &model {
            builder = builder.mapping(
                OmapKey { oid: ObjectId(*oid), xid: Xid(*xid) },
                OmapValue { flags: 0, size: 4096, paddr: Paddr(*paddr) },
            );
        }
        let container = open(&builder, ResolverOptions::default());
        let resolver = container.resolver();

        for (oid, xid) in probes {
            let expected = model
                .range(..=(oid, xid))
                .next_back()
                .filter(|((found_oid, _), _)| *found_oid == oid)
                .map(|(_, paddr)| Paddr(*paddr));
            let got = resolver.lookup_mapping(ObjectId(oid), Xid(xid));
            match expected {
                Some(paddr) => prop_assert_eq!(got.unwrap().paddr, paddr),
                None => prop_assert!(got.is_err()),
            }
        }
    }
}
