// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Bounded caches: eviction order, locks, flushes and teardown.
#[cfg(target_arch = "wasm32")]
wasm_bindgen_test::wasm_bindgen_test_configure!(run_in_browser);

mod common;

use common::{config, description, fixture};
use pages_and_tiles::bittricks::{encode_page, morton_address};
use pages_and_tiles::cache::page_pool::PageKey;
use pages_and_tiles::cache::physical_space::LayerFormat;
use pages_and_tiles::requests::feedback::NoFeedback;
use pages_and_tiles::{
    AllocatedVtDescription, Config, EvictionPolicy, LayerBinding, LocalTile, PageMapping, ProduceKind,
    ProducerDescription, RequestPriority, TexelRegion, TileRegion, VecFeedback, VirtualTextureSystem,
};

fn is_resident(f: &common::Fixture, x: u32) -> bool {
    let key = PageKey::new(f.handle, 0, morton_address(x, 0), 0);
    f.system
        .with_pool(f.physical_space(), |pool| pool.find_page_address(&key).is_some())
        .expect("pool")
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn oldest_tile_is_evicted() {
    let mut f = fixture(config(), description(8, 1, 0, 4));
    for x in 0..4 {
        let texel = f.texel(0, x, 0);
        assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    }
    f.producer.take();

    let texel = f.texel(0, 4, 0);
    let report = f.update_with(vec![texel]);
    assert_eq!(report.tiles_produced, 1);
    assert_eq!(f.producer.take()[0].targets[0].expect("target").slot, 0);
    assert!(!is_resident(&f, 0));
    assert!(!f.is_mapped(0, 0, 0));
    assert!(is_resident(&f, 4));
    assert!(f.is_mapped(0, 4, 0));
    assert_eq!(f.num_allocated(), 4);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn locked_tile_is_never_evicted() {
    let mut f = fixture(config(), description(8, 1, 0, 4));
    let a = f.local(0, 0, 0);
    f.system.lock_tile(a).expect("lock");
    assert_eq!(f.update().tiles_produced, 1);
    assert_eq!(f.num_locked(), 1);

    //three free slots; the fourth tile finds only A (locked) and tiles used this frame
    let texels = (1..5).map(|x| f.texel(0, x, 0)).collect();
    let report = f.update_with(texels);
    assert_eq!(report.tiles_produced, 3);
    assert_eq!(report.allocation_failures, 1);
    assert!(!is_resident(&f, 4));
    assert!(is_resident(&f, 0));

    //a frame later the oldest unlocked tile gives way, A still stays
    let texel = f.texel(0, 4, 0);
    let report = f.update_with(vec![texel]);
    assert_eq!(report.tiles_produced, 1);
    assert!(is_resident(&f, 0));
    assert!(!is_resident(&f, 1));
    assert!(!f.is_mapped(0, 1, 0));
    assert!(f.is_mapped(0, 4, 0));

    //and the evicted tile can come back
    let texel = f.texel(0, 1, 0);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    assert!(f.is_mapped(0, 1, 0));
    assert!(is_resident(&f, 0));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn locks_are_counted() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let a = f.local(0, 1, 1);
    f.system.lock_tile(a).expect("lock");
    f.system.lock_tile(a).expect("lock");
    f.update();
    assert_eq!(f.num_locked(), 1);

    f.system.unlock_tile(a);
    assert!(f.system.is_tile_locked(&a));
    assert_eq!(f.num_locked(), 1);
    f.system.unlock_tile(a);
    assert!(!f.system.is_tile_locked(&a));
    assert_eq!(f.num_locked(), 0);
    //still cached, just evictable
    assert_eq!(f.num_allocated(), 1);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn unlock_before_update_pins_nothing() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let a = f.local(0, 0, 0);
    f.system.lock_tile(a).expect("lock");
    f.system.unlock_tile(a);
    assert_eq!(f.update().tiles_produced, 0);
    assert_eq!(f.num_allocated(), 0);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn locking_resident_tile_does_not_reload() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let texel = f.texel(0, 2, 1);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    let tile = f.local(0, 2, 1);
    f.system.lock_tile(tile).expect("lock");
    assert_eq!(f.update().tiles_produced, 0);
    assert_eq!(f.num_locked(), 1);
    assert_eq!(f.num_allocated(), 1);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn locked_loads_ignore_pending() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    f.producer.set_pending(0, morton_address(3, 3), true);
    let tile = f.local(0, 3, 3);
    f.system.lock_tile(tile).expect("lock");
    assert_eq!(f.update().tiles_produced, 1);
    assert!(
        f.producer
            .requests()
            .contains(&(0, morton_address(3, 3), RequestPriority::High))
    );
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn force_unlock_releases_every_lock() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let a = f.local(0, 0, 0);
    let b = f.local(0, 1, 0);
    f.system.lock_tile(a).expect("lock");
    f.system.lock_tile(b).expect("lock");
    f.system.lock_tile(b).expect("lock");
    f.update();
    assert_eq!(f.num_locked(), 2);
    f.system.force_unlock_all_tiles(f.handle);
    assert_eq!(f.num_locked(), 0);
    assert!(!f.system.is_tile_locked(&a));
    assert!(!f.system.is_tile_locked(&b));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn flush_keeps_locked_tiles_and_refreshes_them() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let tile = f.local(0, 0, 0);
    f.system.lock_tile(tile).expect("lock");
    f.update();
    let texel = f.texel(0, 1, 0);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    f.producer.take();

    f.system.flush_cache();
    let report = f.update();
    assert_eq!(report.carry_over_produced, 1);
    let produced = f.producer.take();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].kind, ProduceKind::Refresh);
    assert_eq!(produced[0].address, 0);
    assert_eq!(f.num_allocated(), 1);
    assert!(!f.is_mapped(0, 1, 0));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn regional_flush_refills_the_hole() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    f.system
        .request_tiles_for_region(f.vt, (512.0, 512.0), TexelRegion::default(), Some(0))
        .expect("request");
    assert_eq!(f.update().tiles_produced, 16);
    f.producer.take();

    f.system
        .flush_cache_region(f.handle, TileRegion::new(0, 0, 2, 2), 0)
        .expect("flush");
    assert_eq!(f.num_allocated(), 12);
    assert!(!f.is_mapped(0, 1, 1));
    assert!(f.is_mapped(0, 2, 2));
    assert_eq!(f.system.num_pending_requests(), 4);

    let report = f.update();
    assert_eq!(report.tiles_produced, 4);
    let mut addresses: Vec<u32> = f.producer.take().iter().map(|p| p.address).collect();
    addresses.sort();
    assert_eq!(addresses, vec![0, 1, 2, 3]);
    for y in 0..4 {
        for x in 0..4 {
            assert!(f.is_mapped(0, x, y));
        }
    }
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn destroyed_texture_leaves_tiles_cached() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let texel = f.texel(0, 1, 2);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    let physical_space = f.physical_space();

    f.system.destroy_virtual_texture(f.vt).expect("destroy");
    assert!(f.system.with_virtual_texture(f.vt, |_| ()).is_none());
    let (allocated, mapped) = f
        .system
        .with_pool(physical_space, |pool| (pool.num_allocated(), pool.num_mapped()))
        .expect("pool");
    assert_eq!(allocated, 1);
    assert_eq!(mapped, 0);

    //a new texture over the same producer maps the cached tile without producing it
    let vt = f
        .system
        .allocate_virtual_texture(AllocatedVtDescription {
            layers: vec![LayerBinding {
                producer: f.handle,
                producer_layer: 0,
            }],
            private_space: false,
        })
        .expect("allocate");
    let (space, origin) = f
        .system
        .with_virtual_texture(vt, |vt| (vt.space(), vt.virtual_page_xy()))
        .expect("texture");
    f.vt = vt;
    f.space = space;
    f.origin = origin;
    f.producer.take();
    let texel = f.texel(0, 1, 2);
    let report = f.update_with(vec![texel]);
    assert_eq!(report.tiles_produced, 0);
    assert_eq!(report.mappings_written, 1);
    assert!(f.is_mapped(0, 1, 2));
    assert!(f.producer.take().is_empty());
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn destroy_queue_works_from_other_threads() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let queue = f.system.destroy_queue();
    let vt = f.vt;
    std::thread::spawn(move || queue.destroy(vt))
        .join()
        .expect("destroy thread");
    assert!(f.system.with_virtual_texture(vt, |_| ()).is_some());
    //queued textures take no new requests
    assert!(
        f.system
            .request_tiles_for_region(vt, (1.0, 1.0), TexelRegion::default(), Some(0))
            .is_err()
    );
    f.update();
    assert!(f.system.with_virtual_texture(vt, |_| ()).is_none());
    assert!(f.system.destroy_queue().is_empty());
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn released_producer_is_evicted() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let texel = f.texel(0, 0, 1);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    let a = f.local(0, 3, 3);
    f.system.lock_tile(a).expect("lock");
    f.update();
    let physical_space = f.physical_space();

    f.system.release_producer(f.handle).expect("release");
    assert!(!f.is_mapped(0, 0, 1));
    assert!(!f.system.is_tile_locked(&a));
    assert_eq!(
        f.system.with_pool(physical_space, |pool| pool.num_allocated()),
        Some(0)
    );
    assert!(f.system.release_producer(f.handle).is_err());
    assert!(f.system.physical_spaces(f.handle).is_none());

    //the physical space goes away at the end of the next update
    f.update();
    assert!(f.system.with_pool(physical_space, |_| ()).is_none());
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn producers_share_compatible_physical_spaces() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let other = common::RecordingProducer::new();
    let handle = f
        .system
        .register_producer(description(4, 4, 0, 64), other)
        .expect("register");
    assert_eq!(f.system.physical_spaces(handle), f.system.physical_spaces(f.handle));
    f.system.release_producer(handle).expect("release");
    f.update();
    assert!(f.system.with_pool(f.physical_space(), |_| ()).is_some());
}

/// Whether tile `(x, 0)` is unmapped or mapped to a slot that really holds it.
fn mapping_is_truthful(f: &common::Fixture, x: u32) -> bool {
    let Some(entry) = f.system.page_table_entry(f.mapping(0, x, 0)) else {
        return true;
    };
    let held = f
        .system
        .with_pool(entry.physical.physical_space, |pool| pool.key(entry.physical.slot))
        .flatten();
    held == Some(PageKey::new(f.handle, 0, morton_address(x, 0), 0))
}

fn with_hysteresis(frames: u32) -> Config {
    Config {
        eviction: EvictionPolicy {
            reuse_hysteresis_frames: frames,
        },
        ..config()
    }
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn zero_hysteresis_never_maps_a_recycled_slot() {
    let mut f = fixture(with_hysteresis(0), description(2, 1, 0, 1));
    let texels = vec![f.texel(0, 0, 0), f.texel(0, 1, 0)];
    let report = f.update_with(texels.clone());
    //the second load may not take the slot the first one was just given
    assert_eq!(report.tiles_produced, 1);
    assert_eq!(report.allocation_failures, 1);
    assert_eq!(report.mappings_written, 1);
    for _ in 0..4 {
        assert!(mapping_is_truthful(&f, 0));
        assert!(mapping_is_truthful(&f, 1));
        assert_eq!(usize::from(f.is_mapped(0, 0, 0)) + usize::from(f.is_mapped(0, 1, 0)), 1);
        //without a window the tiles take turns in the one slot
        assert_eq!(f.update_with(texels.clone()).tiles_produced, 1);
    }
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn long_hysteresis_delays_reuse() {
    let mut f = fixture(with_hysteresis(3), description(4, 1, 0, 2));
    let (t0, t1, t2, t3) = (f.texel(0, 0, 0), f.texel(0, 1, 0), f.texel(0, 2, 0), f.texel(0, 3, 0));
    //tiles 0 and 1 are sampled more, so they win the two slots
    let report = f.update_with(vec![t0, t0, t1, t1, t2, t3]);
    assert_eq!(report.tiles_produced, 2);
    assert_eq!(report.allocation_failures, 2);
    assert!(is_resident(&f, 0) && is_resident(&f, 1));

    for _ in 1..3 {
        let report = f.update_with(vec![t2, t3]);
        assert_eq!(report.tiles_produced, 0);
        assert!(report.allocation_failures > 0);
    }
    assert_eq!(f.update_with(vec![t2, t3]).tiles_produced, 2);
    assert!(!is_resident(&f, 0) && !is_resident(&f, 1));
    assert!(is_resident(&f, 2) && is_resident(&f, 3));
    for x in 0..4 {
        assert!(mapping_is_truthful(&f, x));
    }
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn failed_group_rolls_back_its_slots() {
    let mut system = VirtualTextureSystem::new(config());
    //two groups; the second shares its physical space with `blocker`
    let producer = common::RecordingProducer::new();
    let handle = system
        .register_producer(
            ProducerDescription {
                layer_formats: vec![LayerFormat(0), LayerFormat(1)],
                layer_groups: vec![0, 1],
                ..description(1, 1, 0, 1)
            },
            producer.clone(),
        )
        .expect("register");
    let blocker = common::RecordingProducer::new();
    let blocker_handle = system
        .register_producer(
            ProducerDescription {
                layer_formats: vec![LayerFormat(1)],
                ..description(1, 1, 0, 1)
            },
            blocker.clone(),
        )
        .expect("register blocker");
    let spaces = system.physical_spaces(handle).expect("spaces");
    assert_eq!(system.physical_spaces(blocker_handle), Some(vec![spaces[1]]));

    let vt = system
        .allocate_virtual_texture(AllocatedVtDescription {
            layers: vec![
                LayerBinding {
                    producer: handle,
                    producer_layer: 0,
                },
                LayerBinding {
                    producer: handle,
                    producer_layer: 1,
                },
            ],
            private_space: false,
        })
        .expect("allocate");
    let (space, (x, y)) = system
        .with_virtual_texture(vt, |vt| (vt.space(), vt.virtual_page_xy()))
        .expect("texture");
    let mapping = |layer: u8| PageMapping {
        space,
        page_table_layer: layer,
        v_level: 0,
        v_address: morton_address(x, y),
    };

    //the blocker pins the only slot of the shared space
    let pinned = LocalTile::new(blocker_handle, 0, 0);
    system.lock_tile(pinned).expect("lock");
    test_executors::spin_on(system.update(&mut NoFeedback));
    assert_eq!(blocker.take().len(), 1);

    let texel = encode_page(space.0, 0, x, y);
    let update = |system: &mut VirtualTextureSystem| {
        let mut feedback = VecFeedback::new();
        feedback.push(vec![texel]);
        test_executors::spin_on(system.update(&mut feedback))
    };
    let report = update(&mut system);
    assert_eq!(report.tiles_produced, 0);
    assert_eq!(report.allocation_failures, 1);
    //the first group's slot was handed back
    assert_eq!(system.with_pool(spaces[0], |pool| pool.num_allocated()), Some(0));
    assert_eq!(system.with_pool(spaces[1], |pool| pool.num_locked()), Some(1));
    assert!(producer.take().is_empty());
    assert!(system.page_table_entry(mapping(0)).is_none());

    //once unpinned and aged out, both groups load together
    system.unlock_tile(pinned);
    let loaded = (0..3).filter(|_| update(&mut system).tiles_produced == 1).count();
    assert_eq!(loaded, 1);
    let produced = producer.take();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].layer_mask, 0b11);
    assert!(produced[0].targets.iter().all(|t| t.is_some()));
    assert!(system.page_table_entry(mapping(0)).is_some());
    assert!(system.page_table_entry(mapping(1)).is_some());
}
