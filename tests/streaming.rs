// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! End-to-end streaming: feedback and explicit requests become produced, mapped tiles.
#[cfg(target_arch = "wasm32")]
wasm_bindgen_test::wasm_bindgen_test_configure!(run_in_browser);

mod common;

use common::{config, description, fixture};
use pages_and_tiles::bittricks::morton_address;
use pages_and_tiles::space::page_map::PageTableUpdate;
use pages_and_tiles::{
    AdaptiveVirtualTexture, Config, ProduceKind, ProducerDescription, SpaceId, TexelRegion, VirtualTextureSystem,
};
use std::sync::{Arc, Mutex};

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn repeated_texels_load_one_tile() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let texel = f.texel(0, 1, 1);
    let report = f.update_with(vec![texel; 10]);
    assert_eq!(report.frame, 0);
    assert_eq!(report.unique_pages, 1);
    assert_eq!(report.tiles_produced, 1);

    let produced = f.producer.take();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].kind, ProduceKind::Load);
    assert_eq!(produced[0].level, 0);
    assert_eq!(produced[0].address, morton_address(1, 1));
    assert_eq!(produced[0].layer_mask, 1);
    let target = produced[0].targets[0].expect("layer 0 target");
    assert_eq!(target.slot, 0);
    assert_eq!(target.physical_space, f.physical_space());
    assert_eq!(f.producer.finalized(), 1);

    let entry = f.system.page_table_entry(f.mapping(0, 1, 1)).expect("mapped");
    assert_eq!(entry.physical.slot, 0);
    assert_eq!(entry.mapped_level, 0);
    let updates: Vec<PageTableUpdate> = report
        .page_table_updates
        .into_iter()
        .flat_map(|(_, updates)| updates)
        .collect();
    assert!(updates.iter().any(|u| matches!(u, PageTableUpdate::Map { v_level: 0, .. })));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn resident_tiles_are_not_reloaded() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let texels = vec![f.texel(0, 0, 0), f.texel(0, 3, 2)];
    assert_eq!(f.update_with(texels.clone()).tiles_produced, 2);
    f.producer.take();

    let report = f.update_with(texels);
    assert_eq!(report.frame, 1);
    assert_eq!(report.load_requests, 0);
    assert_eq!(report.tiles_produced, 0);
    assert!(report.page_updates >= 2);
    assert!(f.producer.take().is_empty());
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn explicit_and_feedback_requests_merge() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    f.system
        .request_tiles_for_region(f.vt, (512.0, 512.0), TexelRegion::new(0, 0, 128, 128), Some(0))
        .expect("request");
    f.system
        .request_tiles_for_region(f.vt, (512.0, 512.0), TexelRegion::new(0, 0, 128, 128), Some(0))
        .expect("request");
    let texel = f.texel(0, 0, 0);
    let report = f.update_with(vec![texel]);
    assert_eq!(report.load_requests, 1);
    assert_eq!(report.tiles_produced, 1);
    assert_eq!(f.producer.take().len(), 1);
    assert_eq!(f.num_allocated(), 1);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn whole_texture_request() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    f.system.request_tiles((512.0, 512.0), Some(0));
    assert_eq!(f.system.num_pending_requests(), 16);
    let report = f.update();
    assert_eq!(report.tiles_produced, 16);
    assert_eq!(f.system.num_pending_requests(), 0);
    for y in 0..4 {
        for x in 0..4 {
            assert!(f.is_mapped(0, x, y), "tile {x},{y}");
        }
    }
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn screen_size_picks_level() {
    let mut f = fixture(config(), description(4, 4, 2, 64));
    //512 texels on 128 pixels is level 2, already the coarsest, so nothing coarser is added
    f.system.request_tiles((128.0, 128.0), None);
    let report = f.update();
    let mut levels: Vec<u8> = f.producer.take().iter().map(|p| p.level).collect();
    levels.sort();
    levels.dedup();
    assert_eq!(levels, vec![2]);
    assert_eq!(report.tiles_produced, 1);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn unknown_texture_request_fails() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let vt = f.vt;
    f.system.destroy_virtual_texture(vt).expect("destroy");
    assert!(
        f.system
            .request_tiles_for_region(vt, (1.0, 1.0), TexelRegion::default(), Some(0))
            .is_err()
    );
    assert!(f.system.destroy_virtual_texture(vt).is_err());
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn coarser_levels_are_prefetched() {
    let mut f = fixture(config(), description(4, 4, 2, 64));
    let texel = f.texel(0, 1, 1);
    let report = f.update_with(vec![texel]);
    assert_eq!(report.tiles_produced, 2);
    let mut produced: Vec<(u8, u32)> = f
        .producer
        .take()
        .iter()
        .map(|p| (p.level, p.address))
        .collect();
    produced.sort();
    assert_eq!(produced, vec![(0, morton_address(1, 1)), (1, 0)]);
    //every mapped tile has its parent mapped
    assert!(f.is_mapped(0, 1, 1));
    assert!(f.is_mapped(1, 0, 0));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn resident_ancestor_is_mapped_directly() {
    let mut f = fixture(config(), description(4, 4, 2, 64));
    f.system
        .request_tiles_for_region(f.vt, (1.0, 1.0), TexelRegion::default(), Some(2))
        .expect("request");
    assert_eq!(f.update().tiles_produced, 1);
    f.producer.take();

    //only the missing level 1 tile loads; the resident level 2 tile stays mapped
    let texel = f.texel(1, 1, 1);
    let report = f.update_with(vec![texel]);
    assert!(report.mappings_written >= 1);
    let entry = f.system.page_table_entry(f.mapping(2, 0, 0)).expect("coarsest mapped");
    assert_eq!(entry.mapped_level, 2);
    let produced = f.producer.take();
    assert!(produced.iter().all(|p| p.level < 2));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn pending_tiles_retry() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    f.producer.set_pending(0, 0, true);
    let texel = f.texel(0, 0, 0);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 0);
    assert!(!f.is_mapped(0, 0, 0));

    f.producer.set_pending(0, 0, false);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    assert!(f.is_mapped(0, 0, 0));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn load_pending_tiles_forces_pending() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    f.producer.set_pending(0, 0, true);
    f.system
        .request_tiles_for_region(f.vt, (512.0, 512.0), TexelRegion::new(0, 0, 128, 128), Some(0))
        .expect("request");
    let report = test_executors::spin_on(f.system.load_pending_tiles());
    assert_eq!(report.tiles_produced, 1);
    assert!(f.is_mapped(0, 0, 0));
    assert_eq!(f.system.frame(), 1);

    //nothing queued, nothing done
    let report = test_executors::spin_on(f.system.load_pending_tiles());
    assert_eq!(report, Default::default());
    assert_eq!(f.system.frame(), 1);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn feedback_waits_for_delay() {
    let mut f = fixture(
        Config {
            feedback_frame_delay: 2,
            ..Config::default()
        },
        description(4, 4, 0, 64),
    );
    let texel = f.texel(0, 2, 2);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 0);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 0);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn disabled_feedback_is_discarded() {
    let mut f = fixture(
        Config {
            enable_feedback: false,
            ..config()
        },
        description(4, 4, 0, 64),
    );
    let texel = f.texel(0, 0, 0);
    let report = f.update_with(vec![texel]);
    assert_eq!(report.unique_pages, 0);
    assert_eq!(report.tiles_produced, 0);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn nothing_allocated_does_not_advance() {
    let mut system = VirtualTextureSystem::new(config());
    let mut feedback = pages_and_tiles::VecFeedback::new();
    feedback.push(vec![0, 1, 2]);
    let report = test_executors::spin_on(system.update(&mut feedback));
    assert_eq!(report.frame, 0);
    assert_eq!(system.frame(), 0);
    //the buffer was still consumed
    assert!(pages_and_tiles::FeedbackReadback::map(&mut feedback).is_none());
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn continuous_update_refreshes_resident_tiles() {
    let mut f = fixture(
        config(),
        ProducerDescription {
            continuous_update: true,
            ..description(4, 4, 0, 64)
        },
    );
    let texel = f.texel(0, 1, 0);
    assert_eq!(f.update_with(vec![texel]).tiles_produced, 1);
    f.producer.take();

    let report = f.update_with(vec![texel]);
    assert_eq!(report.tiles_produced, 0);
    assert_eq!(report.continuous_updates_produced, 1);
    let produced = f.producer.take();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].kind, ProduceKind::ContinuousUpdate);
    assert_eq!(produced[0].address, morton_address(1, 0));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn persistent_highest_mip_is_mapped_on_first_update() {
    let mut f = fixture(
        config(),
        ProducerDescription {
            persistent_highest_mip: true,
            ..description(4, 4, 2, 64)
        },
    );
    let coarsest = f.local(2, 0, 0);
    assert!(f.system.is_tile_locked(&coarsest));
    let report = f.update();
    assert_eq!(report.tiles_produced, 1);
    assert!(f.is_mapped(2, 0, 0));
    assert_eq!(f.num_locked(), 1);
}

/// Asks for an allocation at every level-0 page it sees.
#[derive(Default)]
struct RecordingAdaptive {
    queued: Mutex<Vec<(Vec<u32>, u32)>>,
    updates: Mutex<Vec<u32>>,
}

impl AdaptiveVirtualTexture for RecordingAdaptive {
    fn packed_allocation_request(&self, v_address: u32, level_plus_one: u8, _frame: u32) -> Option<u32> {
        (level_plus_one == 1).then_some(v_address)
    }
    fn queue_allocation_requests(&self, requests: &[u32], frame: u32) {
        self.queued.lock().unwrap().push((requests.to_vec(), frame));
    }
    fn update_allocations(&self, frame: u32) {
        self.updates.lock().unwrap().push(frame);
    }
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn adaptive_textures_receive_allocation_requests() {
    let mut f = fixture(config(), description(4, 4, 0, 64));
    let adaptive = Arc::new(RecordingAdaptive::default());
    f.system
        .register_adaptive(f.space, adaptive.clone())
        .expect("register adaptive");
    assert!(f.system.register_adaptive(SpaceId(9), adaptive.clone()).is_err());

    let texel = f.texel(0, 1, 1);
    let report = f.update_with(vec![texel, texel]);
    assert_eq!(report.tiles_produced, 1);
    let expected = f.mapping(0, 1, 1).v_address;
    assert_eq!(*adaptive.queued.lock().unwrap(), vec![(vec![expected], 0)]);

    //no feedback, no requests; the per-frame hook still runs
    f.update();
    assert_eq!(adaptive.queued.lock().unwrap().len(), 1);
    assert_eq!(*adaptive.updates.lock().unwrap(), vec![0, 1]);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn region_outside_the_texture_requests_nothing() {
    let f = fixture(config(), description(4, 4, 0, 64));
    f.system
        .request_tiles_for_region(f.vt, (512.0, 512.0), TexelRegion::new(1024, 1024, 2048, 2048), Some(0))
        .expect("request");
    assert_eq!(f.system.num_pending_requests(), 0);
    //a sliver on the edge still requests the tile under it
    f.system
        .request_tiles_for_region(f.vt, (512.0, 512.0), TexelRegion::new(511, 511, 600, 600), Some(0))
        .expect("request");
    assert_eq!(f.system.num_pending_requests(), 1);
}
