// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use pages_and_tiles::bittricks::{encode_page, morton_address};
use pages_and_tiles::requests::feedback::NoFeedback;
use pages_and_tiles::{
    AllocatedVtDescription, AllocatedVtId, Config, Finalizer, LayerBinding, LocalTile, PageMapping, PhysicalSpaceId,
    ProduceKind, ProduceTarget, Producer, ProducerDescription, ProducerHandle, RequestPageResult, RequestPriority,
    SpaceId, UpdateReport, VecFeedback, VirtualTextureSystem,
};

/// One call to [`Producer::produce_page_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct Produced {
    pub kind: ProduceKind,
    pub level: u8,
    pub address: u32,
    pub layer_mask: u8,
    pub targets: Vec<Option<ProduceTarget>>,
}

/// Produces every tile it is asked for, except addresses marked pending, and remembers the calls.
#[derive(Default)]
pub struct RecordingProducer {
    produced: Mutex<Vec<Produced>>,
    pending: Mutex<HashSet<(u8, u32)>>,
    requests: Mutex<Vec<(u8, u32, RequestPriority)>>,
    finalizer: Arc<CountingFinalizer>,
}

#[derive(Default)]
pub struct CountingFinalizer {
    pub count: Mutex<u32>,
}

impl Finalizer for CountingFinalizer {
    fn finalize(&self) {
        *self.count.lock().unwrap() += 1;
    }
}

impl RecordingProducer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    pub fn set_pending(&self, level: u8, address: u32, pending: bool) {
        let mut set = self.pending.lock().unwrap();
        if pending {
            set.insert((level, address));
        } else {
            set.remove(&(level, address));
        }
    }
    pub fn take(&self) -> Vec<Produced> {
        std::mem::take(&mut *self.produced.lock().unwrap())
    }
    pub fn produced_count(&self) -> usize {
        self.produced.lock().unwrap().len()
    }
    pub fn requests(&self) -> Vec<(u8, u32, RequestPriority)> {
        self.requests.lock().unwrap().clone()
    }
    pub fn finalized(&self) -> u32 {
        *self.finalizer.count.lock().unwrap()
    }
}

impl Producer for RecordingProducer {
    fn request_page_data(
        &self,
        _producer: ProducerHandle,
        _layer_mask: u8,
        level: u8,
        address: u32,
        priority: RequestPriority,
    ) -> RequestPageResult {
        self.requests.lock().unwrap().push((level, address, priority));
        if self.pending.lock().unwrap().contains(&(level, address)) {
            RequestPageResult::Pending
        } else {
            RequestPageResult::Available(u64::from(address))
        }
    }

    fn produce_page_data(
        &self,
        kind: ProduceKind,
        _producer: ProducerHandle,
        layer_mask: u8,
        level: u8,
        address: u32,
        _request: u64,
        targets: &[Option<ProduceTarget>],
    ) -> Option<Arc<dyn Finalizer>> {
        self.produced.lock().unwrap().push(Produced {
            kind,
            level,
            address,
            layer_mask,
            targets: targets.to_vec(),
        });
        Some(self.finalizer.clone())
    }
}

/// Feedback is consumed the frame it is written and no flushing races the tests.
pub fn config() -> Config {
    Config {
        feedback_frame_delay: 0,
        ..Config::default()
    }
}

pub fn description(width_in_tiles: u32, height_in_tiles: u32, max_level: u8, pool_capacity: u32) -> ProducerDescription {
    ProducerDescription {
        name: "recording".to_string(),
        tile_size: 128,
        tile_border: 4,
        width_in_tiles,
        height_in_tiles,
        max_level,
        pool_capacity,
        ..ProducerDescription::default()
    }
}

pub struct Fixture {
    pub system: VirtualTextureSystem,
    pub producer: Arc<RecordingProducer>,
    pub handle: ProducerHandle,
    pub vt: AllocatedVtId,
    pub space: SpaceId,
    /// The texture's first tile in its space.
    pub origin: (u32, u32),
}

impl Fixture {
    /// The feedback texel for tile `(x, y)` of the texture at `level`, in the level's own tiles.
    pub fn texel(&self, level: u8, x: u32, y: u32) -> u32 {
        encode_page(
            self.space.0,
            level,
            (self.origin.0 >> level) + x,
            (self.origin.1 >> level) + y,
        )
    }

    /// The page-table entry a tile `(x, y)` of `level` is mapped under.
    pub fn mapping(&self, level: u8, x: u32, y: u32) -> PageMapping {
        PageMapping {
            space: self.space,
            page_table_layer: 0,
            v_level: level,
            v_address: morton_address(self.origin.0 + (x << level), self.origin.1 + (y << level)),
        }
    }

    pub fn is_mapped(&self, level: u8, x: u32, y: u32) -> bool {
        self.system.page_table_entry(self.mapping(level, x, y)).is_some()
    }

    pub fn physical_space(&self) -> PhysicalSpaceId {
        self.system.physical_spaces(self.handle).expect("producer")[0]
    }

    pub fn num_allocated(&self) -> u32 {
        self.system
            .with_pool(self.physical_space(), |pool| pool.num_allocated())
            .expect("pool")
    }

    pub fn num_locked(&self) -> u32 {
        self.system
            .with_pool(self.physical_space(), |pool| pool.num_locked())
            .expect("pool")
    }

    pub fn local(&self, level: u8, x: u32, y: u32) -> LocalTile {
        LocalTile::new(self.handle, morton_address(x, y), level)
    }

    /// Runs one update with `texels` as the frame's feedback.
    pub fn update_with(&mut self, texels: Vec<u32>) -> UpdateReport {
        let mut feedback = VecFeedback::new();
        feedback.push(texels);
        test_executors::spin_on(self.system.update(&mut feedback))
    }

    pub fn update(&mut self) -> UpdateReport {
        test_executors::spin_on(self.system.update(&mut NoFeedback))
    }
}

/// A system with one single-layer producer and one texture covering it.
pub fn fixture(config: Config, description: ProducerDescription) -> Fixture {
    let mut system = VirtualTextureSystem::new(config);
    let producer = RecordingProducer::new();
    let handle = system
        .register_producer(description, producer.clone())
        .expect("register");
    let vt = system
        .allocate_virtual_texture(AllocatedVtDescription {
            layers: vec![LayerBinding {
                producer: handle,
                producer_layer: 0,
            }],
            private_space: false,
        })
        .expect("allocate");
    let (space, origin) = system
        .with_virtual_texture(vt, |vt| (vt.space(), vt.virtual_page_xy()))
        .expect("texture");
    Fixture {
        system,
        producer,
        handle,
        vt,
        space,
        origin,
    }
}
