// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! pages_and_tiles is a demand-paged virtual texture streaming engine.

Textures far larger than GPU memory are addressed through page tables.  Each frame the
renderer writes the pages it sampled into a feedback buffer; pages_and_tiles turns that
feedback into work:

| Stage    | Input                        | Output                                      |
|----------|------------------------------|---------------------------------------------|
| Feedback | packed texels                | unique pages with sample counts             |
| Gather   | unique pages, residency      | loads, mappings, recency touches            |
| Sort     | loads                        | the loads that fit this frame's budget      |
| Submit   | loads                        | produced tiles in bounded physical caches   |
| Map      | produced and resident tiles  | page-table updates for the renderer         |

Tile data comes from [`Producer`]s.  GPU resources (the physical textures and the page-table
textures) belong to the caller: pages_and_tiles tells producers which slot to fill and hands
back [`space::page_map::PageTableUpdate`]s to apply.

# Model

* A [`VirtualTextureSystem`] owns every registry and is driven by one thread calling
  [`VirtualTextureSystem::update`] per frame.
* Producers are registered with a [`ProducerDescription`].  Each of a producer's physical
  groups is cached in a [`cache::physical_space::PhysicalSpace`], shared with compatible
  producers.
* Virtual textures are allocated in virtual spaces and route each page-table layer to one
  producer layer.
* Tiles can be locked, which pins them in the cache until unlocked.

# Concurrency

The feedback and gather stages run as shards on the current
[some_executor](https://sealedabstract.com/code/some_executor) executor.  Everything that
mutates shared state happens on the thread calling `update`.

```
use pages_and_tiles::{Config, VirtualTextureSystem, requests::feedback::NoFeedback};
let mut system = VirtualTextureSystem::new(Config::default());
let report = test_executors::spin_on(system.update(&mut NoFeedback));
assert_eq!(report.tiles_produced, 0);
```
*/

logwise::declare_logging_domain!();

pub mod adaptive;
pub mod bittricks;
pub mod cache;
pub mod config;
pub mod producer;
pub mod requests;
pub mod space;
pub mod system;
pub mod tile;

pub type Priority = some_executor::Priority;
pub use vec_parallel::Strategy;

pub use adaptive::AdaptiveVirtualTexture;
pub use config::{Config, EvictionPolicy};
pub use producer::{
    Finalizer, ProduceKind, ProduceTarget, Producer, ProducerDescription, ProducerError, ProducerHandle,
    RequestPageResult, RequestPriority,
};
pub use requests::feedback::{FeedbackReadback, VecFeedback};
pub use space::allocated_vt::{AllocateError, AllocatedVtDescription, AllocatedVtId, DestroyQueue, LayerBinding};
pub use system::{SystemError, TexelRegion, UpdateReport, VirtualTextureSystem};
pub use tile::{LocalTile, PageMapping, PhysicalAddress, PhysicalSpaceId, SpaceId, TileRegion};
