//! Per-worker scratch, tile ownership and the shared output handle.

use std::marker::PhantomData;
use std::ops::Range;

use convkit_core::BlockingPlan;

/// Per-worker cache of transformed input tiles for one sample.
///
/// Slots are indexed relative to the first tile the worker owns in the
/// sample. A slot is computed by the first output-channel group that needs
/// it and reused by the others.
#[derive(Debug, Default)]
pub struct TileCache {
    owning_sample: Option<usize>,
    valid: Vec<u64>,
    data: Vec<f32>,
    slot_len: usize,
}

impl TileCache {
    pub fn new(slots: usize, slot_len: usize) -> Self {
        Self {
            owning_sample: None,
            valid: vec![0; slots.div_ceil(64)],
            data: vec![0.0; slots * slot_len],
            slot_len,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.slot_len > 0
    }

    /// Forget everything; run at the start of each input-channel pass.
    pub fn reset(&mut self) {
        self.owning_sample = None;
        self.valid.fill(0);
    }

    /// Switch to `sample`, dropping tiles cached for any other sample.
    pub fn begin_sample(&mut self, sample: usize) {
        if self.owning_sample != Some(sample) {
            self.valid.fill(0);
            self.owning_sample = Some(sample);
        }
    }

    pub fn is_valid(&self, slot: usize) -> bool {
        self.valid[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    /// Slot contents, running `compute` on first use.
    pub fn get_or_compute(&mut self, slot: usize, compute: impl FnOnce(&mut [f32])) -> &[f32] {
        let buf = &mut self.data[slot * self.slot_len..(slot + 1) * self.slot_len];
        if self.valid[slot / 64] & (1u64 << (slot % 64)) == 0 {
            compute(buf);
            self.valid[slot / 64] |= 1u64 << (slot % 64);
        }
        buf
    }
}

/// One tile of the flattened `(sample, tile-row, tile-col)` space, seen
/// from one output-channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub sample: usize,
    pub group: usize,
    /// Index within the sample.
    pub tile: usize,
    /// Cache slot, `tile` minus the first owned tile of the sample.
    pub slot: usize,
    pub ht: usize,
    pub wt: usize,
}

/// Everything one worker writes during a pass.
#[derive(Debug, Default)]
pub struct WorkerScratch {
    /// Transformed input of one tile, `[ic blocks per pass][tile input]`.
    pub tin: Vec<f32>,
    /// Tile accumulator, `[oc blocks per group][tile output]`.
    pub tout: Vec<f32>,
    pub tout_i32: Vec<i32>,
    /// Inverse-transformed output of one block.
    pub ybuf: Vec<f32>,
    pub cache: TileCache,
}

impl WorkerScratch {
    pub fn for_plan(plan: &BlockingPlan, workers: usize, int8: bool, out_tile: usize) -> Self {
        let tin_len = plan.ic_blocks_per_pass() * plan.tile_input_len();
        let tout_len = plan.oc_blocks_per_group() * plan.tile_output_len();
        let cache = if plan.oc4 > 1 && tin_len > 0 {
            TileCache::new(owned_span(plan, workers), tin_len)
        } else {
            TileCache::default()
        };
        let (tout, tout_i32) = if int8 { (Vec::new(), vec![0; tout_len]) } else { (vec![0.0; tout_len], Vec::new()) };
        Self {
            tin: vec![0.0; tin_len],
            tout,
            tout_i32,
            ybuf: vec![0.0; out_tile * out_tile * convkit_core::V],
            cache,
        }
    }

    /// Visit this worker's tiles: per owned sample, every output-channel
    /// group over the owned tiles of that sample.
    pub fn for_owned_tiles(
        &mut self,
        plan: &BlockingPlan,
        worker: usize,
        workers: usize,
        mut body: impl FnMut(&mut WorkerScratch, TileCoord),
    ) {
        let owned = partition(worker, workers, plan.total_tiles());
        if owned.is_empty() {
            return;
        }
        let per_sample = plan.tiles_per_sample();
        let first = owned.start / per_sample;
        let last = (owned.end - 1) / per_sample;
        for sample in first..=last {
            let base = sample * per_sample;
            let tiles = owned.start.max(base) - base..owned.end.min(base + per_sample) - base;
            self.cache.begin_sample(sample);
            for group in 0..plan.oc4 {
                for tile in tiles.clone() {
                    let coord = TileCoord {
                        sample,
                        group,
                        tile,
                        slot: tile - tiles.start,
                        ht: tile / plan.wt,
                        wt: tile % plan.wt,
                    };
                    body(self, coord);
                }
            }
        }
    }
}

/// Most tiles of one sample any worker owns; bounds the cache slots.
pub fn owned_span(plan: &BlockingPlan, workers: usize) -> usize {
    plan.tiles_per_sample().min(plan.total_tiles().div_ceil(workers.max(1)))
}

/// Balanced contiguous split of `0..total` into `workers` ranges.
pub fn partition(worker: usize, workers: usize, total: usize) -> Range<usize> {
    let base = total / workers;
    let rem = total % workers;
    let start = worker * base + worker.min(rem);
    let len = base + usize::from(worker < rem);
    start..start + len
}

/// Mutable buffer shared across workers that write disjoint regions.
pub struct SharedMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _borrow: PhantomData<&'a mut [T]>,
}

// Safety: access goes through `slice_mut`, whose callers guarantee that
// concurrently live slices never overlap.
unsafe impl<T: Send> Send for SharedMut<'_, T> {}
unsafe impl<T: Send> Sync for SharedMut<'_, T> {}

impl<'a, T> SharedMut<'a, T> {
    pub fn new(buf: &'a mut [T]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
            _borrow: PhantomData,
        }
    }

    /// # Safety
    ///
    /// No other live slice obtained from this handle may overlap
    /// `offset..offset + len`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [T] {
        assert!(offset + len <= self.len, "shared slice {}..{} out of {}", offset, offset + len, self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(offset), len)
    }
}
