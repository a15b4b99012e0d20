//! Spatial hash grid over a pool's members
//!
//! The grid buckets entities by their horizontal (x, y) cell and is rebuilt
//! lazily: the owning pool bumps an epoch whenever membership or a position
//! changes, and queries rebuild only when the epoch moved. Distance checks are
//! full 3D Euclidean.

use std::collections::HashMap;
use std::rc::Rc;

use mps_protocol::Vector3;

use crate::entity::Entity;

/// Cell size used when the configured one is unusable
const FALLBACK_CELL_SIZE: f32 = 64.0;

/// Grid cell coordinates
type CellCoord = (i32, i32);

pub struct SpatialIndex {
    cell_size: f32,
    cells: HashMap<CellCoord, Vec<Rc<Entity>>>,
    built_epoch: Option<u64>,
}

impl SpatialIndex {
    /// Create an empty index; non-positive or non-finite sizes fall back to 64 units
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            FALLBACK_CELL_SIZE
        };
        Self {
            cell_size,
            cells: HashMap::new(),
            built_epoch: None,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Whether the grid reflects the given pool epoch
    pub fn is_current(&self, epoch: u64) -> bool {
        self.built_epoch == Some(epoch)
    }

    /// Re-bucket all members unless the grid already reflects `epoch`
    pub fn rebuild(&mut self, members: &[Rc<Entity>], epoch: u64) {
        if self.is_current(epoch) {
            return;
        }

        self.cells.clear();
        for entity in members {
            let cell = self.cell_of(entity.position());
            self.cells.entry(cell).or_default().push(Rc::clone(entity));
        }
        self.built_epoch = Some(epoch);
    }

    /// Entities within `radius` of `center`, ordered by ascending local id
    pub fn in_range(&self, center: Vector3, radius: f32) -> Vec<Rc<Entity>> {
        self.collect_in_range(center, radius, |_| true)
    }

    /// Entities within `radius` of `center` that share `dimension`
    pub fn in_dimension(&self, center: Vector3, radius: f32, dimension: i32) -> Vec<Rc<Entity>> {
        self.collect_in_range(center, radius, |entity| entity.dimension() == dimension)
    }

    /// Up to `limit` members by ascending distance; ties go to the lower local id
    pub fn nearest(members: &[Rc<Entity>], center: Vector3, limit: usize) -> Vec<Rc<Entity>> {
        if limit == 0 {
            return Vec::new();
        }

        let mut ranked: Vec<(f32, &Rc<Entity>)> = members
            .iter()
            .map(|entity| (entity.position().distance_squared(center), entity))
            .collect();
        ranked.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.local_id().cmp(&b.1.local_id()))
        });

        ranked
            .into_iter()
            .take(limit)
            .map(|(_, entity)| Rc::clone(entity))
            .collect()
    }

    /// Members the engine currently streams in, ordered by ascending local id
    pub fn in_stream_range(members: &[Rc<Entity>]) -> Vec<Rc<Entity>> {
        let mut streamed: Vec<Rc<Entity>> = members
            .iter()
            .filter(|entity| entity.is_streamed())
            .cloned()
            .collect();
        streamed.sort_by_key(|entity| entity.local_id());
        streamed
    }

    fn collect_in_range(
        &self,
        center: Vector3,
        radius: f32,
        accept: impl Fn(&Entity) -> bool,
    ) -> Vec<Rc<Entity>> {
        if radius.is_nan() || radius < 0.0 {
            return Vec::new();
        }

        let radius_squared = radius * radius;
        let hit = |entity: &&Rc<Entity>| {
            entity.position().distance_squared(center) <= radius_squared
                && accept(entity)
        };

        let min = self.cell_of(Vector3::new(center.x - radius, center.y - radius, center.z));
        let max = self.cell_of(Vector3::new(center.x + radius, center.y + radius, center.z));
        let span = (max.0 as i128 - min.0 as i128 + 1) * (max.1 as i128 - min.1 as i128 + 1);

        let mut result: Vec<Rc<Entity>> = if span > self.cells.len() as i128 {
            // Query covers more cells than are occupied; scan what exists
            self.cells
                .values()
                .flatten()
                .filter(hit)
                .cloned()
                .collect()
        } else {
            let mut found = Vec::new();
            for x in min.0..=max.0 {
                for y in min.1..=max.1 {
                    if let Some(entries) = self.cells.get(&(x, y)) {
                        found.extend(entries.iter().filter(hit).cloned());
                    }
                }
            }
            found
        };

        result.sort_by_key(|entity| entity.local_id());
        result
    }

    fn cell_of(&self, position: Vector3) -> CellCoord {
        (
            (position.x / self.cell_size).floor() as i32,
            (position.y / self.cell_size).floor() as i32,
        )
    }
}
