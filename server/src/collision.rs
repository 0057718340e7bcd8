//! Circle overlap tests and the grid-based broad phase.
//!
//! The overlap tests are pure and allocation-free; the batch variant exists so
//! the simulation can test many pairs per tick without call overhead. The
//! [`SpatialGrid`] only prunes candidate pairs, callers always confirm with the
//! exact test.

use shared::Vec2;
use std::collections::{HashMap, HashSet};

/// Below this many pairs the unrolled batch loop buys nothing.
const BATCH_MIN_LEN: usize = 8;

/// Exact circle-circle overlap test. Touching circles count as overlapping.
///
/// Compares squared distances so no square root is taken.
pub fn circles_overlap(c1: Vec2, r1: f32, c2: Vec2, r2: f32) -> bool {
    let dx = c2.x - c1.x;
    let dy = c2.y - c1.y;
    let rr = r1 + r2;
    dx * dx + dy * dy <= rr * rr
}

/// Tests one circle pair per index across two equal-length slices.
///
/// The wide path evaluates four pairs per iteration with the exact same float
/// expression as [`circles_overlap`], so results are bit-identical to calling
/// the scalar test in a loop. Inputs shorter than the unroll threshold take
/// the scalar path directly; mismatched lengths are truncated to the shorter.
pub fn circles_overlap_batch(lhs: &[(Vec2, f32)], rhs: &[(Vec2, f32)]) -> Vec<bool> {
    let len = lhs.len().min(rhs.len());

    if len < BATCH_MIN_LEN {
        return lhs
            .iter()
            .zip(rhs.iter())
            .map(|(&(c1, r1), &(c2, r2))| circles_overlap(c1, r1, c2, r2))
            .collect();
    }

    let mut results = Vec::with_capacity(len);
    let wide_end = len - len % 4;

    let mut i = 0;
    while i < wide_end {
        // Four independent lanes, written so the optimizer can vectorize.
        results.push(circles_overlap(lhs[i].0, lhs[i].1, rhs[i].0, rhs[i].1));
        results.push(circles_overlap(
            lhs[i + 1].0,
            lhs[i + 1].1,
            rhs[i + 1].0,
            rhs[i + 1].1,
        ));
        results.push(circles_overlap(
            lhs[i + 2].0,
            lhs[i + 2].1,
            rhs[i + 2].0,
            rhs[i + 2].1,
        ));
        results.push(circles_overlap(
            lhs[i + 3].0,
            lhs[i + 3].1,
            rhs[i + 3].0,
            rhs[i + 3].1,
        ));
        i += 4;
    }

    for j in wide_end..len {
        results.push(circles_overlap(lhs[j].0, lhs[j].1, rhs[j].0, rhs[j].1));
    }

    results
}

/// True when `p` lies inside the rectangle grown by `margin` on every side.
pub fn point_in_bounds(p: Vec2, width: f32, height: f32, margin: f32) -> bool {
    p.x >= -margin && p.x <= width + margin && p.y >= -margin && p.y <= height + margin
}

/// Uniform grid mapping entity ids to the cells their circle covers.
///
/// Purely advisory: `query_circle` may return ids whose circles do not overlap
/// the query, but never misses one that does (for the radius it was inserted
/// with).
pub struct SpatialGrid {
    cell_size: f32,
    cells: HashMap<(i32, i32), HashSet<u64>>,
    occupied: HashMap<u64, Vec<(i32, i32)>>,
}

impl SpatialGrid {
    /// `cell_size` must be positive; values near the typical entity diameter
    /// keep cell occupancy small.
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            cells: HashMap::new(),
            occupied: HashMap::new(),
        }
    }

    fn cell_of(&self, x: f32, y: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (y / self.cell_size).floor() as i32,
        )
    }

    fn covered_cells(&self, center: Vec2, radius: f32) -> Vec<(i32, i32)> {
        let (min_x, min_y) = self.cell_of(center.x - radius, center.y - radius);
        let (max_x, max_y) = self.cell_of(center.x + radius, center.y + radius);

        let mut cells = Vec::with_capacity(((max_x - min_x + 1) * (max_y - min_y + 1)) as usize);
        for cx in min_x..=max_x {
            for cy in min_y..=max_y {
                cells.push((cx, cy));
            }
        }
        cells
    }

    /// Registers `id` in every cell its circle touches, replacing any previous
    /// registration for the same id.
    pub fn insert(&mut self, id: u64, center: Vec2, radius: f32) {
        self.remove(id);

        let cells = self.covered_cells(center, radius);
        for cell in &cells {
            self.cells.entry(*cell).or_default().insert(id);
        }
        self.occupied.insert(id, cells);
    }

    /// Unregisters `id`. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: u64) {
        let Some(cells) = self.occupied.remove(&id) else {
            return;
        };
        for cell in cells {
            if let Some(ids) = self.cells.get_mut(&cell) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.cells.remove(&cell);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
        self.occupied.clear();
    }

    /// Ids registered in any cell the query circle overlaps, deduplicated.
    pub fn query_circle(&self, center: Vec2, radius: f32) -> Vec<u64> {
        let mut found = HashSet::new();
        for cell in self.covered_cells(center, radius) {
            if let Some(ids) = self.cells.get(&cell) {
                found.extend(ids.iter().copied());
            }
        }
        found.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_basic_cases() {
        let origin = Vec2::default();

        assert!(circles_overlap(origin, 5.0, Vec2::new(8.0, 0.0), 5.0));
        assert!(!circles_overlap(origin, 5.0, Vec2::new(11.0, 0.0), 5.0));
        // Exactly touching counts as overlap.
        assert!(circles_overlap(origin, 5.0, Vec2::new(10.0, 0.0), 5.0));
        // Concentric circles always overlap.
        assert!(circles_overlap(origin, 1.0, origin, 100.0));
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = (Vec2::new(3.0, -2.0), 4.0);
        let b = (Vec2::new(-1.0, 1.5), 2.5);
        assert_eq!(
            circles_overlap(a.0, a.1, b.0, b.1),
            circles_overlap(b.0, b.1, a.0, a.1)
        );
    }

    fn pair_set(count: usize) -> (Vec<(Vec2, f32)>, Vec<(Vec2, f32)>) {
        // Deterministic spread of positions and radii, some overlapping pairs
        // and some not, including degenerate zero radii.
        let lhs: Vec<(Vec2, f32)> = (0..count)
            .map(|i| {
                let f = i as f32;
                (Vec2::new(f * 3.1, f * -1.7), (f * 0.37) % 6.0)
            })
            .collect();
        let rhs: Vec<(Vec2, f32)> = (0..count)
            .map(|i| {
                let f = i as f32;
                (Vec2::new(f * 2.9 + 1.0, f * -1.8), (f * 0.53) % 5.0)
            })
            .collect();
        (lhs, rhs)
    }

    #[test]
    fn batch_matches_scalar_for_all_sizes() {
        for count in [0, 1, 3, 7, 8, 9, 15, 16, 33, 100] {
            let (lhs, rhs) = pair_set(count);
            let batch = circles_overlap_batch(&lhs, &rhs);
            let scalar: Vec<bool> = lhs
                .iter()
                .zip(rhs.iter())
                .map(|(&(c1, r1), &(c2, r2))| circles_overlap(c1, r1, c2, r2))
                .collect();
            assert_eq!(batch, scalar, "mismatch at batch size {}", count);
        }
    }

    #[test]
    fn batch_truncates_to_shorter_input() {
        let (lhs, rhs) = pair_set(10);
        let results = circles_overlap_batch(&lhs[..4], &rhs);
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn point_in_bounds_with_margin() {
        assert!(point_in_bounds(Vec2::new(10.0, 10.0), 800.0, 600.0, 0.0));
        assert!(!point_in_bounds(Vec2::new(-1.0, 10.0), 800.0, 600.0, 0.0));
        assert!(point_in_bounds(Vec2::new(-10.0, 10.0), 800.0, 600.0, 20.0));
        assert!(!point_in_bounds(Vec2::new(10.0, 625.0), 800.0, 600.0, 20.0));
    }

    #[test]
    fn grid_query_returns_all_true_overlaps() {
        let mut grid = SpatialGrid::new(50.0);
        let asteroids = [
            (1u64, Vec2::new(100.0, 100.0), 30.0),
            (2, Vec2::new(400.0, 300.0), 20.0),
            (3, Vec2::new(110.0, 120.0), 15.0),
            (4, Vec2::new(790.0, 10.0), 12.0),
        ];
        for (id, center, radius) in asteroids {
            grid.insert(id, center, radius);
        }

        let query_center = Vec2::new(105.0, 105.0);
        let query_radius = 10.0;
        let candidates = grid.query_circle(query_center, query_radius);

        // Candidate pruning must never drop a genuinely overlapping circle.
        for (id, center, radius) in asteroids {
            if circles_overlap(query_center, query_radius, center, radius) {
                assert!(candidates.contains(&id), "grid missed id {}", id);
            }
        }
        assert!(!candidates.contains(&4));
    }

    #[test]
    fn grid_insert_replaces_previous_cells() {
        let mut grid = SpatialGrid::new(50.0);
        grid.insert(1, Vec2::new(25.0, 25.0), 10.0);
        grid.insert(1, Vec2::new(500.0, 500.0), 10.0);

        assert!(grid.query_circle(Vec2::new(25.0, 25.0), 10.0).is_empty());
        assert_eq!(grid.query_circle(Vec2::new(500.0, 500.0), 10.0), vec![1]);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn grid_remove_unknown_id_is_noop() {
        let mut grid = SpatialGrid::new(50.0);
        grid.insert(1, Vec2::new(10.0, 10.0), 5.0);
        grid.remove(99);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn grid_clear_empties_everything() {
        let mut grid = SpatialGrid::new(50.0);
        grid.insert(1, Vec2::new(10.0, 10.0), 5.0);
        grid.insert(2, Vec2::new(90.0, 90.0), 5.0);
        grid.clear();
        assert!(grid.is_empty());
        assert!(grid.query_circle(Vec2::new(10.0, 10.0), 50.0).is_empty());
    }
}
