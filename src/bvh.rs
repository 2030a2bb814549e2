//! Bounding volume hierarchy over point clouds
//!
//! Every point becomes a degenerate triangle `(p, p, p)` whose bounds have
//! zero extent, so the same median-split AABB builder used for triangle
//! meshes indexes the cloud. Queries walk the tree branch-and-bound style
//! through a [`ShapecastVisitor`].

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use three_d::{vec3, InnerSpace, Mat4, Vec3};

use crate::cloud::PointCloudBuffer;

const MAX_LEAF_SIZE: usize = 8;
const MAX_DEPTH: u32 = 64;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: vec3(f32::INFINITY, f32::INFINITY, f32::INFINITY),
            max: vec3(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        }
    }

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Bounds of a triangle; zero extent when all three corners coincide
    pub fn from_triangle(a: Vec3, b: Vec3, c: Vec3) -> Self {
        let mut aabb = Self::empty();
        aabb.expand_point(a);
        aabb.expand_point(b);
        aabb.expand_point(c);
        aabb
    }

    pub fn expand_point(&mut self, p: Vec3) {
        self.min = vec3(self.min.x.min(p.x), self.min.y.min(p.y), self.min.z.min(p.z));
        self.max = vec3(self.max.x.max(p.x), self.max.y.max(p.y), self.max.z.max(p.z));
    }

    pub fn expand_aabb(&mut self, other: &Aabb) {
        self.expand_point(other.min);
        self.expand_point(other.max);
    }

    /// Grown outward by `margin` on every side
    pub fn inflated(&self, margin: f32) -> Self {
        let m = vec3(margin, margin, margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    fn longest_axis(&self) -> usize {
        let s = self.size();
        if s.x > s.y && s.x > s.z {
            0
        } else if s.y > s.z {
            1
        } else {
            2
        }
    }

    /// Slab test. Returns the parameter where the ray enters the box, or
    /// zero when the origin is already inside; `None` for a miss.
    pub fn ray_entry(&self, ray: &Ray) -> Option<f32> {
        let mut t_min = f32::NEG_INFINITY;
        let mut t_max = f32::INFINITY;

        for axis in 0..3 {
            let (o, d, lo, hi) = (ray.origin[axis], ray.direction[axis], self.min[axis], self.max[axis]);
            if d == 0.0 {
                // Parallel to the slab: inside it or never
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let (mut t0, mut t1) = ((lo - o) * inv, (hi - o) * inv);
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }

        if t_max < 0.0 {
            return None;
        }
        Some(t_min.max(0.0))
    }
}

/// Half-line with a unit direction
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    pub fn point_at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Along-ray parameter of the closest approach and the squared distance
    /// there; `None` when the point is behind the origin.
    pub fn closest_approach(&self, point: Vec3) -> Option<(f32, f32)> {
        let t = (point - self.origin).dot(self.direction);
        if t < 0.0 {
            return None;
        }
        let dist_sq = (point - self.point_at(t)).magnitude2();
        Some((t, dist_sq))
    }

    /// Ray mapped through `matrix`; the direction is renormalized, so
    /// distances are measured in the target space.
    pub fn transformed(&self, matrix: &Mat4) -> Ray {
        let o = *matrix * self.origin.extend(1.0);
        let d = *matrix * self.direction.extend(0.0);
        Ray::new(o.truncate() / o.w, d.truncate())
    }
}

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Leaf { first: u32, count: u32 },
    Internal { left: u32, right: u32 },
}

#[derive(Debug, Clone, Copy)]
struct BvhNode {
    bounds: Aabb,
    kind: NodeKind,
}

/// Build statistics
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub build_time_ms: f32,
    pub primitive_count: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    pub max_depth: u32,
}

/// Visitor steering a [`PointBvh::shapecast`] traversal
pub trait ShapecastVisitor {
    /// Traversal priority of a node's bounds, lower first; `None` prunes
    fn score_bounds(&mut self, bounds: &Aabb) -> Option<f32>;

    /// Nodes scored above this are skipped when popped
    fn cutoff(&self) -> f32 {
        f32::INFINITY
    }

    /// Called for every point in a surviving leaf.
    /// Returning `true` stops the traversal.
    fn visit_point(&mut self, index: usize, position: Vec3) -> bool;
}

/// Nearest point found by a ray query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointHit {
    pub index: usize,
    pub position: Vec3,
    /// Along-ray distance from the ray origin
    pub distance: f32,
    /// Squared distance between the point and the ray
    pub distance_to_ray_sq: f32,
}

/// Spatial index over the points of one buffer
#[derive(Debug, Clone, Default)]
pub struct PointBvh {
    nodes: Vec<BvhNode>,
    root: Option<u32>,
    /// Point indices reordered so that each leaf covers a contiguous range
    order: Vec<u32>,
    positions: Vec<Vec3>,
    stats: BuildStats,
}

impl PointBvh {
    pub fn build(buffer: &PointCloudBuffer) -> Self {
        if !buffer.is_well_formed() {
            tracing::warn!("Malformed point cloud buffer, building empty index");
            return Self::default();
        }
        Self::from_positions(buffer.positions())
    }

    /// Index flat XYZ triples. A trailing partial triple makes the whole
    /// input malformed; individual non-finite points are left out.
    pub fn from_positions(flat: &[f32]) -> Self {
        let start = Instant::now();

        if flat.len() % 3 != 0 {
            tracing::warn!("Position array length {} is not a multiple of 3", flat.len());
            return Self::default();
        }

        let positions: Vec<Vec3> = flat
            .chunks_exact(3)
            .map(|c| vec3(c[0], c[1], c[2]))
            .collect();

        let mut order: Vec<u32> = Vec::with_capacity(positions.len());
        let mut prim_bounds: Vec<Aabb> = Vec::with_capacity(positions.len());
        for (i, &p) in positions.iter().enumerate() {
            if p.x.is_finite() && p.y.is_finite() && p.z.is_finite() {
                order.push(i as u32);
            }
            prim_bounds.push(Aabb::from_triangle(p, p, p));
        }

        let mut bvh = Self {
            positions,
            ..Default::default()
        };
        bvh.stats.primitive_count = order.len();

        if !order.is_empty() {
            let len = order.len();
            let root = bvh.build_recursive(&prim_bounds, &mut order, 0, len, 0);
            bvh.root = Some(root);
        }
        bvh.order = order;

        bvh.stats.node_count = bvh.nodes.len();
        bvh.stats.build_time_ms = start.elapsed().as_secs_f32() * 1000.0;
        tracing::debug!(
            primitives = bvh.stats.primitive_count,
            nodes = bvh.stats.node_count,
            leaves = bvh.stats.leaf_count,
            depth = bvh.stats.max_depth,
            "Built point BVH in {:.2} ms",
            bvh.stats.build_time_ms
        );

        bvh
    }

    fn build_recursive(
        &mut self,
        prim_bounds: &[Aabb],
        order: &mut [u32],
        first: usize,
        count: usize,
        depth: u32,
    ) -> u32 {
        self.stats.max_depth = self.stats.max_depth.max(depth);

        let range = &mut order[first..first + count];
        let mut bounds = Aabb::empty();
        for &i in range.iter() {
            bounds.expand_aabb(&prim_bounds[i as usize]);
        }

        if count <= MAX_LEAF_SIZE || depth >= MAX_DEPTH || bounds.size().magnitude2() == 0.0 {
            return self.push_leaf(bounds, first, count);
        }

        // Median split along the longest axis
        let axis = bounds.longest_axis();
        let mid = count / 2;
        let positions = &self.positions;
        range.select_nth_unstable_by(mid, |&a, &b| {
            positions[a as usize][axis]
                .partial_cmp(&positions[b as usize][axis])
                .unwrap_or(Ordering::Equal)
        });

        let left = self.build_recursive(prim_bounds, order, first, mid, depth + 1);
        let right = self.build_recursive(prim_bounds, order, first + mid, count - mid, depth + 1);

        let idx = self.nodes.len() as u32;
        self.nodes.push(BvhNode {
            bounds,
            kind: NodeKind::Internal { left, right },
        });
        idx
    }

    fn push_leaf(&mut self, bounds: Aabb, first: usize, count: usize) -> u32 {
        self.stats.leaf_count += 1;
        let idx = self.nodes.len() as u32;
        self.nodes.push(BvhNode {
            bounds,
            kind: NodeKind::Leaf {
                first: first as u32,
                count: count as u32,
            },
        });
        idx
    }

    /// Indexed point count
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.root.map(|r| self.nodes[r as usize].bounds)
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Best-first traversal. Children are queued nearest first by their
    /// score and re-checked against the visitor's cutoff when popped.
    pub fn shapecast<V: ShapecastVisitor>(&self, visitor: &mut V) {
        let Some(root) = self.root else {
            return;
        };
        let Some(root_score) = visitor.score_bounds(&self.nodes[root as usize].bounds) else {
            return;
        };

        let mut stack: Vec<(u32, f32)> = vec![(root, root_score)];
        while let Some((node_idx, score)) = stack.pop() {
            if score > visitor.cutoff() {
                continue;
            }

            match self.nodes[node_idx as usize].kind {
                NodeKind::Leaf { first, count } => {
                    for &point in &self.order[first as usize..(first + count) as usize] {
                        if visitor.visit_point(point as usize, self.positions[point as usize]) {
                            return;
                        }
                    }
                }
                NodeKind::Internal { left, right } => {
                    let l = visitor
                        .score_bounds(&self.nodes[left as usize].bounds)
                        .map(|s| (left, s));
                    let r = visitor
                        .score_bounds(&self.nodes[right as usize].bounds)
                        .map(|s| (right, s));
                    match (l, r) {
                        (Some(a), Some(b)) => {
                            // Farther child below so the nearer one pops first
                            if a.1 <= b.1 {
                                stack.push(b);
                                stack.push(a);
                            } else {
                                stack.push(a);
                                stack.push(b);
                            }
                        }
                        (Some(a), None) | (None, Some(a)) => stack.push(a),
                        (None, None) => {}
                    }
                }
            }
        }
    }

    /// Nearest point along `ray` lying within `tolerance` of it
    pub fn raycast(&self, ray: &Ray, tolerance: f32) -> Option<PointHit> {
        let mut visitor = NearestAlongRay {
            ray,
            tolerance,
            best: None,
        };
        self.shapecast(&mut visitor);
        visitor.best
    }

    /// Every point within `tolerance` of `ray`, sorted by index
    pub fn candidates(&self, ray: &Ray, tolerance: f32) -> Vec<usize> {
        let mut visitor = AllWithinRay {
            ray,
            tolerance,
            hits: Vec::new(),
        };
        self.shapecast(&mut visitor);
        visitor.hits.sort_unstable();
        visitor.hits
    }
}

struct NearestAlongRay<'a> {
    ray: &'a Ray,
    tolerance: f32,
    best: Option<PointHit>,
}

impl ShapecastVisitor for NearestAlongRay<'_> {
    fn score_bounds(&mut self, bounds: &Aabb) -> Option<f32> {
        bounds.inflated(self.tolerance).ray_entry(self.ray)
    }

    fn cutoff(&self) -> f32 {
        self.best.map_or(f32::INFINITY, |b| b.distance)
    }

    fn visit_point(&mut self, index: usize, position: Vec3) -> bool {
        if let Some((t, dist_sq)) = self.ray.closest_approach(position) {
            if dist_sq <= self.tolerance * self.tolerance && t < self.cutoff() {
                self.best = Some(PointHit {
                    index,
                    position,
                    distance: t,
                    distance_to_ray_sq: dist_sq,
                });
            }
        }
        false
    }
}

struct AllWithinRay<'a> {
    ray: &'a Ray,
    tolerance: f32,
    hits: Vec<usize>,
}

impl ShapecastVisitor for AllWithinRay<'_> {
    fn score_bounds(&mut self, bounds: &Aabb) -> Option<f32> {
        bounds.inflated(self.tolerance).ray_entry(self.ray)
    }

    fn visit_point(&mut self, index: usize, position: Vec3) -> bool {
        if let Some((_, dist_sq)) = self.ray.closest_approach(position) {
            if dist_sq <= self.tolerance * self.tolerance {
                self.hits.push(index);
            }
        }
        false
    }
}

/// Index cached against the geometry it was built from.
///
/// Rebuilt only when the buffer (by `Arc` identity) or the point size
/// changes. `world` places the geometry in the scene.
#[derive(Debug, Clone)]
pub struct CachedIndex {
    source: Arc<PointCloudBuffer>,
    point_size: f32,
    pub world: Mat4,
    bvh: PointBvh,
}

impl CachedIndex {
    pub fn new(source: Arc<PointCloudBuffer>, point_size: f32, world: Mat4) -> Self {
        let bvh = PointBvh::build(&source);
        Self {
            source,
            point_size,
            world,
            bvh,
        }
    }

    /// Keep `slot` in step with the current buffer. Returns true on rebuild.
    pub fn sync(
        slot: &mut Option<CachedIndex>,
        source: &Arc<PointCloudBuffer>,
        point_size: f32,
        world: Mat4,
    ) -> bool {
        if let Some(cached) = slot.as_mut() {
            if Arc::ptr_eq(&cached.source, source) && cached.point_size == point_size {
                cached.world = world;
                return false;
            }
        }
        *slot = Some(CachedIndex::new(Arc::clone(source), point_size, world));
        true
    }

    pub fn bvh(&self) -> &PointBvh {
        &self.bvh
    }

    pub fn source(&self) -> &Arc<PointCloudBuffer> {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use three_d::SquareMatrix;

    const CORNERS: [f32; 12] = [
        0.0, 0.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, //
        0.0, 0.0, 1.0,
    ];

    fn down_z(x: f32, y: f32) -> Ray {
        Ray::new(vec3(x, y, 5.0), vec3(0.0, 0.0, -1.0))
    }

    fn grid(n: usize) -> Vec<f32> {
        let mut flat = Vec::new();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    flat.extend_from_slice(&[i as f32, j as f32, k as f32 * 0.5]);
                }
            }
        }
        flat
    }

    #[test]
    fn test_pick_corner_scenario() {
        let bvh = PointBvh::from_positions(&CORNERS);
        assert_eq!(bvh.len(), 4);

        let hit = bvh.raycast(&down_z(1.0, 0.0), 0.01).unwrap();
        assert_eq!(hit.index, 1);
        assert_eq!(hit.position, vec3(1.0, 0.0, 0.0));

        assert!(bvh.raycast(&down_z(0.5, 0.5), 0.01).is_none());
    }

    #[test]
    fn test_zero_tolerance_is_exact() {
        let flat = grid(6);
        let bvh = PointBvh::from_positions(&flat);
        for (i, c) in flat.chunks_exact(3).enumerate().step_by(7) {
            let ray = Ray::new(vec3(c[0], c[1], c[2] + 10.0), vec3(0.0, 0.0, -1.0));
            let hit = bvh.raycast(&ray, 0.0).unwrap();
            // Topmost point of the column is hit first
            assert_eq!(hit.position.x, c[0]);
            assert_eq!(hit.position.y, c[1]);
            assert_eq!(hit.distance_to_ray_sq, 0.0);

            let sideways = Ray::new(vec3(c[0] - 100.0, c[1], c[2]), vec3(1.0, 0.0, 0.0));
            let hit = bvh.raycast(&sideways, 0.0).unwrap();
            assert_eq!(hit.position.y, c[1]);
            assert_eq!(hit.position.z, c[2]);
            assert!(bvh.candidates(&sideways, 0.0).contains(&i));
        }
    }

    #[test]
    fn test_nearest_along_ray_wins() {
        // Two points on the same line of sight, the closer one listed last
        let flat = [0.0, 0.0, -3.0, 0.0, 0.0, 2.0];
        let bvh = PointBvh::from_positions(&flat);
        let hit = bvh.raycast(&down_z(0.0, 0.0), 0.01).unwrap();
        assert_eq!(hit.index, 1);
        assert!((hit.distance - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_candidates_grow_with_tolerance() {
        let flat = grid(8);
        let bvh = PointBvh::from_positions(&flat);
        let ray = Ray::new(vec3(3.3, 3.6, 20.0), vec3(0.05, -0.02, -1.0));

        let mut previous: Vec<usize> = Vec::new();
        for step in 0..12 {
            let tolerance = step as f32 * 0.15;
            let current = bvh.candidates(&ray, tolerance);
            assert!(previous.iter().all(|i| current.contains(i)));
            previous = current;
        }
        assert!(!previous.is_empty());
    }

    #[test]
    fn test_raycast_matches_brute_force() {
        let flat = grid(7);
        let bvh = PointBvh::from_positions(&flat);
        let ray = Ray::new(vec3(-4.0, 2.2, 1.1), vec3(1.0, 0.3, 0.1));
        let tolerance = 0.4;

        let mut expected: Option<(usize, f32)> = None;
        for (i, c) in flat.chunks_exact(3).enumerate() {
            if let Some((t, d2)) = ray.closest_approach(vec3(c[0], c[1], c[2])) {
                if d2 <= tolerance * tolerance && expected.map_or(true, |(_, bt)| t < bt) {
                    expected = Some((i, t));
                }
            }
        }

        let hit = bvh.raycast(&ray, tolerance).unwrap();
        let (index, t) = expected.unwrap();
        assert!((hit.distance - t).abs() < 1e-5);
        assert_eq!(hit.index, index);
    }

    #[test]
    fn test_points_behind_origin_are_ignored() {
        let bvh = PointBvh::from_positions(&CORNERS);
        let ray = Ray::new(vec3(1.0, 0.0, -5.0), vec3(0.0, 0.0, -1.0));
        assert!(bvh.raycast(&ray, 0.01).is_none());
    }

    #[test]
    fn test_empty_and_malformed_inputs_have_no_hits() {
        let empty = PointBvh::from_positions(&[]);
        assert!(empty.is_empty());
        assert!(empty.raycast(&down_z(0.0, 0.0), 1.0).is_none());

        let ragged = PointBvh::from_positions(&[0.0, 0.0, 0.0, 1.0]);
        assert!(ragged.is_empty());
        assert!(ragged.candidates(&down_z(0.0, 0.0), 10.0).is_empty());

        let mismatched = PointCloudBuffer::from_flat(vec![0.0; 6], vec![0.0; 3]);
        assert!(PointBvh::build(&mismatched).is_empty());
    }

    #[test]
    fn test_non_finite_points_are_skipped() {
        let flat = [f32::NAN, 0.0, 0.0, 1.0, 0.0, 0.0];
        let bvh = PointBvh::from_positions(&flat);
        assert_eq!(bvh.len(), 1);
        assert_eq!(bvh.raycast(&down_z(1.0, 0.0), 0.0).unwrap().index, 1);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let flat = grid(5);
        let a = PointBvh::from_positions(&flat);
        let b = PointBvh::from_positions(&flat);
        let ray = Ray::new(vec3(2.1, -3.0, 0.9), vec3(0.0, 1.0, 0.05));
        assert_eq!(a.raycast(&ray, 0.3), b.raycast(&ray, 0.3));
        assert_eq!(a.candidates(&ray, 0.3), b.candidates(&ray, 0.3));
        assert_eq!(a.bounds(), b.bounds());
    }

    #[test]
    fn test_tree_is_split() {
        let bvh = PointBvh::from_positions(&grid(10));
        let stats = bvh.stats();
        assert_eq!(stats.primitive_count, 1000);
        assert!(stats.leaf_count > 1);
        assert!(stats.max_depth > 0);
        assert_eq!(stats.node_count, 2 * stats.leaf_count - 1);
    }

    #[test]
    fn test_coincident_points_stay_in_one_leaf() {
        let flat: Vec<f32> = std::iter::repeat([2.0, 2.0, 2.0]).take(50).flatten().collect();
        let bvh = PointBvh::from_positions(&flat);
        assert_eq!(bvh.stats().leaf_count, 1);
        assert_eq!(bvh.candidates(&Ray::new(vec3(2.0, 2.0, 9.0), vec3(0.0, 0.0, -1.0)), 0.0).len(), 50);
    }

    #[test]
    fn test_ray_entry_inside_and_parallel() {
        let aabb = Aabb::new(vec3(-1.0, -1.0, -1.0), vec3(1.0, 1.0, 1.0));
        assert_eq!(aabb.ray_entry(&Ray::new(vec3(0.0, 0.0, 0.0), vec3(1.0, 0.0, 0.0))), Some(0.0));
        assert_eq!(aabb.ray_entry(&down_z(0.0, 0.0)), Some(4.0));
        assert_eq!(aabb.ray_entry(&down_z(2.0, 0.0)), None);
    }

    #[test]
    fn test_cached_index_rebuilds_on_new_buffer_only() {
        let buffer = Arc::new(PointCloudBuffer::from_flat(CORNERS.to_vec(), vec![0.0; 12]));
        let mut slot = None;

        assert!(CachedIndex::sync(&mut slot, &buffer, 1.0, Mat4::identity()));
        assert!(!CachedIndex::sync(&mut slot, &buffer, 1.0, Mat4::identity()));
        assert!(CachedIndex::sync(&mut slot, &buffer, 2.0, Mat4::identity()));

        // Same contents, different buffer: rebuilt
        let reloaded = Arc::new(PointCloudBuffer::from_flat(CORNERS.to_vec(), vec![0.0; 12]));
        assert!(CachedIndex::sync(&mut slot, &reloaded, 2.0, Mat4::identity()));
        assert_eq!(slot.unwrap().bvh().len(), 4);
    }

    #[test]
    fn test_ray_transform_into_scaled_space() {
        let world = Mat4::from_scale(2.0);
        let inv = world.invert().unwrap();
        let ray = Ray::new(vec3(2.0, 0.0, 10.0), vec3(0.0, 0.0, -1.0));
        let local = ray.transformed(&inv);
        assert!((local.origin - vec3(1.0, 0.0, 5.0)).magnitude() < 1e-6);
        assert!((local.direction.magnitude() - 1.0).abs() < 1e-6);
    }
}
