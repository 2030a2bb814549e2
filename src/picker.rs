//! Screen-space point picking
//!
//! A pointer position becomes a camera ray, the pixel tolerance becomes a
//! distance in the index's local space, and the BVH returns the nearest
//! point along the ray within that distance.

use three_d::{InnerSpace, Mat4, SquareMatrix, Vec3};

use crate::bvh::CachedIndex;
use crate::camera::{PerspectiveCamera, Viewport};

pub const DEFAULT_PIXEL_RADIUS: f32 = 6.0;
pub const DEFAULT_CLICK_THRESHOLD_PX: f32 = 3.0;

#[derive(Debug, Clone, Copy)]
pub struct PickConfig {
    /// Screen-space tolerance in pixels
    pub pixel_radius: f32,
}

impl Default for PickConfig {
    fn default() -> Self {
        Self {
            pixel_radius: DEFAULT_PIXEL_RADIUS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickHit {
    pub index: usize,
    /// World-space position
    pub position: Vec3,
    /// World-space distance from the camera along the ray
    pub distance: f32,
}

/// Mean length of the linear part's columns
fn average_scale(world: &Mat4) -> f32 {
    let sx = world.x.truncate().magnitude();
    let sy = world.y.truncate().magnitude();
    let sz = world.z.truncate().magnitude();
    (sx + sy + sz) / 3.0
}

/// World-space tolerance covering `pixel_radius` pixels at `distance`
pub fn world_tolerance(
    camera: &PerspectiveCamera,
    viewport: &Viewport,
    distance: f32,
    pixel_radius: f32,
) -> f32 {
    if viewport.height <= 0.0 {
        return 0.0;
    }
    pixel_radius * camera.visible_height_at(distance) / viewport.height
}

/// Nearest indexed point under the pointer, `None` on a miss.
///
/// Pointer coordinates are in the same pixel space as `viewport`.
pub fn pick(
    pointer_x: f32,
    pointer_y: f32,
    camera: &PerspectiveCamera,
    viewport: &Viewport,
    index: &CachedIndex,
    config: &PickConfig,
) -> Option<PickHit> {
    if index.bvh().is_empty() || viewport.width <= 0.0 || viewport.height <= 0.0 {
        return None;
    }

    let (ndc_x, ndc_y) = viewport.to_ndc(pointer_x, pointer_y);
    let world_ray = camera.ray_through_ndc(ndc_x, ndc_y, viewport);

    let inverse = index.world.invert()?;
    let local_ray = world_ray.transformed(&inverse);

    let origin = index.world.w.truncate();
    let distance = (camera.position - origin).magnitude();
    let scale = average_scale(&index.world);
    if scale <= 0.0 {
        return None;
    }
    let local_tolerance = world_tolerance(camera, viewport, distance, config.pixel_radius) / scale;

    let hit = index.bvh().raycast(&local_ray, local_tolerance)?;
    let position = (index.world * hit.position.extend(1.0)).truncate();
    let hit = PickHit {
        index: hit.index,
        position,
        distance: (position - camera.position).dot(world_ray.direction),
    };
    tracing::debug!(index = hit.index, position = ?hit.position, "Picked point");
    Some(hit)
}

/// Tells clicks from drags by the pointer travel between press and release
#[derive(Debug, Clone, Copy)]
pub struct ClickTracker {
    threshold: f32,
    pressed_at: Option<(f32, f32)>,
}

impl Default for ClickTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CLICK_THRESHOLD_PX)
    }
}

impl ClickTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            pressed_at: None,
        }
    }

    pub fn press(&mut self, x: f32, y: f32) {
        self.pressed_at = Some((x, y));
    }

    /// True when the release completes a click
    pub fn release(&mut self, x: f32, y: f32) -> bool {
        match self.pressed_at.take() {
            Some(start) => self.within_threshold(start, (x, y)),
            None => false,
        }
    }

    /// Pointer has left the click radius since the press
    pub fn is_dragging(&self, x: f32, y: f32) -> bool {
        self.pressed_at
            .is_some_and(|start| !self.within_threshold(start, (x, y)))
    }

    pub fn cancel(&mut self) {
        self.pressed_at = None;
    }

    fn within_threshold(&self, start: (f32, f32), end: (f32, f32)) -> bool {
        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        dx * dx + dy * dy <= self.threshold * self.threshold
    }
}
