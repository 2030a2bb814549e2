//! Perspective camera state and auto-framing
//!
//! The camera always looks at `target`, which doubles as the orbit-control
//! pivot. Viewer input rotates, pans and dollies around it.

use three_d::{perspective, vec3, InnerSpace, Mat4, Point3, Rad, Vec3};

use crate::bvh::{Aabb, Ray};

/// Screen rectangle in pixels, top-left origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn aspect(&self) -> f32 {
        if self.height > 0.0 {
            self.width / self.height
        } else {
            1.0
        }
    }

    /// Pointer position to normalized device coordinates, y up
    pub fn to_ndc(&self, px: f32, py: f32) -> (f32, f32) {
        let x = ((px - self.x) / self.width) * 2.0 - 1.0;
        let y = -((py - self.y) / self.height) * 2.0 + 1.0;
        (x, y)
    }

    pub fn from_ndc(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.x + (x + 1.0) * 0.5 * self.width,
            self.y + (1.0 - y) * 0.5 * self.height,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveCamera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view
    pub fov_y: Rad<f32>,
    pub z_near: f32,
    pub z_far: f32,
}

impl Default for PerspectiveCamera {
    fn default() -> Self {
        Self {
            position: vec3(5.0, 5.0, 5.0),
            target: vec3(0.0, 0.0, 0.0),
            up: vec3(0.0, 1.0, 0.0),
            fov_y: Rad(60f32.to_radians()),
            z_near: 0.1,
            z_far: 10000.0,
        }
    }
}

impl PerspectiveCamera {
    pub fn new(position: Vec3, target: Vec3, fov_y: Rad<f32>) -> Self {
        Self {
            position,
            target,
            fov_y,
            ..Default::default()
        }
    }

    /// Unit vector from the position towards the target
    pub fn forward(&self) -> Vec3 {
        let dir = self.target - self.position;
        if dir.magnitude2() > 0.0 {
            dir.normalize()
        } else {
            vec3(0.0, 0.0, -1.0)
        }
    }

    /// Up vector usable for a look-at frame; swaps in another axis when
    /// the view direction is parallel to `up`
    fn frame_up(&self) -> Vec3 {
        let forward = self.forward();
        if forward.cross(self.up).magnitude2() > 1e-8 {
            self.up
        } else if forward.cross(vec3(0.0, 0.0, 1.0)).magnitude2() > 1e-8 {
            vec3(0.0, 0.0, 1.0)
        } else {
            vec3(1.0, 0.0, 0.0)
        }
    }

    pub fn view(&self) -> Mat4 {
        let eye = Point3::new(self.position.x, self.position.y, self.position.z);
        let center = Point3::new(self.target.x, self.target.y, self.target.z);
        Mat4::look_at_rh(eye, center, self.frame_up())
    }

    pub fn projection(&self, viewport: &Viewport) -> Mat4 {
        perspective(self.fov_y, viewport.aspect(), self.z_near, self.z_far)
    }

    pub fn view_projection(&self, viewport: &Viewport) -> Mat4 {
        self.projection(viewport) * self.view()
    }

    /// World-space ray from the camera through an NDC position.
    ///
    /// Built from the camera basis rather than by unprojecting through the
    /// inverse view-projection, which loses precision with a small near plane.
    pub fn ray_through_ndc(&self, ndc_x: f32, ndc_y: f32, viewport: &Viewport) -> Ray {
        let forward = self.forward();
        let right = forward.cross(self.frame_up()).normalize();
        let up = right.cross(forward);

        let half_height = (self.fov_y.0 * 0.5).tan();
        let half_width = half_height * viewport.aspect();
        let direction = forward + right * (ndc_x * half_width) + up * (ndc_y * half_height);
        Ray::new(self.position, direction)
    }

    /// World point to pixel coordinates, `None` behind the camera
    pub fn project(&self, point: Vec3, view_projection: &Mat4, viewport: &Viewport) -> Option<(f32, f32)> {
        let clip = *view_projection * point.extend(1.0);
        if clip.w <= self.z_near * 0.5 {
            return None;
        }
        Some(viewport.from_ndc(clip.x / clip.w, clip.y / clip.w))
    }

    /// Height of the view frustum slice at `distance` from the camera
    pub fn visible_height_at(&self, distance: f32) -> f32 {
        2.0 * (self.fov_y.0 * 0.5).tan() * distance
    }

    /// Orbit around the target by yaw (about `up`) and pitch (about the
    /// camera's right axis), keeping the distance
    pub fn orbit(&mut self, yaw: f32, pitch: f32) {
        let offset = self.position - self.target;
        let radius = offset.magnitude();
        if radius == 0.0 {
            return;
        }
        let up = self.up.normalize();
        let yawed = Mat4::from_axis_angle(up, Rad(yaw)) * offset.extend(0.0);
        let yawed = yawed.truncate();

        let right = yawed.cross(up);
        let pitched = if right.magnitude2() > 1e-12 {
            (Mat4::from_axis_angle(right.normalize(), Rad(pitch)) * yawed.extend(0.0)).truncate()
        } else {
            yawed
        };

        // Stop short of the poles
        let cos_to_up = pitched.normalize().dot(up);
        let next = if cos_to_up.abs() > 0.995 { yawed } else { pitched };
        self.position = self.target + next.normalize() * radius;
    }

    /// Move position and target together in the view plane
    pub fn pan(&mut self, right_amount: f32, up_amount: f32) {
        let forward = self.forward();
        let right = forward.cross(self.frame_up()).normalize();
        let up = right.cross(forward).normalize();
        let delta = right * right_amount + up * up_amount;
        self.position += delta;
        self.target += delta;
    }

    /// Scale the distance to the target; factors below 1 move closer
    pub fn dolly(&mut self, factor: f32) {
        let offset = self.position - self.target;
        let scaled = offset * factor.max(1e-3);
        if scaled.magnitude() > self.z_near {
            self.position = self.target + scaled;
        }
    }
}

/// Framing options
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    /// Fraction of extra margin around the bounds
    pub padding: f32,
    /// Approach direction from the center towards the camera
    pub direction: Vec3,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            padding: 0.25,
            direction: vec3(0.0, 1.5, -0.1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraFitResult {
    pub center: Vec3,
    pub size: Vec3,
    pub distance: f32,
    pub camera_position: Vec3,
}

/// Distance at which a cube of `max_dim` fills the vertical fov, plus padding
pub fn fit_distance(max_dim: f32, fov_y: Rad<f32>, padding: f32) -> f32 {
    (max_dim / (2.0 * (fov_y.0 / 2.0).tan())) * (1.0 + padding)
}

/// Frame a bounding box. The camera moves along `options.direction` and
/// its orbit target is set to the box center.
pub fn fit_camera_to_bounds(bounds: &Aabb, camera: &mut PerspectiveCamera, options: &FitOptions) -> CameraFitResult {
    let center = bounds.center();
    let size = bounds.size();
    let max_dim = size.x.max(size.y).max(size.z);

    let distance = fit_distance(max_dim, camera.fov_y, options.padding);
    let direction = if options.direction.magnitude2() > 0.0 {
        options.direction.normalize()
    } else {
        vec3(0.0, 0.0, 1.0)
    };
    let camera_position = center + direction * distance;

    camera.position = camera_position;
    camera.target = center;

    CameraFitResult {
        center,
        size,
        distance,
        camera_position,
    }
}

/// Frame flat XYZ positions; `None` when there is no finite point
pub fn fit_camera_to_points(
    positions: &[f32],
    camera: &mut PerspectiveCamera,
    options: &FitOptions,
) -> Option<CameraFitResult> {
    let mut bounds = Aabb::empty();
    for p in positions.chunks_exact(3) {
        let point = vec3(p[0], p[1], p[2]);
        if point.x.is_finite() && point.y.is_finite() && point.z.is_finite() {
            bounds.expand_point(point);
        }
    }
    if !bounds.is_valid() {
        return None;
    }
    Some(fit_camera_to_bounds(&bounds, camera, options))
}

/// Applies the framing once per point cloud load
#[derive(Debug, Default)]
pub struct AutoFit {
    fitted_generation: Option<u64>,
}

impl AutoFit {
    /// Fit when `generation` has not been fitted yet. Empty clouds do not
    /// consume the generation.
    pub fn apply(
        &mut self,
        generation: u64,
        positions: &[f32],
        camera: &mut PerspectiveCamera,
        options: &FitOptions,
    ) -> Option<CameraFitResult> {
        if self.fitted_generation == Some(generation) {
            return None;
        }
        let result = fit_camera_to_points(positions, camera, options)?;
        self.fitted_generation = Some(generation);
        tracing::info!(
            center = ?result.center,
            distance = result.distance,
            "Camera auto-fitted"
        );
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_corners() -> Vec<f32> {
        vec![-1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0, -1.0, 0.5]
    }

    #[test]
    fn test_fit_distance_for_unit_cube() {
        let mut camera = PerspectiveCamera::default();
        let result = fit_camera_to_points(&cube_corners(), &mut camera, &FitOptions::default()).unwrap();

        let expected = (2.0 / (2.0 * 30f32.to_radians().tan())) * 1.25;
        assert!((result.distance - expected).abs() < 1e-5);
        assert!((result.center - vec3(0.0, 0.0, 0.0)).magnitude() < 1e-6);
        assert_eq!(result.size, vec3(2.0, 2.0, 2.0));
        assert_eq!(camera.target, vec3(0.0, 0.0, 0.0));
        assert!(((camera.position - camera.target).magnitude() - expected).abs() < 1e-5);
    }

    #[test]
    fn test_fit_uses_approach_direction() {
        let mut camera = PerspectiveCamera::default();
        let options = FitOptions {
            padding: 0.0,
            direction: vec3(0.0, 0.0, 3.0),
        };
        let positions = [10.0, 0.0, 0.0, 12.0, 2.0, 1.0];
        let result = fit_camera_to_points(&positions, &mut camera, &options).unwrap();
        assert_eq!(result.center, vec3(11.0, 1.0, 0.5));
        let offset = (result.camera_position - result.center).normalize();
        assert!((offset - vec3(0.0, 0.0, 1.0)).magnitude() < 1e-6);
    }

    #[test]
    fn test_fit_empty_does_nothing() {
        let mut camera = PerspectiveCamera::default();
        let before = camera;
        assert!(fit_camera_to_points(&[], &mut camera, &FitOptions::default()).is_none());
        assert_eq!(camera, before);
    }

    #[test]
    fn test_auto_fit_runs_once_per_generation() {
        let mut auto = AutoFit::default();
        let mut camera = PerspectiveCamera::default();
        let options = FitOptions::default();

        assert!(auto.apply(1, &[], &mut camera, &options).is_none());
        assert!(auto.apply(1, &cube_corners(), &mut camera, &options).is_some());

        camera.position = vec3(40.0, 0.0, 0.0);
        assert!(auto.apply(1, &cube_corners(), &mut camera, &options).is_none());
        assert_eq!(camera.position, vec3(40.0, 0.0, 0.0));

        assert!(auto.apply(2, &cube_corners(), &mut camera, &options).is_some());
    }

    #[test]
    fn test_center_ray_points_at_target() {
        let camera = PerspectiveCamera::new(vec3(0.0, 0.0, 10.0), vec3(0.0, 0.0, 0.0), Rad(1.0));
        let viewport = Viewport::new(0.0, 0.0, 800.0, 600.0);
        let (nx, ny) = viewport.to_ndc(400.0, 300.0);
        assert_eq!((nx, ny), (0.0, 0.0));

        let ray = camera.ray_through_ndc(nx, ny, &viewport);
        assert!((ray.origin - camera.position).magnitude() < 1e-6);
        assert!((ray.direction - vec3(0.0, 0.0, -1.0)).magnitude() < 1e-4);
    }

    #[test]
    fn test_project_inverts_ray() {
        let camera = PerspectiveCamera::new(vec3(3.0, 4.0, 12.0), vec3(0.5, 0.0, 0.0), Rad(0.9));
        let viewport = Viewport::new(10.0, 20.0, 640.0, 480.0);
        let vp = camera.view_projection(&viewport);

        let point = vec3(1.0, 0.5, -0.5);
        let (px, py) = camera.project(point, &vp, &viewport).unwrap();
        let (nx, ny) = viewport.to_ndc(px, py);
        let ray = camera.ray_through_ndc(nx, ny, &viewport);
        let (_, dist_sq) = ray.closest_approach(point).unwrap();
        assert!(dist_sq < 1e-6);
    }

    #[test]
    fn test_ndc_corners() {
        let viewport = Viewport::new(0.0, 0.0, 200.0, 100.0);
        assert_eq!(viewport.to_ndc(0.0, 0.0), (-1.0, 1.0));
        assert_eq!(viewport.to_ndc(200.0, 100.0), (1.0, -1.0));
        assert_eq!(viewport.from_ndc(-1.0, 1.0), (0.0, 0.0));
    }

    #[test]
    fn test_orbit_keeps_distance() {
        let mut camera = PerspectiveCamera::new(vec3(0.0, 2.0, 8.0), vec3(0.0, 0.0, 0.0), Rad(1.0));
        let radius = camera.position.magnitude();
        camera.orbit(0.7, -0.3);
        assert!((camera.position.magnitude() - radius).abs() < 1e-4);
        camera.dolly(0.5);
        assert!((camera.position.magnitude() - radius * 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_view_straight_down_is_finite() {
        let camera = PerspectiveCamera::new(vec3(0.0, 10.0, 0.0), vec3(0.0, 0.0, 0.0), Rad(1.0));
        let view = camera.view();
        assert!(view.x.x.is_finite() && view.y.y.is_finite() && view.z.z.is_finite());
    }
}
