//! Point cloud buffers
//!
//! Flat, immutable position/color arrays built from the provider's nested
//! per-point triples. A buffer is replaced wholesale on reload.

use serde::{Deserialize, Serialize};
use three_d::{vec3, Vec3};

use crate::bvh::Aabb;

/// Wire shape returned by the point cloud provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointCloudResponse {
    pub points: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 3]>,
}

/// Parallel flat arrays: 3 floats of position and 3 of color per point
#[derive(Debug, Clone, Default)]
pub struct PointCloudBuffer {
    positions: Vec<f32>,
    colors: Vec<f32>,
}

impl PointCloudBuffer {
    /// Build from already flattened arrays, taken as-is.
    ///
    /// Malformed input is kept; consumers check [`Self::is_well_formed`]
    /// and degrade to an empty point set.
    pub fn from_flat(positions: Vec<f32>, colors: Vec<f32>) -> Self {
        Self { positions, colors }
    }

    /// Flatten the provider's nested triples
    pub fn from_response(response: PointCloudResponse) -> Self {
        let positions: Vec<f32> = response.points.iter().flatten().copied().collect();
        let colors: Vec<f32> = response.colors.iter().flatten().copied().collect();

        if response.points.len() != response.colors.len() {
            tracing::warn!(
                "Point cloud has {} positions but {} colors",
                response.points.len(),
                response.colors.len()
            );
        }

        Self { positions, colors }
    }

    /// Nest back into the provider's wire shape
    pub fn to_response(&self) -> PointCloudResponse {
        PointCloudResponse {
            points: self
                .positions
                .chunks_exact(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect(),
            colors: self
                .colors
                .chunks_exact(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect(),
        }
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn colors(&self) -> &[f32] {
        &self.colors
    }

    /// Both arrays hold whole triples of the same count
    pub fn is_well_formed(&self) -> bool {
        self.positions.len() % 3 == 0 && self.positions.len() == self.colors.len()
    }

    /// Point count, zero for malformed buffers
    pub fn len(&self) -> usize {
        if self.is_well_formed() {
            self.positions.len() / 3
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self, index: usize) -> Option<Vec3> {
        if index >= self.len() {
            return None;
        }
        let p = &self.positions[index * 3..index * 3 + 3];
        Some(vec3(p[0], p[1], p[2]))
    }

    /// Axis-aligned bounds over all finite points
    pub fn bounds(&self) -> Option<Aabb> {
        let mut aabb = Aabb::empty();
        for p in self.positions.chunks_exact(3) {
            let point = vec3(p[0], p[1], p[2]);
            if point.x.is_finite() && point.y.is_finite() && point.z.is_finite() {
                aabb.expand_point(point);
            }
        }
        aabb.is_valid().then_some(aabb)
    }

    /// Colors scaled to [0, 1].
    ///
    /// Values above 1.0 anywhere mean the buffer is in 0-255 range.
    /// With `linear` set, channels are also decoded from sRGB.
    pub fn normalized_colors(&self, linear: bool) -> Vec<f32> {
        let scale = if self.colors.iter().any(|&c| c > 1.0) {
            1.0 / 255.0
        } else {
            1.0
        };

        self.colors
            .iter()
            .map(|&c| {
                let v = (c * scale).clamp(0.0, 1.0);
                if linear {
                    srgb_to_linear(v)
                } else {
                    v
                }
            })
            .collect()
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> PointCloudResponse {
        PointCloudResponse {
            points: vec![[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]],
            colors: vec![[255.0, 0.0, 51.0], [0.0, 255.0, 0.0]],
        }
    }

    #[test]
    fn test_flatten_nested_triples() {
        let buffer = PointCloudBuffer::from_response(response());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.positions(), &[0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
        assert_eq!(buffer.position(1), Some(vec3(1.0, 2.0, 3.0)));
        assert_eq!(buffer.position(2), None);
    }

    #[test]
    fn test_byte_colors_are_normalized() {
        let buffer = PointCloudBuffer::from_response(response());
        let colors = buffer.normalized_colors(false);
        assert!((colors[0] - 1.0).abs() < 1e-6);
        assert!((colors[2] - 0.2).abs() < 1e-6);
        assert!((colors[4] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_unit_colors_are_kept() {
        let buffer = PointCloudBuffer::from_flat(vec![0.0; 3], vec![0.5, 0.25, 1.0]);
        assert_eq!(buffer.normalized_colors(false), vec![0.5, 0.25, 1.0]);
    }

    #[test]
    fn test_linear_decode_darkens_midtones() {
        let buffer = PointCloudBuffer::from_flat(vec![0.0; 3], vec![0.5, 0.0, 1.0]);
        let colors = buffer.normalized_colors(true);
        assert!(colors[0] < 0.5);
        assert_eq!(colors[1], 0.0);
        assert!((colors[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_buffer_is_empty() {
        let buffer = PointCloudBuffer::from_flat(vec![0.0; 6], vec![0.0; 3]);
        assert!(!buffer.is_well_formed());
        assert!(buffer.is_empty());

        let ragged = PointCloudBuffer::from_flat(vec![0.0; 4], vec![0.0; 4]);
        assert!(ragged.is_empty());
    }

    #[test]
    fn test_bounds_skip_non_finite_points() {
        let buffer = PointCloudBuffer::from_flat(
            vec![-1.0, 0.0, 0.0, f32::NAN, 5.0, 5.0, 2.0, 3.0, 4.0],
            vec![0.0; 9],
        );
        let bounds = buffer.bounds().unwrap();
        assert_eq!(bounds.min, vec3(-1.0, 0.0, 0.0));
        assert_eq!(bounds.max, vec3(2.0, 3.0, 4.0));
        assert!(PointCloudBuffer::default().bounds().is_none());
    }

    #[test]
    fn test_response_round_trip_shape() {
        let buffer = PointCloudBuffer::from_response(response());
        let back = buffer.to_response();
        assert_eq!(back.points, response().points);
        assert_eq!(back.colors, response().colors);
    }
}
