//! Segmentation session state
//!
//! One container owns the point cloud, the selection, the mask and the
//! loading flag. Fields are private; every mutation goes through a method
//! so the viewer and the network completions cannot bypass the invariants.

use std::sync::Arc;
use three_d::Vec3;

use crate::api::{ApiError, SegmentationRequest, SegmentationResponse};
use crate::cloud::PointCloudBuffer;
use crate::config::Config;
use crate::overlay::{MaskOverlay, SegmentationMask};
use crate::selection::{PointLabel, SelectedPoint, SelectionSet};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("select at least one point before running segmentation")]
    EmptySelection,

    #[error("a segmentation request is already running")]
    SegmentationInFlight,

    #[error("the point cloud is still loading")]
    AlreadyLoading,

    #[error("mask has {actual} values but the point cloud has {expected} points")]
    MaskLengthMismatch { expected: usize, actual: usize },

    #[error("no point cloud loaded")]
    NoPointCloud,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Work the session is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    PointCloud,
    Segmentation,
}

#[derive(Debug)]
pub struct SegmentationSession {
    cloud: Option<Arc<PointCloudBuffer>>,
    /// Bumped on every new point cloud
    generation: u64,
    selection_mode: PointLabel,
    selection: SelectionSet,
    mask: Option<SegmentationMask>,
    overlay: MaskOverlay,
    pending: Option<Pending>,
    remove_radius: f32,
    dim_gray: f32,
    linear_colors: bool,
}

impl SegmentationSession {
    pub fn new(config: &Config) -> Self {
        Self {
            cloud: None,
            generation: 0,
            selection_mode: PointLabel::Positive,
            selection: SelectionSet::new(config.selection.proximity_radius),
            mask: None,
            overlay: MaskOverlay::default(),
            pending: None,
            remove_radius: config.selection.remove_radius,
            dim_gray: config.overlay.dim_gray,
            linear_colors: config.overlay.linear_colors,
        }
    }

    // --- point cloud ---

    /// Replace the point cloud. Drops the mask and captures the new
    /// original colors; the selection is kept.
    pub fn set_point_cloud(&mut self, buffer: PointCloudBuffer) {
        if !buffer.is_well_formed() {
            tracing::warn!(
                positions = buffer.positions().len(),
                colors = buffer.colors().len(),
                "Malformed point cloud, treating as empty"
            );
        }
        let colors = if buffer.is_well_formed() {
            buffer.normalized_colors(self.linear_colors)
        } else {
            Vec::new()
        };
        self.overlay = MaskOverlay::new(colors, self.dim_gray);
        self.mask = None;
        self.generation += 1;
        tracing::info!(points = buffer.len(), generation = self.generation, "Point cloud set");
        self.cloud = Some(Arc::new(buffer));
    }

    pub fn begin_load(&mut self) -> Result<(), SessionError> {
        match self.pending {
            Some(Pending::PointCloud) => Err(SessionError::AlreadyLoading),
            Some(Pending::Segmentation) => Err(SessionError::SegmentationInFlight),
            None => {
                self.pending = Some(Pending::PointCloud);
                Ok(())
            }
        }
    }

    /// Completion of a point cloud fetch. Clears the loading flag on every outcome.
    pub fn finish_load(&mut self, result: Result<PointCloudBuffer, ApiError>) -> Result<usize, SessionError> {
        if self.pending == Some(Pending::PointCloud) {
            self.pending = None;
        }
        let buffer = result.map_err(|e| {
            tracing::error!("Point cloud fetch failed: {}", e);
            SessionError::from(e)
        })?;
        let count = buffer.len();
        self.set_point_cloud(buffer);
        Ok(count)
    }

    // --- selection ---

    pub fn set_selection_mode(&mut self, mode: PointLabel) {
        self.selection_mode = mode;
    }

    /// Add a point with the current mode's label
    pub fn add_point(&mut self, position: Vec3) -> Option<&SelectedPoint> {
        let label = self.selection_mode;
        self.selection.add(position, label)
    }

    /// Remove the selected point nearest to `position` within the remove radius
    pub fn remove_nearest(&mut self, position: Vec3) -> Option<SelectedPoint> {
        self.selection.remove_nearest(position, self.remove_radius)
    }

    pub fn remove_point(&mut self, id: &str) -> Option<SelectedPoint> {
        self.selection.remove(id)
    }

    pub fn clear_points(&mut self) {
        self.selection.clear();
    }

    // --- segmentation ---

    /// Validate and mark a segmentation request as in flight
    pub fn begin_segmentation(&mut self) -> Result<SegmentationRequest, SessionError> {
        match self.pending {
            Some(Pending::Segmentation) => return Err(SessionError::SegmentationInFlight),
            Some(Pending::PointCloud) => return Err(SessionError::AlreadyLoading),
            None => {}
        }
        if self.selection.is_empty() {
            tracing::warn!("Segmentation requested with no selected points");
            return Err(SessionError::EmptySelection);
        }

        let (positive_points, negative_points) = self.selection.partition();
        self.pending = Some(Pending::Segmentation);
        Ok(SegmentationRequest {
            positive_points,
            negative_points,
        })
    }

    /// Completion of a segmentation request. Clears the loading flag first,
    /// whatever the outcome. Returns the number of points inside the mask.
    pub fn complete_segmentation(
        &mut self,
        result: Result<SegmentationResponse, ApiError>,
    ) -> Result<usize, SessionError> {
        if self.pending == Some(Pending::Segmentation) {
            self.pending = None;
        }
        let response = result.map_err(|e| {
            tracing::error!("Segmentation failed: {}", e);
            SessionError::from(e)
        })?;
        self.set_mask(response.mask)
    }

    /// Install a mask. A length different from the point count is rejected
    /// and the current mask stays.
    pub fn set_mask(&mut self, mask: SegmentationMask) -> Result<usize, SessionError> {
        let cloud = self.cloud.as_ref().ok_or(SessionError::NoPointCloud)?;
        let expected = cloud.len();
        if mask.len() != expected {
            tracing::warn!(expected, actual = mask.len(), "Rejected mask with wrong length");
            return Err(SessionError::MaskLengthMismatch {
                expected,
                actual: mask.len(),
            });
        }

        let kept = MaskOverlay::kept_count(&mask);
        self.overlay.update(Some(&mask));
        self.mask = Some(mask);
        tracing::info!(kept, total = expected, "Mask applied");
        Ok(kept)
    }

    pub fn clear_mask(&mut self) {
        self.mask = None;
        self.overlay.update(None);
    }

    /// Back to a fresh selection: no points, no mask, positive mode.
    /// The loaded point cloud stays.
    pub fn reset(&mut self) {
        self.selection.clear();
        self.clear_mask();
        self.selection_mode = PointLabel::Positive;
        tracing::info!("Session reset");
    }

    // --- accessors ---

    pub fn point_cloud(&self) -> Option<&Arc<PointCloudBuffer>> {
        self.cloud.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn selection_mode(&self) -> PointLabel {
        self.selection_mode
    }

    pub fn selection(&self) -> &SelectionSet {
        &self.selection
    }

    pub fn mask(&self) -> Option<&[u8]> {
        self.mask.as_deref()
    }

    /// Colors to render, with the mask applied
    pub fn display_colors(&self) -> &[f32] {
        self.overlay.display()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<Pending> {
        self.pending
    }

    pub fn can_segment(&self) -> bool {
        self.pending.is_none() && !self.selection.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use three_d::vec3;

    fn session_with_cloud() -> SegmentationSession {
        let mut session = SegmentationSession::new(&Config::default());
        session.set_point_cloud(PointCloudBuffer::from_flat(
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            vec![
                255.0, 0.0, 0.0, 0.0, 255.0, 0.0, 0.0, 0.0, 255.0, 255.0, 255.0, 255.0,
            ],
        ));
        session
    }

    fn status_error() -> ApiError {
        ApiError::Status {
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        }
    }

    #[test]
    fn test_empty_selection_is_rejected() {
        let mut session = session_with_cloud();
        assert!(matches!(session.begin_segmentation(), Err(SessionError::EmptySelection)));
        assert!(!session.is_loading());
    }

    #[test]
    fn test_request_partitions_by_label() {
        let mut session = session_with_cloud();
        session.add_point(vec3(1.0, 0.0, 0.0));
        session.set_selection_mode(PointLabel::Negative);
        session.add_point(vec3(0.0, 1.0, 0.0));

        let request = session.begin_segmentation().unwrap();
        assert_eq!(request.positive_points, vec![[1.0, 0.0, 0.0]]);
        assert_eq!(request.negative_points, vec![[0.0, 1.0, 0.0]]);
        assert!(session.is_loading());
        assert!(!session.can_segment());
        assert!(matches!(session.begin_segmentation(), Err(SessionError::SegmentationInFlight)));
    }

    #[test]
    fn test_completion_applies_mask() {
        let mut session = session_with_cloud();
        session.add_point(vec3(1.0, 0.0, 0.0));
        session.begin_segmentation().unwrap();

        let kept = session
            .complete_segmentation(Ok(SegmentationResponse { mask: vec![1, 0, 1, 0] }))
            .unwrap();
        assert_eq!(kept, 2);
        assert!(!session.is_loading());
        assert_eq!(&session.display_colors()[3..6], &[0.3, 0.3, 0.3]);
        assert_eq!(&session.display_colors()[6..9], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_failure_clears_loading_and_keeps_mask() {
        let mut session = session_with_cloud();
        session.set_mask(vec![0, 1, 1, 1]).unwrap();
        session.add_point(vec3(1.0, 0.0, 0.0));
        session.begin_segmentation().unwrap();

        let err = session.complete_segmentation(Err(status_error())).unwrap_err();
        assert!(matches!(err, SessionError::Api(_)));
        assert!(!session.is_loading());
        assert_eq!(session.mask(), Some(&[0u8, 1, 1, 1][..]));
    }

    #[test]
    fn test_mask_length_mismatch_is_rejected() {
        let mut session = session_with_cloud();
        session.set_mask(vec![1, 1, 0, 0]).unwrap();
        let before = session.display_colors().to_vec();

        let err = session.set_mask(vec![1, 0]).unwrap_err();
        assert!(matches!(err, SessionError::MaskLengthMismatch { expected: 4, actual: 2 }));
        assert_eq!(session.mask(), Some(&[1u8, 1, 0, 0][..]));
        assert_eq!(session.display_colors(), before.as_slice());
    }

    #[test]
    fn test_mask_without_cloud() {
        let mut session = SegmentationSession::new(&Config::default());
        assert!(matches!(session.set_mask(vec![1]), Err(SessionError::NoPointCloud)));
    }

    #[test]
    fn test_clear_mask_restores_colors() {
        let mut session = session_with_cloud();
        let original = session.display_colors().to_vec();
        session.set_mask(vec![0, 0, 0, 0]).unwrap();
        assert_ne!(session.display_colors(), original.as_slice());
        session.clear_mask();
        assert_eq!(session.display_colors(), original.as_slice());
        assert!(session.mask().is_none());
    }

    #[test]
    fn test_reload_drops_mask_and_bumps_generation() {
        let mut session = session_with_cloud();
        session.set_mask(vec![1, 0, 1, 0]).unwrap();
        session.add_point(vec3(0.0, 0.0, 0.0));
        let generation = session.generation();

        session.begin_load().unwrap();
        let count = session
            .finish_load(Ok(PointCloudBuffer::from_flat(vec![0.0; 6], vec![1.0; 6])))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(session.generation(), generation + 1);
        assert!(session.mask().is_none());
        assert_eq!(session.display_colors(), &[1.0; 6]);
        assert_eq!(session.selection().len(), 1);
        assert!(!session.is_loading());
    }

    #[test]
    fn test_failed_load_clears_loading() {
        let mut session = SegmentationSession::new(&Config::default());
        session.begin_load().unwrap();
        assert!(matches!(session.begin_load(), Err(SessionError::AlreadyLoading)));
        assert!(session.finish_load(Err(status_error())).is_err());
        assert!(!session.is_loading());
        assert!(session.point_cloud().is_none());
    }

    #[test]
    fn test_remove_and_reset() {
        let mut session = session_with_cloud();
        let id = session.add_point(vec3(0.0, 0.0, 0.0)).unwrap().id.clone();
        session.set_selection_mode(PointLabel::Negative);
        session.add_point(vec3(1.0, 0.0, 0.0));

        assert!(session.remove_nearest(vec3(1.001, 0.0, 0.0)).is_some());
        assert!(session.remove_point(&id).is_some());
        assert!(session.selection().is_empty());

        session.add_point(vec3(0.0, 1.0, 0.0));
        session.set_mask(vec![1, 1, 1, 1]).unwrap();
        session.reset();
        assert!(session.selection().is_empty());
        assert!(session.mask().is_none());
        assert_eq!(session.selection_mode(), PointLabel::Positive);
        assert!(session.point_cloud().is_some());
    }

    #[test]
    fn test_malformed_cloud_is_empty() {
        let mut session = SegmentationSession::new(&Config::default());
        session.set_point_cloud(PointCloudBuffer::from_flat(vec![0.0; 6], vec![0.0; 3]));
        assert!(session.display_colors().is_empty());
        assert!(session.set_mask(vec![]).is_ok());
    }
}
