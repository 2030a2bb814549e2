//! Labeled seed points for segmentation
//!
//! Insertion order is the only order. Proximity checks are linear scans;
//! a selection holds tens of points, not thousands.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use three_d::{InnerSpace, Vec3};

pub const DEFAULT_PROXIMITY_RADIUS: f32 = 0.01;
pub const DEFAULT_REMOVE_RADIUS: f32 = 0.02;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Include/exclude meaning of a seed point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointLabel {
    Positive,
    Negative,
}

impl PointLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            PointLabel::Positive => "positive",
            PointLabel::Negative => "negative",
        }
    }
}

impl std::fmt::Display for PointLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPoint {
    pub id: String,
    pub position: Vec3,
    pub label: PointLabel,
}

/// Never reused within a process: wall-clock millis plus a sequence number
fn fresh_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", millis, seq)
}

#[derive(Debug, Clone)]
pub struct SelectionSet {
    points: Vec<SelectedPoint>,
    proximity_radius: f32,
}

impl Default for SelectionSet {
    fn default() -> Self {
        Self::new(DEFAULT_PROXIMITY_RADIUS)
    }
}

impl SelectionSet {
    pub fn new(proximity_radius: f32) -> Self {
        Self {
            points: Vec::new(),
            proximity_radius,
        }
    }

    pub fn proximity_radius(&self) -> f32 {
        self.proximity_radius
    }

    /// Append a point unless an existing member lies within the proximity
    /// radius. Returns the new member, `None` when rejected.
    pub fn add(&mut self, position: Vec3, label: PointLabel) -> Option<&SelectedPoint> {
        let r2 = self.proximity_radius * self.proximity_radius;
        if self
            .points
            .iter()
            .any(|p| (p.position - position).magnitude2() < r2)
        {
            tracing::debug!(?position, "Point too close to an existing selection, skipped");
            return None;
        }

        self.points.push(SelectedPoint {
            id: fresh_id(),
            position,
            label,
        });
        self.points.last()
    }

    /// Remove the member closest to `position` within `radius`.
    /// Exact ties go to the earliest inserted.
    pub fn remove_nearest(&mut self, position: Vec3, radius: f32) -> Option<SelectedPoint> {
        let r2 = radius * radius;
        let mut best: Option<(usize, f32)> = None;
        for (i, p) in self.points.iter().enumerate() {
            let d2 = (p.position - position).magnitude2();
            if d2 > r2 {
                continue;
            }
            match best {
                Some((_, best_d2)) if d2 >= best_d2 => {}
                _ => best = Some((i, d2)),
            }
        }
        best.map(|(i, _)| self.points.remove(i))
    }

    pub fn remove(&mut self, id: &str) -> Option<SelectedPoint> {
        let i = self.points.iter().position(|p| p.id == id)?;
        Some(self.points.remove(i))
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SelectedPoint> {
        self.points.iter()
    }

    pub fn as_slice(&self) -> &[SelectedPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn count(&self, label: PointLabel) -> usize {
        self.points.iter().filter(|p| p.label == label).count()
    }

    /// Positions split by label, each in insertion order
    pub fn partition(&self) -> (Vec<[f32; 3]>, Vec<[f32; 3]>) {
        let mut positives = Vec::new();
        let mut negatives = Vec::new();
        for p in &self.points {
            let xyz = [p.position.x, p.position.y, p.position.z];
            match p.label {
                PointLabel::Positive => positives.push(xyz),
                PointLabel::Negative => negatives.push(xyz),
            }
        }
        (positives, negatives)
    }
}
