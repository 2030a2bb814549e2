//! Mask recoloring
//!
//! Display colors are always recomputed from the originals captured at load,
//! so applying and clearing masks any number of times is lossless.

/// Per-point in/out labels aligned with the point buffer
pub type SegmentationMask = Vec<u8>;

pub const DEFAULT_DIM_GRAY: f32 = 0.3;

/// Recolor `original` from `mask`.
///
/// Mask 1 keeps the original triple, mask 0 becomes `dim_gray` on every
/// channel. Points past the end of the mask keep their color, and `None`
/// returns an exact copy of the originals.
pub fn apply(original: &[f32], mask: Option<&[u8]>, dim_gray: f32) -> Vec<f32> {
    let mut out = original.to_vec();
    let Some(mask) = mask else {
        return out;
    };

    for (rgb, &m) in out.chunks_exact_mut(3).zip(mask) {
        if m == 0 {
            rgb.fill(dim_gray);
        }
    }
    out
}

/// Owns the load-time colors and the current display colors
#[derive(Debug, Clone, Default)]
pub struct MaskOverlay {
    original: Vec<f32>,
    display: Vec<f32>,
    dim_gray: f32,
}

impl MaskOverlay {
    pub fn new(original: Vec<f32>, dim_gray: f32) -> Self {
        Self {
            display: original.clone(),
            original,
            dim_gray,
        }
    }

    pub fn original(&self) -> &[f32] {
        &self.original
    }

    pub fn display(&self) -> &[f32] {
        &self.display
    }

    /// Recompute display colors for `mask`, `None` restores the originals
    pub fn update(&mut self, mask: Option<&[u8]>) {
        self.display = apply(&self.original, mask, self.dim_gray);
    }

    /// Number of points shown in their original color under `mask`
    pub fn kept_count(mask: &[u8]) -> usize {
        mask.iter().filter(|&&m| m != 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_colors() -> Vec<f32> {
        vec![
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0, //
            1.0, 1.0, 1.0,
        ]
    }

    #[test]
    fn test_alternating_mask() {
        let colors = four_colors();
        let out = apply(&colors, Some(&[1, 0, 1, 0]), 0.3);
        assert_eq!(&out[0..3], &colors[0..3]);
        assert_eq!(&out[3..6], &[0.3, 0.3, 0.3]);
        assert_eq!(&out[6..9], &colors[6..9]);
        assert_eq!(&out[9..12], &[0.3, 0.3, 0.3]);
    }

    #[test]
    fn test_no_mask_is_identity() {
        let colors = four_colors();
        assert_eq!(apply(&colors, None, 0.3), colors);
    }

    #[test]
    fn test_short_mask_keeps_tail() {
        let colors = four_colors();
        let out = apply(&colors, Some(&[0]), 0.5);
        assert_eq!(&out[0..3], &[0.5, 0.5, 0.5]);
        assert_eq!(&out[3..], &colors[3..]);
    }

    #[test]
    fn test_repeated_cycles_restore_originals() {
        let mut overlay = MaskOverlay::new(four_colors(), DEFAULT_DIM_GRAY);
        for _ in 0..5 {
            overlay.update(Some(&[0, 0, 1, 0]));
            overlay.update(Some(&[1, 0, 0, 1]));
            overlay.update(None);
        }
        assert_eq!(overlay.display(), four_colors().as_slice());
        assert_eq!(overlay.original(), four_colors().as_slice());
    }

    #[test]
    fn test_kept_count() {
        assert_eq!(MaskOverlay::kept_count(&[1, 0, 1, 0, 1]), 3);
        assert_eq!(MaskOverlay::kept_count(&[]), 0);
    }
}
