//! Eye aspect ratio (EAR) computation from facial landmarks.
//!
//! Landmark extraction itself is an external capability, modelled here by the
//! [`LandmarkProvider`] trait. Given the six contour points of each eye, the
//! EAR is the ratio of the two vertical lid distances to the eye width:
//!
//! ```text
//! EAR = (|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)
//! ```
//!
//! The per-frame value is the mean of both eyes.

use serde::{Deserialize, Serialize};

/// A 2-D landmark coordinate (pixel or normalised space, as long as both eyes
/// use the same one).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point
    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Six contour points of one eye, ordered `p0..p5`.
///
/// `p0` and `p3` are the horizontal corners; `(p1, p5)` and `(p2, p4)` are the
/// upper/lower lid pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeLandmarks(pub [Point; 6]);

impl EyeLandmarks {
    /// Eye aspect ratio for this eye.
    ///
    /// Returns `None` when the eye has no horizontal extent (corners collapse
    /// onto each other) or the landmarks contain non-finite coordinates.
    pub fn aspect_ratio(&self) -> Option<f64> {
        let p = &self.0;
        let vertical_a = p[1].distance(&p[5]);
        let vertical_b = p[2].distance(&p[4]);
        let horizontal = p[0].distance(&p[3]);

        if !horizontal.is_finite() || horizontal <= f64::EPSILON {
            return None;
        }

        let ear = (vertical_a + vertical_b) / (2.0 * horizontal);
        ear.is_finite().then_some(ear)
    }
}

/// Landmarks for the first detected face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left: EyeLandmarks,
    pub right: EyeLandmarks,
}

impl FaceLandmarks {
    /// Mean EAR across both eyes
    pub fn ear(&self) -> Option<f64> {
        let left = self.left.aspect_ratio()?;
        let right = self.right.aspect_ratio()?;
        Some((left + right) / 2.0)
    }
}

/// EAR for a frame, or `None` when no face was found.
pub fn face_ear(face: Option<&FaceLandmarks>) -> Option<f64> {
    face.and_then(FaceLandmarks::ear)
}

/// Source of facial landmarks for video frames.
///
/// Implementations return at most one face; when several faces are visible
/// only the first detected one is reported.
pub trait LandmarkProvider {
    /// Opaque frame type understood by the provider
    type Frame;

    /// Detect eye landmarks in a frame, or `None` if no face is present
    fn detect(&mut self, frame: &Self::Frame) -> Option<FaceLandmarks>;

    /// Convenience: detect and reduce straight to an EAR value
    fn frame_ear(&mut self, frame: &Self::Frame) -> Option<f64> {
        face_ear(self.detect(frame).as_ref())
    }
}
