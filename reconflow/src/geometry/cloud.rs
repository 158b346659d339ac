//! In-memory point clouds.

use nalgebra::{Point3, Vector3};

/// A point cloud with optional per-point normals and colours.
///
/// When present, `normals` and `colors` have one entry per point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    /// Point positions.
    pub points: Vec<Point3<f64>>,
    /// Unit normals.
    pub normals: Option<Vec<Vector3<f64>>>,
    /// 8-bit RGB colours.
    pub colors: Option<Vec<[u8; 3]>>,
}

impl PointCloud {
    /// Creates a cloud from positions only.
    #[must_use]
    pub fn new(points: Vec<Point3<f64>>) -> Self {
        Self {
            points,
            normals: None,
            colors: None,
        }
    }

    /// Sets per-point colours.
    #[must_use]
    pub fn with_colors(mut self, colors: Vec<[u8; 3]>) -> Self {
        self.colors = Some(colors);
        self
    }

    /// Sets per-point normals.
    #[must_use]
    pub fn with_normals(mut self, normals: Vec<Vector3<f64>>) -> Self {
        self.normals = Some(normals);
        self
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if the cloud has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Returns true if the cloud carries normals.
    #[must_use]
    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Arithmetic mean of the points, or `None` for an empty cloud.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords);
        Some(Point3::from(sum / self.points.len() as f64))
    }

    /// Appends another cloud. Attributes missing on either side are dropped.
    pub fn extend(&mut self, other: Self) {
        let normals = match (self.normals.take(), other.normals) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            (None, None) if self.points.is_empty() => None,
            (None, Some(b)) if self.points.is_empty() => Some(b),
            _ => None,
        };
        let colors = match (self.colors.take(), other.colors) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            (None, Some(b)) if self.points.is_empty() => Some(b),
            _ => None,
        };
        self.points.extend(other.points);
        self.normals = normals;
        self.colors = colors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centroid() {
        let cloud = PointCloud::new(vec![Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 4.0, 6.0)]);
        assert_eq!(cloud.centroid(), Some(Point3::new(1.0, 2.0, 3.0)));
        assert_eq!(PointCloud::default().centroid(), None);
    }

    #[test]
    fn test_extend_keeps_shared_attributes() {
        let mut a = PointCloud::new(vec![Point3::origin()]).with_colors(vec![[1, 2, 3]]);
        let b = PointCloud::new(vec![Point3::new(1.0, 0.0, 0.0)])
            .with_colors(vec![[4, 5, 6]])
            .with_normals(vec![Vector3::z()]);
        a.extend(b);

        assert_eq!(a.len(), 2);
        assert_eq!(a.colors, Some(vec![[1, 2, 3], [4, 5, 6]]));
        assert!(!a.has_normals());
    }

    #[test]
    fn test_extend_into_empty_takes_attributes() {
        let mut a = PointCloud::default();
        a.extend(PointCloud::new(vec![Point3::origin()]).with_normals(vec![Vector3::x()]));
        assert!(a.has_normals());
    }
}
