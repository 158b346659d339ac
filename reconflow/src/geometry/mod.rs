//! Point cloud geometry used by the in-process reconstruction stages.
//!
//! Stages reach geometry through the [`GeometryLibrary`] trait so that
//! pipelines can be tested without touching real point clouds.

mod cloud;
pub mod normals;
pub mod ply;

pub use cloud::PointCloud;

use crate::errors::GeometryError;
use std::path::Path;

/// Point cloud operations needed by the pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait GeometryLibrary: Send + Sync {
    /// Reads a point cloud from a PLY file.
    fn read_point_cloud(&self, path: &Path) -> Result<PointCloud, GeometryError>;

    /// Writes a point cloud to a PLY file.
    fn write_point_cloud(&self, path: &Path, cloud: &PointCloud) -> Result<(), GeometryError>;

    /// Replaces the cloud's normals with estimates from `k` neighbours.
    fn estimate_normals(&self, cloud: &mut PointCloud, k: usize) -> Result<(), GeometryError>;

    /// Makes the cloud's normals consistently oriented.
    fn orient_normals(&self, cloud: &mut PointCloud, k: usize) -> Result<(), GeometryError>;
}

/// The built-in implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeGeometry;

impl GeometryLibrary for NativeGeometry {
    fn read_point_cloud(&self, path: &Path) -> Result<PointCloud, GeometryError> {
        ply::read_ply_file(path)
    }

    fn write_point_cloud(&self, path: &Path, cloud: &PointCloud) -> Result<(), GeometryError> {
        ply::write_ply_file(path, cloud)
    }

    fn estimate_normals(&self, cloud: &mut PointCloud, k: usize) -> Result<(), GeometryError> {
        normals::estimate_normals(cloud, k)
    }

    fn orient_normals(&self, cloud: &mut PointCloud, k: usize) -> Result<(), GeometryError> {
        normals::orient_normals(cloud, k)
    }
}

/// Re-estimates and orients the normals of the cloud at `input`, writing
/// the result to `output`.
pub fn fix_normals(
    geometry: &dyn GeometryLibrary,
    input: &Path,
    output: &Path,
    estimate_neighbors: usize,
    orient_neighbors: usize,
) -> Result<usize, GeometryError> {
    let mut cloud = geometry.read_point_cloud(input)?;
    geometry.estimate_normals(&mut cloud, estimate_neighbors)?;
    geometry.orient_normals(&mut cloud, orient_neighbors)?;
    geometry.write_point_cloud(output, &cloud)?;
    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        points = cloud.len(),
        "Normals re-estimated"
    );
    Ok(cloud.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use nalgebra::Point3;

    #[test]
    fn test_fix_normals_calls_in_order() {
        let mut mock = MockGeometryLibrary::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_read_point_cloud()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(PointCloud::new(vec![Point3::origin(); 4])));
        mock.expect_estimate_normals()
            .with(mockall::predicate::always(), eq(30))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_orient_normals()
            .with(mockall::predicate::always(), eq(15))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_write_point_cloud()
            .withf(|path, cloud| path == Path::new("out.ply") && cloud.len() == 4)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let n = fix_normals(&mock, Path::new("in.ply"), Path::new("out.ply"), 30, 15).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn test_fix_normals_stops_on_error() {
        let mut mock = MockGeometryLibrary::new();
        mock.expect_read_point_cloud()
            .returning(|_| Err(GeometryError::Parse("bad header".to_string())));
        mock.expect_write_point_cloud().never();

        let err = fix_normals(&mock, Path::new("in.ply"), Path::new("out.ply"), 30, 30).unwrap_err();
        assert!(matches!(err, GeometryError::Parse(_)));
    }

    #[test]
    fn test_native_fix_normals_on_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = tmp.path().join("fused.ply");
        let output = tmp.path().join("fused_fixed.ply");

        let points = (0..25)
            .map(|i| Point3::new(f64::from(i % 5), f64::from(i / 5), 0.0))
            .collect();
        ply::write_ply_file(&input, &PointCloud::new(points)).unwrap();

        let n = fix_normals(&NativeGeometry, &input, &output, 8, 8).unwrap();
        assert_eq!(n, 25);
        let fixed = ply::read_ply_file(&output).unwrap();
        assert!(fixed.normals.unwrap().iter().all(|v| v.z.abs() > 0.999));
    }
}
