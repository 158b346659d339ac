//! Renderable primitives built from a sparse model.

use super::Reconstruction;
use crate::errors::GeometryError;
use crate::geometry::{ply, PointCloud};
use nalgebra::{Matrix4, Point3, Vector3};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Axis length of camera frames, in model units.
pub const DEFAULT_FRAME_SIZE: f64 = 0.1;

const AXIS_COLORS: [[u8; 3]; 3] = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];
const UNCOLORED: [u8; 3] = [160, 160, 160];

/// A coordinate frame placed by a 4×4 pose.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateFrame {
    /// Maps frame-local coordinates into the world.
    pub pose: Matrix4<f64>,
    /// Axis length.
    pub size: f64,
    /// Image the frame belongs to, if any.
    pub label: Option<String>,
}

impl CoordinateFrame {
    /// Origin and the tips of the x, y and z axes, in world coordinates.
    #[must_use]
    pub fn axes(&self) -> [Point3<f64>; 4] {
        let map = |v: Vector3<f64>| self.pose.transform_point(&Point3::from(v * self.size));
        [
            map(Vector3::zeros()),
            map(Vector3::x()),
            map(Vector3::y()),
            map(Vector3::z()),
        ]
    }
}

/// Primitives for an external viewer: one point cloud plus camera frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    /// Model points.
    pub cloud: PointCloud,
    /// One frame per registered image.
    pub frames: Vec<CoordinateFrame>,
}

impl Scene {
    /// Builds a scene with a frame of `frame_size` at every camera pose.
    #[must_use]
    pub fn from_reconstruction(reconstruction: &Reconstruction, frame_size: f64) -> Self {
        let frames = reconstruction
            .images
            .iter()
            .map(|image| CoordinateFrame {
                pose: image.world_from_cam().to_homogeneous(),
                size: frame_size,
                label: Some(image.name.clone()),
            })
            .collect();
        Self {
            cloud: reconstruction.point_cloud(),
            frames,
        }
    }

    /// Flattens the scene to coloured vertices and axis edges.
    #[must_use]
    pub fn to_geometry(&self) -> (PointCloud, Vec<[usize; 2]>) {
        let base = self.cloud.len();
        let mut points = self.cloud.points.clone();
        let mut colors = self
            .cloud
            .colors
            .clone()
            .unwrap_or_else(|| vec![UNCOLORED; base]);
        let mut edges = Vec::with_capacity(self.frames.len() * 3);

        for frame in &self.frames {
            let [origin, x, y, z] = frame.axes();
            for (tip, color) in [x, y, z].into_iter().zip(AXIS_COLORS) {
                let start = points.len();
                points.push(origin);
                points.push(tip);
                colors.extend([color, color]);
                edges.push([start, start + 1]);
            }
        }

        (PointCloud::new(points).with_colors(colors), edges)
    }

    /// Writes the scene as an ASCII PLY with an `edge` element for the axes.
    pub fn write_ply(&self, path: &Path) -> Result<(), GeometryError> {
        let io_err = |source| GeometryError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let (cloud, edges) = self.to_geometry();
        let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
        ply::write_ply_ascii_with_edges(&mut writer, &cloud, &edges).map_err(io_err)?;
        writer.flush().map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelImage, ModelPoint};
    use pretty_assertions::assert_eq;

    fn reconstruction() -> Reconstruction {
        Reconstruction {
            points: vec![ModelPoint {
                id: 1,
                position: Point3::new(0.0, 0.0, 5.0),
                color: [1, 2, 3],
                error: 0.0,
                track_length: 2,
            }],
            images: vec![ModelImage::from_parts(
                1,
                1,
                "a.jpg".into(),
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, -1.0],
            )],
        }
    }

    #[test]
    fn test_frame_sits_at_camera_center() {
        let scene = Scene::from_reconstruction(&reconstruction(), DEFAULT_FRAME_SIZE);
        assert_eq!(scene.frames.len(), 1);

        let [origin, x, _, z] = scene.frames[0].axes();
        assert_eq!(origin, Point3::new(0.0, 0.0, 1.0));
        assert!((x - Point3::new(0.1, 0.0, 1.0)).norm() < 1e-12);
        assert!((z - Point3::new(0.0, 0.0, 1.1)).norm() < 1e-12);
    }

    #[test]
    fn test_geometry_layout() {
        let scene = Scene::from_reconstruction(&reconstruction(), 0.5);
        let (cloud, edges) = scene.to_geometry();

        assert_eq!(cloud.len(), 1 + 6);
        assert_eq!(edges, vec![[1, 2], [3, 4], [5, 6]]);
        let colors = cloud.colors.unwrap();
        assert_eq!(colors[0], [1, 2, 3]);
        assert_eq!(colors[1], [255, 0, 0]);
        assert_eq!(colors[6], [0, 0, 255]);
    }

    #[test]
    fn test_write_ply() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("scene.ply");
        Scene::from_reconstruction(&reconstruction(), DEFAULT_FRAME_SIZE)
            .write_ply(&path)
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("element vertex 7\n"));
        assert!(text.contains("element edge 3\n"));
        let back = ply::read_ply_file(&path).unwrap();
        assert_eq!(back.len(), 7);
    }
}
