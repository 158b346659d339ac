//! Sparse reconstruction models written by the reconstruction engine.
//!
//! A model directory (`<results>/reconstruction/<n>/`) holds `points3D` and
//! `images` files in either the text (`.txt`) or binary (`.bin`) format.
//! When both exist the binary file wins, matching the engine's own reader.

mod binary;
mod scene;
mod text;

pub use scene::{CoordinateFrame, Scene, DEFAULT_FRAME_SIZE};

use crate::errors::ModelError;
use crate::geometry::PointCloud;
use nalgebra::{Isometry3, Matrix4, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};
use std::path::{Path, PathBuf};

/// One triangulated point.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPoint {
    /// Point identifier.
    pub id: u64,
    /// World position.
    pub position: Point3<f64>,
    /// RGB colour.
    pub color: [u8; 3],
    /// Mean reprojection error.
    pub error: f64,
    /// Number of observations.
    pub track_length: usize,
}

/// One registered image and its pose.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelImage {
    /// Image identifier.
    pub id: u32,
    /// Camera identifier.
    pub camera_id: u32,
    /// File name relative to the image directory.
    pub name: String,
    /// Rigid transform from world to camera coordinates.
    pub cam_from_world: Isometry3<f64>,
}

impl ModelImage {
    /// Builds the pose from the engine's `qw qx qy qz tx ty tz` encoding.
    #[must_use]
    pub fn from_parts(id: u32, camera_id: u32, name: String, q: [f64; 4], t: [f64; 3]) -> Self {
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]));
        Self {
            id,
            camera_id,
            name,
            cam_from_world: Isometry3::from_parts(Translation3::new(t[0], t[1], t[2]), rotation),
        }
    }

    /// The world-to-camera transform as a homogeneous 4×4 matrix.
    #[must_use]
    pub fn cam_from_world_matrix(&self) -> Matrix4<f64> {
        self.cam_from_world.to_homogeneous()
    }

    /// The camera-to-world transform, i.e. the camera's pose in the world.
    #[must_use]
    pub fn world_from_cam(&self) -> Isometry3<f64> {
        self.cam_from_world.inverse()
    }

    /// The projection centre in world coordinates.
    #[must_use]
    pub fn center(&self) -> Point3<f64> {
        self.world_from_cam() * Point3::origin()
    }

    /// The viewing direction (camera +z) in world coordinates.
    #[must_use]
    pub fn viewing_direction(&self) -> Vector3<f64> {
        self.world_from_cam() * Vector3::z()
    }
}

/// A loaded sparse model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    /// Triangulated points, in file order.
    pub points: Vec<ModelPoint>,
    /// Registered images, sorted by id.
    pub images: Vec<ModelImage>,
}

impl Reconstruction {
    /// Loads `points3D` and `images` from a model directory.
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let points = match locate(dir, "points3D")? {
            (path, Format::Binary) => binary::read_points(&path)?,
            (path, Format::Text) => text::read_points(&path)?,
        };
        let mut images = match locate(dir, "images")? {
            (path, Format::Binary) => binary::read_images(&path)?,
            (path, Format::Text) => text::read_images(&path)?,
        };
        images.sort_by_key(|image| image.id);

        tracing::debug!(
            dir = %dir.display(),
            points = points.len(),
            images = images.len(),
            "Loaded sparse model"
        );
        Ok(Self { points, images })
    }

    /// The points as a coloured point cloud.
    #[must_use]
    pub fn point_cloud(&self) -> PointCloud {
        PointCloud::new(self.points.iter().map(|p| p.position).collect())
            .with_colors(self.points.iter().map(|p| p.color).collect())
    }

    /// Looks up an image by name.
    #[must_use]
    pub fn image(&self, name: &str) -> Option<&ModelImage> {
        self.images.iter().find(|image| image.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Text,
    Binary,
}

fn locate(dir: &Path, stem: &str) -> Result<(PathBuf, Format), ModelError> {
    let bin = dir.join(format!("{stem}.bin"));
    if bin.is_file() {
        return Ok((bin, Format::Binary));
    }
    let txt = dir.join(format!("{stem}.txt"));
    if txt.is_file() {
        return Ok((txt, Format::Text));
    }
    Err(ModelError::MissingFile {
        dir: dir.to_path_buf(),
        name: stem.to_string(),
    })
}
