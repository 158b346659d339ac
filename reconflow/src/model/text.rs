//! Text model files (`points3D.txt`, `images.txt`).

use super::{ModelImage, ModelPoint};
use crate::errors::ModelError;
use nalgebra::Point3;
use std::path::Path;
use std::str::FromStr;

fn read(path: &Path) -> Result<String, ModelError> {
    std::fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })
}

struct Fields<'a> {
    file: &'a Path,
    line: usize,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn new(file: &'a Path, line: usize, text: &'a str) -> Self {
        Self {
            file,
            line,
            tokens: text.split_whitespace(),
        }
    }

    fn error(&self, message: String) -> ModelError {
        ModelError::Parse {
            file: self.file.to_path_buf(),
            line: self.line,
            message,
        }
    }

    fn next<T: FromStr>(&mut self, what: &str) -> Result<T, ModelError> {
        let token = self
            .tokens
            .next()
            .ok_or_else(|| self.error(format!("missing {what}")))?;
        token
            .parse()
            .map_err(|_| self.error(format!("invalid {what} '{token}'")))
    }

    fn rest(&mut self) -> usize {
        self.tokens.by_ref().count()
    }
}

/// Lines that are neither comments nor blank, with 1-based line numbers.
fn data_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| !l.trim_start().starts_with('#') && !l.trim().is_empty())
}

/// Parses `POINT3D_ID X Y Z R G B ERROR TRACK[] as (IMAGE_ID, POINT2D_IDX)`.
pub(super) fn read_points(path: &Path) -> Result<Vec<ModelPoint>, ModelError> {
    let content = read(path)?;
    data_lines(&content)
        .map(|(n, line)| {
            let mut f = Fields::new(path, n, line);
            let id = f.next("point id")?;
            let position = Point3::new(f.next("x")?, f.next("y")?, f.next("z")?);
            let color = [f.next("red")?, f.next("green")?, f.next("blue")?];
            let error = f.next("error")?;
            let track = f.rest();
            if track % 2 != 0 {
                return Err(f.error("track has an odd number of entries".to_string()));
            }
            Ok(ModelPoint {
                id,
                position,
                color,
                error,
                track_length: track / 2,
            })
        })
        .collect()
}

/// Parses pairs of lines: `IMAGE_ID QW QX QY QZ TX TY TZ CAMERA_ID NAME`
/// followed by the image's 2D points, which may be an empty line.
pub(super) fn read_images(path: &Path) -> Result<Vec<ModelImage>, ModelError> {
    let content = read(path)?;
    let mut images = Vec::new();
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l))
        .filter(|(_, l)| !l.trim_start().starts_with('#'));

    while let Some((n, line)) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        let mut f = Fields::new(path, n, line);
        let id = f.next("image id")?;
        let q = [f.next("qw")?, f.next("qx")?, f.next("qy")?, f.next("qz")?];
        let t = [f.next("tx")?, f.next("ty")?, f.next("tz")?];
        let camera_id = f.next("camera id")?;
        let name: String = f.next("name")?;
        images.push(ModelImage::from_parts(id, camera_id, name, q, t));

        // Observations line.
        lines.next();
    }
    Ok(images)
}
