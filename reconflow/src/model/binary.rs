//! Binary model files (`points3D.bin`, `images.bin`), little-endian.

use super::{ModelImage, ModelPoint};
use crate::errors::ModelError;
use nalgebra::Point3;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

struct RecordReader<R> {
    inner: R,
    file: PathBuf,
    record: usize,
}

impl RecordReader<BufReader<File>> {
    fn open(path: &Path) -> Result<Self, ModelError> {
        let file = File::open(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file), path))
    }
}

impl<R: Read> RecordReader<R> {
    fn new(inner: R, path: &Path) -> Self {
        Self {
            inner,
            file: path.to_path_buf(),
            record: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ModelError {
        ModelError::Parse {
            file: self.file.clone(),
            line: self.record,
            message: message.into(),
        }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], ModelError> {
        let mut buf = [0u8; N];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| self.error("unexpected end of file"))?;
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, ModelError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, ModelError> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64, ModelError> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn f64(&mut self) -> Result<f64, ModelError> {
        Ok(f64::from_le_bytes(self.bytes()?))
    }

    fn count(&mut self) -> Result<usize, ModelError> {
        let n = self.u64()?;
        usize::try_from(n).map_err(|_| self.error(format!("count {n} out of range")))
    }

    fn skip(&mut self, len: usize) -> Result<(), ModelError> {
        let len = len as u64;
        let mut limited = (&mut self.inner).take(len);
        let copied = std::io::copy(&mut limited, &mut std::io::sink());
        match copied {
            Ok(n) if n == len => Ok(()),
            Ok(_) => Err(self.error("unexpected end of file")),
            Err(e) => Err(self.error(e.to_string())),
        }
    }

    fn cstring(&mut self) -> Result<String, ModelError> {
        let mut buf = Vec::new();
        loop {
            match self.u8()? {
                0 => break,
                b => buf.push(b),
            }
        }
        String::from_utf8(buf).map_err(|_| self.error("image name is not UTF-8"))
    }
}

pub(super) fn read_points(path: &Path) -> Result<Vec<ModelPoint>, ModelError> {
    parse_points(&mut RecordReader::open(path)?)
}

pub(super) fn read_images(path: &Path) -> Result<Vec<ModelImage>, ModelError> {
    parse_images(&mut RecordReader::open(path)?)
}

fn parse_points<R: Read>(r: &mut RecordReader<R>) -> Result<Vec<ModelPoint>, ModelError> {
    let n = r.count()?;
    let mut points = Vec::with_capacity(n.min(1 << 20));
    for i in 0..n {
        r.record = i + 1;
        let id = r.u64()?;
        let position = Point3::new(r.f64()?, r.f64()?, r.f64()?);
        let color = [r.u8()?, r.u8()?, r.u8()?];
        let error = r.f64()?;
        let track_length = r.count()?;
        // (image_id: u32, point2D_idx: u32) per observation.
        r.skip(track_length.saturating_mul(8))?;
        points.push(ModelPoint {
            id,
            position,
            color,
            error,
            track_length,
        });
    }
    Ok(points)
}

fn parse_images<R: Read>(r: &mut RecordReader<R>) -> Result<Vec<ModelImage>, ModelError> {
    let n = r.count()?;
    let mut images = Vec::with_capacity(n.min(1 << 16));
    for i in 0..n {
        r.record = i + 1;
        let id = r.u32()?;
        let q = [r.f64()?, r.f64()?, r.f64()?, r.f64()?];
        let t = [r.f64()?, r.f64()?, r.f64()?];
        let camera_id = r.u32()?;
        let name = r.cstring()?;
        let observations = r.count()?;
        // (x: f64, y: f64, point3D_id: u64) per observation.
        r.skip(observations.saturating_mul(24))?;
        images.push(ModelImage::from_parts(id, camera_id, name, q, t));
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn put_f64s(buf: &mut Vec<u8>, values: &[f64]) {
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn points_bin() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&42u64.to_le_bytes());
        put_f64s(&mut buf, &[1.0, 2.0, 3.0]);
        buf.extend_from_slice(&[9, 8, 7]);
        put_f64s(&mut buf, &[0.5]);
        buf.extend_from_slice(&2u64.to_le_bytes());
        for v in [1u32, 0, 2, 5] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn test_parse_points() {
        let data = points_bin();
        let mut r = RecordReader::new(Cursor::new(data), Path::new("points3D.bin"));
        let points = parse_points(&mut r).unwrap();

        assert_eq!(
            points,
            vec![ModelPoint {
                id: 42,
                position: Point3::new(1.0, 2.0, 3.0),
                color: [9, 8, 7],
                error: 0.5,
                track_length: 2,
            }]
        );
    }

    #[test]
    fn test_parse_images() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        put_f64s(&mut buf, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0]);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(b"frame_003.png\0");
        buf.extend_from_slice(&1u64.to_le_bytes());
        put_f64s(&mut buf, &[100.0, 200.0]);
        buf.extend_from_slice(&u64::MAX.to_le_bytes());

        let mut r = RecordReader::new(Cursor::new(buf), Path::new("images.bin"));
        let images = parse_images(&mut r).unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, 3);
        assert_eq!(images[0].name, "frame_003.png");
        assert_eq!(images[0].center(), Point3::new(0.0, 0.0, -2.0));
    }

    #[test]
    fn test_truncated_record() {
        let mut data = points_bin();
        data.truncate(data.len() - 3);
        let mut r = RecordReader::new(Cursor::new(data), Path::new("points3D.bin"));

        let err = parse_points(&mut r).unwrap_err();
        assert!(matches!(err, ModelError::Parse { line: 1, .. }));
    }
}
