//! PLY (Polygon File Format) point cloud I/O.
//!
//! Reading accepts `ascii`, `binary_little_endian` and `binary_big_endian`
//! files with any scalar property types. Only the `vertex` element is
//! decoded; elements before it are skipped, elements after it are ignored.
//! Writing produces `binary_little_endian` with `float` positions and
//! normals and `uchar` colours, the layout the reconstruction engine emits.

use super::PointCloud;
use crate::artifacts::staging_path;
use crate::errors::GeometryError;
use nalgebra::{Point3, Vector3};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "char" | "int8" => Self::I8,
            "uchar" | "uint8" => Self::U8,
            "short" | "int16" => Self::I16,
            "ushort" | "uint16" => Self::U16,
            "int" | "int32" => Self::I32,
            "uint" | "uint32" => Self::U32,
            "float" | "float32" => Self::F32,
            "double" | "float64" => Self::F64,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    fn decode(self, bytes: &[u8], big_endian: bool) -> f64 {
        macro_rules! num {
            ($t:ty, $n:expr) => {{
                let mut buf = [0u8; $n];
                buf.copy_from_slice(&bytes[..$n]);
                if big_endian {
                    <$t>::from_be_bytes(buf)
                } else {
                    <$t>::from_le_bytes(buf)
                }
            }};
        }
        match self {
            Self::I8 => f64::from(num!(i8, 1)),
            Self::U8 => f64::from(num!(u8, 1)),
            Self::I16 => f64::from(num!(i16, 2)),
            Self::U16 => f64::from(num!(u16, 2)),
            Self::I32 => f64::from(num!(i32, 4)),
            Self::U32 => f64::from(num!(u32, 4)),
            Self::F32 => f64::from(num!(f32, 4)),
            Self::F64 => num!(f64, 8),
        }
    }
}

#[derive(Debug, Clone)]
enum Property {
    Scalar { name: String, ty: Scalar },
    List { name: String, count: Scalar, item: Scalar },
}

impl Property {
    fn name(&self) -> &str {
        match self {
            Self::Scalar { name, .. } | Self::List { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
}

#[derive(Debug)]
struct Header {
    encoding: Encoding,
    elements: Vec<Element>,
}

fn parse_error(msg: impl Into<String>) -> GeometryError {
    GeometryError::Parse(msg.into())
}

fn read_header<R: BufRead>(reader: &mut R) -> Result<Header, GeometryError> {
    let mut line = String::new();
    let mut next_line = |line: &mut String| -> Result<bool, GeometryError> {
        line.clear();
        let n = reader
            .read_line(line)
            .map_err(|e| parse_error(format!("cannot read header: {e}")))?;
        Ok(n > 0)
    };

    if !next_line(&mut line)? || line.trim() != "ply" {
        return Err(parse_error("missing 'ply' magic line"));
    }

    let mut encoding = None;
    let mut elements: Vec<Element> = Vec::new();

    loop {
        if !next_line(&mut line)? {
            return Err(parse_error("unexpected end of file in header"));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["end_header"] => break,
            ["format", format, _version] => {
                encoding = Some(match *format {
                    "ascii" => Encoding::Ascii,
                    "binary_little_endian" => Encoding::BinaryLittleEndian,
                    "binary_big_endian" => Encoding::BinaryBigEndian,
                    other => return Err(GeometryError::Unsupported(format!("format '{other}'"))),
                });
            }
            ["comment", ..] | ["obj_info", ..] | [] => {}
            ["element", name, count] => {
                let count = count
                    .parse()
                    .map_err(|_| parse_error(format!("invalid element count '{count}'")))?;
                elements.push(Element {
                    name: (*name).to_string(),
                    count,
                    properties: Vec::new(),
                });
            }
            ["property", "list", count, item, name] => {
                let property = Property::List {
                    name: (*name).to_string(),
                    count: scalar(count)?,
                    item: scalar(item)?,
                };
                current(&mut elements)?.properties.push(property);
            }
            ["property", ty, name] => {
                let property = Property::Scalar {
                    name: (*name).to_string(),
                    ty: scalar(ty)?,
                };
                current(&mut elements)?.properties.push(property);
            }
            _ => return Err(parse_error(format!("unrecognised header line '{}'", line.trim()))),
        }
    }

    let encoding = encoding.ok_or_else(|| parse_error("header has no format line"))?;
    Ok(Header { encoding, elements })
}

fn scalar(name: &str) -> Result<Scalar, GeometryError> {
    Scalar::parse(name).ok_or_else(|| GeometryError::Unsupported(format!("property type '{name}'")))
}

fn current(elements: &mut [Element]) -> Result<&mut Element, GeometryError> {
    elements
        .last_mut()
        .ok_or_else(|| parse_error("property declared before any element"))
}

/// Reads the values of one record; list properties are consumed and dropped.
trait RecordSource {
    fn scalar(&mut self, ty: Scalar) -> Result<f64, GeometryError>;

    fn record(&mut self, properties: &[Property], out: &mut Vec<f64>) -> Result<(), GeometryError> {
        out.clear();
        for property in properties {
            match property {
                Property::Scalar { ty, .. } => {
                    let v = self.scalar(*ty)?;
                    out.push(v);
                }
                Property::List { count, item, .. } => {
                    let n = list_len(self.scalar(*count)?)?;
                    for _ in 0..n {
                        self.scalar(*item)?;
                    }
                    out.push(f64::NAN);
                }
            }
        }
        self.end_record()
    }

    fn end_record(&mut self) -> Result<(), GeometryError> {
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn list_len(n: f64) -> Result<usize, GeometryError> {
    if n < 0.0 || n.fract() != 0.0 {
        return Err(parse_error(format!("invalid list length {n}")));
    }
    Ok(n as usize)
}

struct AsciiSource<R> {
    reader: R,
    line: String,
    tokens: Vec<String>,
    pos: usize,
}

impl<R: BufRead> RecordSource for AsciiSource<R> {
    fn scalar(&mut self, _ty: Scalar) -> Result<f64, GeometryError> {
        while self.pos >= self.tokens.len() {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| parse_error(format!("cannot read data: {e}")))?;
            if n == 0 {
                return Err(parse_error("truncated ascii data"));
            }
            self.tokens = self.line.split_whitespace().map(String::from).collect();
            self.pos = 0;
        }
        let token = &self.tokens[self.pos];
        self.pos += 1;
        token
            .parse()
            .map_err(|_| parse_error(format!("invalid number '{token}'")))
    }

    fn end_record(&mut self) -> Result<(), GeometryError> {
        // One record per line.
        self.tokens.clear();
        self.pos = 0;
        Ok(())
    }
}

struct BinarySource<R> {
    reader: R,
    big_endian: bool,
}

impl<R: Read> RecordSource for BinarySource<R> {
    fn scalar(&mut self, ty: Scalar) -> Result<f64, GeometryError> {
        let mut buf = [0u8; 8];
        let bytes = &mut buf[..ty.size()];
        self.reader
            .read_exact(bytes)
            .map_err(|_| parse_error("truncated binary data"))?;
        Ok(ty.decode(bytes, self.big_endian))
    }
}

struct VertexLayout {
    position: [usize; 3],
    normal: Option<[usize; 3]>,
    color: Option<([usize; 3], bool)>,
}

impl VertexLayout {
    fn new(element: &Element) -> Result<Self, GeometryError> {
        let find = |names: &[&str]| {
            element
                .properties
                .iter()
                .position(|p| names.contains(&p.name()) && matches!(p, Property::Scalar { .. }))
        };
        let triple = |a: &[&str], b: &[&str], c: &[&str]| match (find(a), find(b), find(c)) {
            (Some(x), Some(y), Some(z)) => Some([x, y, z]),
            _ => None,
        };

        let position = triple(&["x"], &["y"], &["z"])
            .ok_or_else(|| parse_error("vertex element lacks x, y, z properties"))?;
        let normal = triple(&["nx"], &["ny"], &["nz"]);
        let color = triple(
            &["red", "r", "diffuse_red"],
            &["green", "g", "diffuse_green"],
            &["blue", "b", "diffuse_blue"],
        )
        .map(|idx| {
            let is_float = matches!(
                &element.properties[idx[0]],
                Property::Scalar { ty: Scalar::F32 | Scalar::F64, .. }
            );
            (idx, is_float)
        });

        Ok(Self {
            position,
            normal,
            color,
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(value: f64, is_float: bool) -> u8 {
    let v = if is_float { value * 255.0 } else { value };
    v.round().clamp(0.0, 255.0) as u8
}

fn read_vertices(
    source: &mut dyn RecordSource,
    element: &Element,
) -> Result<PointCloud, GeometryError> {
    let layout = VertexLayout::new(element)?;
    let mut cloud = PointCloud {
        points: Vec::with_capacity(element.count),
        normals: layout.normal.map(|_| Vec::with_capacity(element.count)),
        colors: layout.color.map(|_| Vec::with_capacity(element.count)),
    };

    let mut values = Vec::with_capacity(element.properties.len());
    for _ in 0..element.count {
        source.record(&element.properties, &mut values)?;
        let [x, y, z] = layout.position;
        cloud.points.push(Point3::new(values[x], values[y], values[z]));

        if let (Some([a, b, c]), Some(normals)) = (layout.normal, cloud.normals.as_mut()) {
            normals.push(Vector3::new(values[a], values[b], values[c]));
        }
        if let (Some(([r, g, b], is_float)), Some(colors)) = (layout.color, cloud.colors.as_mut()) {
            colors.push([
                to_u8(values[r], is_float),
                to_u8(values[g], is_float),
                to_u8(values[b], is_float),
            ]);
        }
    }
    Ok(cloud)
}

/// Reads the vertex element of a PLY stream.
pub fn read_ply<R: BufRead>(mut reader: R) -> Result<PointCloud, GeometryError> {
    let header = read_header(&mut reader)?;

    let mut source: Box<dyn RecordSource + '_> = match header.encoding {
        Encoding::Ascii => Box::new(AsciiSource {
            reader,
            line: String::new(),
            tokens: Vec::new(),
            pos: 0,
        }),
        Encoding::BinaryLittleEndian => Box::new(BinarySource {
            reader,
            big_endian: false,
        }),
        Encoding::BinaryBigEndian => Box::new(BinarySource {
            reader,
            big_endian: true,
        }),
    };

    let mut scratch = Vec::new();
    for element in &header.elements {
        if element.name == "vertex" {
            return read_vertices(source.as_mut(), element);
        }
        for _ in 0..element.count {
            source.record(&element.properties, &mut scratch)?;
        }
    }
    Err(parse_error("file has no vertex element"))
}

/// Reads a PLY file.
pub fn read_ply_file(path: &Path) -> Result<PointCloud, GeometryError> {
    let file = File::open(path).map_err(|source| GeometryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_ply(BufReader::new(file))
}

fn write_header<W: Write>(writer: &mut W, format: &str, cloud: &PointCloud) -> std::io::Result<()> {
    writeln!(writer, "ply")?;
    writeln!(writer, "format {format} 1.0")?;
    writeln!(writer, "comment written by reconflow")?;
    writeln!(writer, "element vertex {}", cloud.len())?;
    for axis in ["x", "y", "z"] {
        writeln!(writer, "property float {axis}")?;
    }
    if cloud.normals.is_some() {
        for axis in ["nx", "ny", "nz"] {
            writeln!(writer, "property float {axis}")?;
        }
    }
    if cloud.colors.is_some() {
        for channel in ["red", "green", "blue"] {
            writeln!(writer, "property uchar {channel}")?;
        }
    }
    Ok(())
}

/// Writes a cloud as `binary_little_endian` PLY.
#[allow(clippy::cast_possible_truncation)]
pub fn write_ply<W: Write>(writer: &mut W, cloud: &PointCloud) -> std::io::Result<()> {
    write_header(writer, "binary_little_endian", cloud)?;
    writeln!(writer, "end_header")?;

    for (i, p) in cloud.points.iter().enumerate() {
        for v in [p.x, p.y, p.z] {
            writer.write_all(&(v as f32).to_le_bytes())?;
        }
        if let Some(normals) = &cloud.normals {
            let n = normals[i];
            for v in [n.x, n.y, n.z] {
                writer.write_all(&(v as f32).to_le_bytes())?;
            }
        }
        if let Some(colors) = &cloud.colors {
            writer.write_all(&colors[i])?;
        }
    }
    Ok(())
}

/// Writes a cloud plus line segments between its vertices as ASCII PLY.
pub fn write_ply_ascii_with_edges<W: Write>(
    writer: &mut W,
    cloud: &PointCloud,
    edges: &[[usize; 2]],
) -> std::io::Result<()> {
    write_header(writer, "ascii", cloud)?;
    if !edges.is_empty() {
        writeln!(writer, "element edge {}", edges.len())?;
        writeln!(writer, "property int vertex1")?;
        writeln!(writer, "property int vertex2")?;
    }
    writeln!(writer, "end_header")?;

    for (i, p) in cloud.points.iter().enumerate() {
        write!(writer, "{} {} {}", p.x, p.y, p.z)?;
        if let Some(normals) = &cloud.normals {
            let n = normals[i];
            write!(writer, " {} {} {}", n.x, n.y, n.z)?;
        }
        if let Some(colors) = &cloud.colors {
            let [r, g, b] = colors[i];
            write!(writer, " {r} {g} {b}")?;
        }
        writeln!(writer)?;
    }
    for [a, b] in edges {
        writeln!(writer, "{a} {b}")?;
    }
    Ok(())
}

/// Writes a cloud to a binary PLY file, creating parent directories.
///
/// The file is written under a staging name and renamed into place, so
/// `path` either keeps its previous contents or holds the complete cloud.
pub fn write_ply_file(path: &Path, cloud: &PointCloud) -> Result<(), GeometryError> {
    let io_err = |source| GeometryError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let staging = staging_path(path);
    let written = File::create(&staging).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write_ply(&mut writer, cloud)?;
        writer.into_inner().map_err(std::io::IntoInnerError::into_error)?.sync_all()
    });
    match written.and_then(|()| std::fs::rename(&staging, path)) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Best effort; the staging name never resolves as an artifact.
            let _ = std::fs::remove_file(&staging);
            Err(io_err(e))
        }
    }
}
