//! Normal estimation and consistent orientation.
//!
//! Estimation fits a plane to each point's `k` nearest neighbours and takes
//! the eigenvector of the smallest covariance eigenvalue. Orientation grows
//! a minimum spanning tree over the kNN graph, weighting edges by how far
//! from parallel the two normals are, and flips each child to agree with its
//! parent.

use super::PointCloud;
use crate::errors::GeometryError;
use nalgebra::{Matrix3, Point3, SymmetricEigen, Vector3};
use rayon::prelude::*;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Smallest neighbourhood that defines a plane.
pub const MIN_NEIGHBORS: usize = 3;

struct IndexedPoint(usize, Point3<f64>);

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.1.x, self.1.y, self.1.z])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 3]) -> f64 {
        (self.1.coords - Vector3::from(*point)).norm_squared()
    }
}

fn build_tree(points: &[Point3<f64>]) -> RTree<IndexedPoint> {
    RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(i, p)| IndexedPoint(i, *p))
            .collect(),
    )
}

fn neighbors(tree: &RTree<IndexedPoint>, p: &Point3<f64>, k: usize) -> Vec<usize> {
    tree.nearest_neighbor_iter(&[p.x, p.y, p.z])
        .take(k)
        .map(|n| n.0)
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn plane_normal(points: &[Point3<f64>], neighborhood: &[usize]) -> Vector3<f64> {
    let count = neighborhood.len() as f64;
    let centroid = neighborhood
        .iter()
        .fold(Vector3::zeros(), |acc, &i| acc + points[i].coords)
        / count;

    let mut cov = Matrix3::zeros();
    for &i in neighborhood {
        let d = points[i].coords - centroid;
        cov += d * d.transpose();
    }
    cov /= count;

    let eigen = SymmetricEigen::new(cov);
    let min_idx = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i);

    let normal = eigen.eigenvectors.column(min_idx).into_owned();
    normal.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::z)
}

/// Estimates unit normals from the `k` nearest neighbours of each point.
///
/// If the cloud already carries normals, each new normal is flipped to agree
/// with the one it replaces.
pub fn estimate_normals(cloud: &mut PointCloud, k: usize) -> Result<(), GeometryError> {
    let k = k.max(MIN_NEIGHBORS);
    if cloud.len() < MIN_NEIGHBORS {
        return Err(GeometryError::InsufficientPoints {
            actual: cloud.len(),
            required: MIN_NEIGHBORS,
        });
    }

    let tree = build_tree(&cloud.points);
    let points = &cloud.points;
    let previous = cloud.normals.as_deref();

    let normals: Vec<Vector3<f64>> = points
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let normal = plane_normal(points, &neighbors(&tree, p, k));
            match previous.and_then(|prev| prev.get(i)) {
                Some(old) if old.dot(&normal) < 0.0 => -normal,
                _ => normal,
            }
        })
        .collect();

    cloud.normals = Some(normals);
    Ok(())
}

#[derive(Debug, PartialEq)]
struct Edge {
    cost: f64,
    from: usize,
    to: usize,
}

impl Eq for Edge {}

impl Ord for Edge {
    // Reversed so that `BinaryHeap` pops the cheapest edge.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.to.cmp(&self.to))
    }
}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orients normals consistently across the surface.
///
/// Each connected component of the symmetric kNN graph is traversed along
/// its minimum spanning tree, starting from its lowest-index point, whose
/// normal keeps its sign.
pub fn orient_normals(cloud: &mut PointCloud, k: usize) -> Result<(), GeometryError> {
    let n = cloud.len();
    let Some(mut normals) = cloud.normals.take() else {
        return Err(GeometryError::MissingNormals);
    };
    if n < MIN_NEIGHBORS {
        cloud.normals = Some(normals);
        return Ok(());
    }

    let tree = build_tree(&cloud.points);
    let knn: Vec<Vec<usize>> = cloud
        .points
        .par_iter()
        .map(|p| neighbors(&tree, p, k.max(MIN_NEIGHBORS) + 1))
        .collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, list) in knn.iter().enumerate() {
        for &j in list.iter().filter(|&&j| j != i) {
            adjacency[i].push(j);
            adjacency[j].push(i);
        }
    }
    for list in &mut adjacency {
        list.sort_unstable();
        list.dedup();
    }

    let mut visited = vec![false; n];
    let mut heap = BinaryHeap::new();
    for root in 0..n {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        push_edges(&mut heap, &adjacency, &normals, &visited, root);

        while let Some(Edge { from, to, .. }) = heap.pop() {
            if visited[to] {
                continue;
            }
            visited[to] = true;
            if normals[to].dot(&normals[from]) < 0.0 {
                normals[to] = -normals[to];
            }
            push_edges(&mut heap, &adjacency, &normals, &visited, to);
        }
    }

    cloud.normals = Some(normals);
    Ok(())
}

fn push_edges(
    heap: &mut BinaryHeap<Edge>,
    adjacency: &[Vec<usize>],
    normals: &[Vector3<f64>],
    visited: &[bool],
    from: usize,
) {
    for &to in &adjacency[from] {
        if !visited[to] {
            heap.push(Edge {
                cost: 1.0 - normals[from].dot(&normals[to]).abs(),
                from,
                to,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(z: impl Fn(f64, f64) -> f64) -> PointCloud {
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                let (x, y) = (f64::from(i) * 0.1, f64::from(j) * 0.1);
                points.push(Point3::new(x, y, z(x, y)));
            }
        }
        PointCloud::new(points)
    }

    #[test]
    fn test_plane_normals_are_vertical_unit_vectors() {
        let mut cloud = grid(|_, _| 0.0);
        estimate_normals(&mut cloud, 8).unwrap();

        for n in cloud.normals.as_ref().unwrap() {
            assert!((n.norm() - 1.0).abs() < 1e-9);
            assert!(n.z.abs() > 0.999, "normal {n:?} is not vertical");
        }
    }

    #[test]
    fn test_orientation_makes_normals_agree() {
        let mut cloud = grid(|x, y| 0.1 * x * y);
        estimate_normals(&mut cloud, 8).unwrap();

        // Scramble the signs.
        let normals = cloud.normals.as_mut().unwrap();
        for (i, n) in normals.iter_mut().enumerate() {
            if i % 3 == 0 {
                *n = -*n;
            }
        }

        orient_normals(&mut cloud, 8).unwrap();
        let normals = cloud.normals.as_ref().unwrap();
        let reference = normals[0];
        assert!(normals.iter().all(|n| n.dot(&reference) > 0.0));
    }

    #[test]
    fn test_reestimation_keeps_existing_orientation() {
        let mut cloud = grid(|_, _| 0.0);
        let down = vec![-Vector3::z(); cloud.len()];
        cloud.normals = Some(down);

        estimate_normals(&mut cloud, 8).unwrap();
        assert!(cloud.normals.unwrap().iter().all(|n| n.z < -0.999));
    }

    #[test]
    fn test_too_few_points() {
        let mut cloud = PointCloud::new(vec![Point3::origin(), Point3::new(1.0, 0.0, 0.0)]);
        let err = estimate_normals(&mut cloud, 30).unwrap_err();
        assert!(matches!(
            err,
            GeometryError::InsufficientPoints {
                actual: 2,
                required: 3
            }
        ));
    }

    #[test]
    fn test_orient_requires_normals() {
        let mut cloud = grid(|_, _| 0.0);
        assert!(matches!(orient_normals(&mut cloud, 8), Err(GeometryError::MissingNormals)));
    }
}
