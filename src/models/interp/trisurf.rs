//! Triangulated surface: Delaunay triangulation of the samples in unit-scaled
//! (strike, maturity) space with linear interpolation inside each triangle.
//!
//! Queries outside the convex hull take the value of the nearest sample. A cloud
//! without area (one maturity, one strike or otherwise collinear) cannot be
//! triangulated and falls back to piecewise-linear interpolation along its
//! longer axis.

use tracing::debug;

use crate::calibration::types::{dedup_points, ImpliedVolPoint};
use crate::error::{Result, SurfaceError};
use crate::models::interp::spline::linear_interp;
use crate::models::interp::{SurfaceInterpolator, UnitScaler};

const BARYCENTRIC_EPS: f64 = 1e-10;

#[derive(Debug, Clone)]
enum Layout {
    Triangulated { triangles: Vec<[usize; 3]> },
    /// Sorted 1-D fallback: (axis coordinate, value)
    Line { axis: usize, xs: Vec<f64>, ys: Vec<f64> },
}

#[derive(Debug, Clone)]
pub struct TriSurface {
    scaler: UnitScaler,
    nodes: Vec<[f64; 2]>,
    values: Vec<f64>,
    layout: Layout,
}

impl TriSurface {
    pub fn new(points: &[ImpliedVolPoint]) -> Result<Self> {
        let points = dedup_points(points);
        if points.is_empty() {
            return Err(SurfaceError::insufficient(1, 0, "triangulated surface"));
        }
        let scaler = UnitScaler::fit(&points);
        let nodes: Vec<[f64; 2]> = points
            .iter()
            .map(|p| scaler.scale(p.strike, p.maturity))
            .collect();
        let values: Vec<f64> = points.iter().map(|p| p.implied_vol).collect();

        let triangles = if nodes.len() >= 3 && scaler.active_dims() == 2 {
            bowyer_watson(&nodes)
        } else {
            Vec::new()
        };

        let layout = if triangles.is_empty() {
            debug!(points = nodes.len(), "degenerate cloud, using linear fallback");
            line_layout(&nodes, &values)
        } else {
            debug!(points = nodes.len(), triangles = triangles.len(), "triangulated");
            Layout::Triangulated { triangles }
        };

        Ok(Self {
            scaler,
            nodes,
            values,
            layout,
        })
    }

    pub fn triangle_count(&self) -> usize {
        match &self.layout {
            Layout::Triangulated { triangles } => triangles.len(),
            Layout::Line { .. } => 0,
        }
    }

    fn nearest(&self, q: [f64; 2]) -> f64 {
        self.nodes
            .iter()
            .zip(&self.values)
            .min_by(|(a, _), (b, _)| dist2(a, &q).total_cmp(&dist2(b, &q)))
            .map_or(f64::NAN, |(_, v)| *v)
    }
}

fn line_layout(nodes: &[[f64; 2]], values: &[f64]) -> Layout {
    let spread = |axis: usize| {
        let (lo, hi) = nodes
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), n| {
                (lo.min(n[axis]), hi.max(n[axis]))
            });
        hi - lo
    };
    let axis = if spread(0) >= spread(1) { 0 } else { 1 };
    let mut pairs: Vec<(f64, f64)> = nodes
        .iter()
        .map(|n| n[axis])
        .zip(values.iter().copied())
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    // collinear points may still share a coordinate on the chosen axis
    pairs.dedup_by(|a, b| {
        if (a.0 - b.0).abs() < 1e-12 {
            b.1 = 0.5 * (a.1 + b.1);
            true
        } else {
            false
        }
    });
    let (xs, ys) = pairs.into_iter().unzip();
    Layout::Line { axis, xs, ys }
}

fn dist2(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

/// Circumcircle centre and squared radius; `None` for degenerate triangles.
fn circumcircle(a: &[f64; 2], b: &[f64; 2], c: &[f64; 2]) -> Option<([f64; 2], f64)> {
    let d = 2.0 * (a[0] * (b[1] - c[1]) + b[0] * (c[1] - a[1]) + c[0] * (a[1] - b[1]));
    if d.abs() < 1e-14 {
        return None;
    }
    let a2 = a[0] * a[0] + a[1] * a[1];
    let b2 = b[0] * b[0] + b[1] * b[1];
    let c2 = c[0] * c[0] + c[1] * c[1];
    let ux = (a2 * (b[1] - c[1]) + b2 * (c[1] - a[1]) + c2 * (a[1] - b[1])) / d;
    let uy = (a2 * (c[0] - b[0]) + b2 * (a[0] - c[0]) + c2 * (b[0] - a[0])) / d;
    let centre = [ux, uy];
    Some((centre, dist2(&centre, a)))
}

/// Incremental Bowyer-Watson triangulation. Returned triangles index `nodes`.
fn bowyer_watson(nodes: &[[f64; 2]]) -> Vec<[usize; 3]> {
    let n = nodes.len();
    // super triangle comfortably enclosing the unit square
    let mut verts: Vec<[f64; 2]> = nodes.to_vec();
    verts.push([-19.5, -9.5]);
    verts.push([20.5, -9.5]);
    verts.push([0.5, 20.5]);

    let mut triangles: Vec<[usize; 3]> = vec![[n, n + 1, n + 2]];

    for (i, p) in nodes.iter().enumerate() {
        let mut bad = Vec::new();
        let mut keep = Vec::with_capacity(triangles.len());
        for tri in triangles.drain(..) {
            let inside = match circumcircle(&verts[tri[0]], &verts[tri[1]], &verts[tri[2]]) {
                Some((centre, r2)) => dist2(&centre, p) < r2 * (1.0 - 1e-12),
                None => false,
            };
            if inside {
                bad.push(tri);
            } else {
                keep.push(tri);
            }
        }

        // boundary of the cavity: edges belonging to exactly one bad triangle
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for tri in &bad {
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                let key = (a.min(b), a.max(b));
                if let Some(pos) = edges.iter().position(|e| *e == key) {
                    edges.swap_remove(pos);
                } else {
                    edges.push(key);
                }
            }
        }

        keep.extend(
            edges
                .into_iter()
                .filter(|(a, b)| circumcircle(&verts[*a], &verts[*b], p).is_some())
                .map(|(a, b)| [a, b, i]),
        );
        triangles = keep;
    }

    triangles.retain(|t| t.iter().all(|&v| v < n));
    triangles
}

fn barycentric(p: &[f64; 2], a: &[f64; 2], b: &[f64; 2], c: &[f64; 2]) -> Option<[f64; 3]> {
    let det = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
    if det.abs() < 1e-14 {
        return None;
    }
    let l1 = ((b[1] - c[1]) * (p[0] - c[0]) + (c[0] - b[0]) * (p[1] - c[1])) / det;
    let l2 = ((c[1] - a[1]) * (p[0] - c[0]) + (a[0] - c[0]) * (p[1] - c[1])) / det;
    Some([l1, l2, 1.0 - l1 - l2])
}

impl SurfaceInterpolator for TriSurface {
    fn name(&self) -> &'static str {
        "trisurf"
    }

    fn implied_vol(&self, strike: f64, maturity: f64) -> f64 {
        let q = self.scaler.scale(strike, maturity);
        match &self.layout {
            Layout::Line { axis, xs, ys } => linear_interp(xs, ys, q[*axis]),
            Layout::Triangulated { triangles } => {
                for tri in triangles {
                    let [a, b, c] = *tri;
                    if let Some(l) =
                        barycentric(&q, &self.nodes[a], &self.nodes[b], &self.nodes[c])
                    {
                        if l.iter().all(|&x| x >= -BARYCENTRIC_EPS) {
                            return l[0] * self.values[a]
                                + l[1] * self.values[b]
                                + l[2] * self.values[c];
                        }
                    }
                }
                self.nearest(q)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::types::OptionType;
    use approx::assert_relative_eq;

    fn pt(k: f64, t: f64, v: f64) -> ImpliedVolPoint {
        ImpliedVolPoint::new(k, t, 100.0, v, OptionType::Call)
    }

    #[test]
    fn reproduces_samples_and_interpolates_planes() {
        // vol is affine in (strike, maturity), so linear interpolation is exact
        let f = |k: f64, t: f64| 0.1 + 0.001 * k + 0.05 * t;
        let mut pts = Vec::new();
        for &t in &[0.1, 0.3, 0.7, 1.0] {
            for &k in &[80.0, 95.0, 100.0, 105.0, 120.0] {
                pts.push(pt(k, t, f(k, t)));
            }
        }
        let s = TriSurface::new(&pts).unwrap();
        assert!(s.triangle_count() > 0);
        for p in &pts {
            assert_relative_eq!(
                s.implied_vol(p.strike, p.maturity),
                p.implied_vol,
                epsilon = 1e-9
            );
        }
        assert_relative_eq!(s.implied_vol(97.0, 0.5), f(97.0, 0.5), epsilon = 1e-9);
    }

    #[test]
    fn outside_hull_uses_nearest_sample() {
        let pts = vec![
            pt(90.0, 0.25, 0.30),
            pt(110.0, 0.25, 0.20),
            pt(100.0, 1.0, 0.25),
        ];
        let s = TriSurface::new(&pts).unwrap();
        assert_eq!(s.triangle_count(), 1);
        // far corner outside the triangle, nearest to (110, 0.25)
        assert_relative_eq!(s.implied_vol(112.0, 0.2), 0.20);
    }

    #[test]
    fn single_maturity_falls_back_to_linear() {
        let pts = vec![pt(90.0, 0.5, 0.3), pt(100.0, 0.5, 0.2), pt(110.0, 0.5, 0.25)];
        let s = TriSurface::new(&pts).unwrap();
        assert_eq!(s.triangle_count(), 0);
        assert_relative_eq!(s.implied_vol(95.0, 0.5), 0.25, epsilon = 1e-12);
        assert_relative_eq!(s.implied_vol(130.0, 0.5), 0.25, epsilon = 1e-12);
    }
}
