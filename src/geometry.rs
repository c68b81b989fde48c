//! Inexact geometric quantities: distances, normals, circumspheres, dihedral
//! angles. These feed quality measures and split-point placement; all
//! topological decisions go through [`crate::predicates`] instead.

use nalgebra::{Matrix3, Vector3};

pub fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

pub fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    norm(&sub(b, a))
}

pub fn distance2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let d = sub(b, a);
    dot(&d, &d)
}

pub fn midpoint(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        0.5 * (a[0] + b[0]),
        0.5 * (a[1] + b[1]),
        0.5 * (a[2] + b[2]),
    ]
}

/// Unnormalized face normal of triangle (a, b, c) and its length
/// (twice the triangle area).
pub fn face_normal(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3]) -> ([f64; 3], f64) {
    let n = cross(&sub(b, a), &sub(c, a));
    let len = norm(&n);
    (n, len)
}

pub fn tri_area(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3]) -> f64 {
    face_normal(a, b, c).1 * 0.5
}

/// Signed volume of tetrahedron (a, b, c, d), positive when `d` lies below
/// the oriented plane of (a, b, c).
pub fn tet_volume(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], d: &[f64; 3]) -> f64 {
    let ad = sub(a, d);
    let bd = sub(b, d);
    let cd = sub(c, d);
    dot(&ad, &cross(&bd, &cd)) / 6.0
}

/// Distance from `p` to the segment (e1, e2).
pub fn short_distance(p: &[f64; 3], e1: &[f64; 3], e2: &[f64; 3]) -> f64 {
    let e = sub(e2, e1);
    let len2 = dot(&e, &e);
    if len2 == 0.0 {
        return distance(p, e1);
    }
    let t = (dot(&sub(p, e1), &e) / len2).clamp(0.0, 1.0);
    let proj = [e1[0] + t * e[0], e1[1] + t * e[1], e1[2] + t * e[2]];
    distance(p, &proj)
}

/// Orthogonal projection of `p` onto the line through (e1, e2).
pub fn proj_point(p: &[f64; 3], e1: &[f64; 3], e2: &[f64; 3]) -> [f64; 3] {
    let e = sub(e2, e1);
    let len2 = dot(&e, &e);
    if len2 == 0.0 {
        return *e1;
    }
    let t = dot(&sub(p, e1), &e) / len2;
    [e1[0] + t * e[0], e1[1] + t * e[1], e1[2] + t * e[2]]
}

/// Interior angle at `o` spanned by rays to `p1` and `p2`, in radians.
pub fn interior_angle(o: &[f64; 3], p1: &[f64; 3], p2: &[f64; 3]) -> f64 {
    let u = sub(p1, o);
    let v = sub(p2, o);
    let lu = norm(&u);
    let lv = norm(&v);
    if lu == 0.0 || lv == 0.0 {
        return 0.0;
    }
    (dot(&u, &v) / (lu * lv)).clamp(-1.0, 1.0).acos()
}

/// Dihedral angle at edge (pa, pb) between the half-planes through `pc1` and
/// `pc2`, in radians.
pub fn face_dihedral(pa: &[f64; 3], pb: &[f64; 3], pc1: &[f64; 3], pc2: &[f64; 3]) -> f64 {
    let (n1, l1) = face_normal(pa, pb, pc1);
    let (n2, l2) = face_normal(pb, pa, pc2);
    if l1 == 0.0 || l2 == 0.0 {
        return 0.0;
    }
    (dot(&n1, &n2) / (l1 * l2)).clamp(-1.0, 1.0).acos()
}

/// The six dihedral angles of tetrahedron (a, b, c, d), in radians, in edge
/// order (ab, bc, ca, ad, bd, cd).
pub fn tet_dihedrals(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], d: &[f64; 3]) -> [f64; 6] {
    [
        face_dihedral(a, b, c, d),
        face_dihedral(b, c, a, d),
        face_dihedral(c, a, b, d),
        face_dihedral(a, d, b, c),
        face_dihedral(b, d, c, a),
        face_dihedral(c, d, a, b),
    ]
}

/// Circumcenter and circumradius of the tetrahedron, `None` when the four
/// points are (nearly) coplanar and the linear system degenerates.
pub fn circumsphere(
    a: &[f64; 3],
    b: &[f64; 3],
    c: &[f64; 3],
    d: &[f64; 3],
) -> Option<([f64; 3], f64)> {
    let rows = [sub(b, a), sub(c, a), sub(d, a)];
    let m = Matrix3::new(
        rows[0][0], rows[0][1], rows[0][2],
        rows[1][0], rows[1][1], rows[1][2],
        rows[2][0], rows[2][1], rows[2][2],
    );
    let rhs = Vector3::new(
        0.5 * dot(&rows[0], &rows[0]),
        0.5 * dot(&rows[1], &rows[1]),
        0.5 * dot(&rows[2], &rows[2]),
    );
    let x = m.lu().solve(&rhs)?;
    let center = [a[0] + x[0], a[1] + x[1], a[2] + x[2]];
    let radius = norm(&[x[0], x[1], x[2]]);
    if radius.is_finite() {
        Some((center, radius))
    } else {
        None
    }
}

/// Circumcenter and circumradius of triangle (a, b, c) within its own plane.
pub fn tri_circumsphere(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3]) -> Option<([f64; 3], f64)> {
    let ab = sub(b, a);
    let ac = sub(c, a);
    let (n, nlen) = face_normal(a, b, c);
    if nlen == 0.0 {
        return None;
    }
    let m = Matrix3::new(
        ab[0], ab[1], ab[2],
        ac[0], ac[1], ac[2],
        n[0], n[1], n[2],
    );
    let rhs = Vector3::new(0.5 * dot(&ab, &ab), 0.5 * dot(&ac, &ac), 0.0);
    let x = m.lu().solve(&rhs)?;
    let center = [a[0] + x[0], a[1] + x[1], a[2] + x[2]];
    let radius = norm(&[x[0], x[1], x[2]]);
    if radius.is_finite() {
        Some((center, radius))
    } else {
        None
    }
}

/// Circumradius divided by shortest edge, the refinement quality measure.
/// Degenerate tetrahedra report infinity.
pub fn radius_edge_ratio(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], d: &[f64; 3]) -> f64 {
    let Some((_, radius)) = circumsphere(a, b, c, d) else {
        return f64::INFINITY;
    };
    let mut shortest = f64::INFINITY;
    for (p, q) in [(a, b), (a, c), (a, d), (b, c), (b, d), (c, d)] {
        shortest = shortest.min(distance(p, q));
    }
    if shortest == 0.0 {
        f64::INFINITY
    } else {
        radius / shortest
    }
}

/// True if `p` lies inside the diametral sphere of segment (a, b): the angle
/// a-p-b is obtuse.
pub fn encroaches_segment(a: &[f64; 3], b: &[f64; 3], p: &[f64; 3]) -> bool {
    dot(&sub(a, p), &sub(b, p)) < 0.0
}

/// True if `p` lies inside the equatorial sphere of triangle (a, b, c): the
/// sphere centered at the triangle's circumcenter through its vertices.
pub fn encroaches_face(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], p: &[f64; 3]) -> bool {
    match tri_circumsphere(a, b, c) {
        Some((center, radius)) => distance(&center, p) < radius,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circumsphere_of_regular_corner() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        let c = [0.0, 1.0, 0.0];
        let d = [0.0, 0.0, 1.0];
        let (center, radius) = circumsphere(&a, &b, &c, &d).unwrap();
        for p in [a, b, c, d] {
            assert!((distance(&center, &p) - radius).abs() < 1e-12);
        }
    }

    #[test]
    fn triangle_circumcenter_is_equidistant() {
        let a = [0.0, 0.0, 1.0];
        let b = [2.0, 0.0, 1.0];
        let c = [1.0, 3.0, 1.0];
        let (center, radius) = tri_circumsphere(&a, &b, &c).unwrap();
        for p in [a, b, c] {
            assert!((distance(&center, &p) - radius).abs() < 1e-12);
        }
        // center stays in the triangle plane
        assert!((center[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ratio_of_regular_tet_is_sqrt_six_over_four() {
        let a = [1.0, 1.0, 1.0];
        let b = [1.0, -1.0, -1.0];
        let c = [-1.0, 1.0, -1.0];
        let d = [-1.0, -1.0, 1.0];
        let ratio = radius_edge_ratio(&a, &b, &c, &d);
        assert!((ratio - (6.0f64.sqrt() / 4.0)).abs() < 1e-12);
    }

    #[test]
    fn segment_encroachment_is_the_diametral_sphere() {
        let a = [0.0, 0.0, 0.0];
        let b = [2.0, 0.0, 0.0];
        assert!(encroaches_segment(&a, &b, &[1.0, 0.5, 0.0]));
        assert!(!encroaches_segment(&a, &b, &[1.0, 1.5, 0.0]));
    }

    #[test]
    fn dihedrals_of_regular_tet() {
        let a = [1.0, 1.0, 1.0];
        let b = [1.0, -1.0, -1.0];
        let c = [-1.0, 1.0, -1.0];
        let d = [-1.0, -1.0, 1.0];
        let expected = (1.0f64 / 3.0).acos();
        for angle in tet_dihedrals(&a, &b, &c, &d) {
            assert!((angle - expected).abs() < 1e-12);
        }
    }
}
