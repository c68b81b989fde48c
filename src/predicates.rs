//! Exact-sign geometric predicates.
//!
//! The two topological predicates, orientation and in-sphere, delegate to the
//! adaptive-precision floating-point expansions of the [robust] crate: a
//! cheap approximate evaluation runs first and the exact expansion path is
//! taken only when the approximate result is within its rounding-error bound
//! of zero.
//!
//! Exact zeros (collinear, coplanar, cospherical inputs) are additionally
//! resolved by a symbolic perturbation keyed on point identity: the `_sos`
//! variants never answer zero and always answer the same way for the same
//! inputs, so topological decisions stay consistent across repeated queries.
//! The raw variants keep their zeros for callers that branch on degeneracy
//! explicitly (flip classification, point location).
//!
//! The epsilon helpers at the bottom are for tolerance decisions only
//! (duplicate snapping, coplanarity merging); they never feed topology.

use robust::{Coord, Coord3D};

fn c3(p: &[f64; 3]) -> Coord3D<f64> {
    Coord3D {
        x: p[0],
        y: p[1],
        z: p[2],
    }
}

fn c2(x: f64, y: f64) -> Coord<f64> {
    Coord { x, y }
}

/// Sign of the signed volume of tetrahedron (a, b, c, d).
///
/// Positive if `d` lies below the plane through `a`, `b`, `c`, where below
/// means the side from which the triple reads clockwise.
pub fn orient3d(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], d: &[f64; 3]) -> f64 {
    robust::orient3d(c3(a), c3(b), c3(c), c3(d))
}

/// Planar orientation of three points given by explicit 2D coordinates.
pub fn orient2d(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    robust::orient2d(c2(a[0], a[1]), c2(b[0], b[1]), c2(c[0], c[1]))
}

/// Sign of `e` against the circumsphere of (a, b, c, d).
///
/// Positive if `e` lies inside; requires (a, b, c, d) positively oriented.
pub fn insphere(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], d: &[f64; 3], e: &[f64; 3]) -> f64 {
    robust::insphere(c3(a), c3(b), c3(c), c3(d), c3(e))
}

const fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Sorts the ids ascending, returning the permutation parity (+1 even, -1
/// odd). The symbolic perturbation is evaluated on the canonical order and
/// the parity restores antisymmetry, so permuted queries always agree.
fn canonical<const N: usize>(ids: [u32; N]) -> ([usize; N], i8) {
    let mut perm = [0usize; N];
    for (i, slot) in perm.iter_mut().enumerate() {
        *slot = i;
    }
    let mut parity = 1i8;
    // insertion sort, counting swaps
    for i in 1..N {
        let mut j = i;
        while j > 0 && ids[perm[j - 1]] > ids[perm[j]] {
            perm.swap(j - 1, j);
            parity = -parity;
            j -= 1;
        }
    }
    (perm, parity)
}

/// Orientation with symbolic tie-break; never returns zero.
pub fn orient3d_sos(pts: [[f64; 3]; 4], ids: [u32; 4]) -> i8 {
    let raw = orient3d(&pts[0], &pts[1], &pts[2], &pts[3]);
    if raw != 0.0 {
        return sign(raw);
    }
    let (perm, parity) = canonical(ids);
    let q: Vec<[f64; 3]> = perm.iter().map(|&i| pts[i]).collect();
    // Perturbation chain: planar orientations of the three least-perturbed
    // points in the coordinate planes, then of the remaining triples, then a
    // fixed positive fallback for fully coincident configurations.
    let triples: [( usize, usize, usize, i8); 4] =
        [(1, 2, 3, 1), (0, 2, 3, -1), (0, 1, 3, 1), (0, 1, 2, -1)];
    for (i, j, k, flip) in triples {
        for (u, v) in [(0usize, 1usize), (1, 2), (2, 0)] {
            let s = sign(orient2d(
                [q[i][u], q[i][v]],
                [q[j][u], q[j][v]],
                [q[k][u], q[k][v]],
            ));
            if s != 0 {
                return parity * flip * s;
            }
        }
    }
    parity
}

/// In-sphere with symbolic tie-break; never returns zero. Requires the first
/// four points positively oriented, like [`insphere`].
pub fn insphere_sos(pts: [[f64; 3]; 5], ids: [u32; 5]) -> i8 {
    let raw = insphere(&pts[0], &pts[1], &pts[2], &pts[3], &pts[4]);
    if raw != 0.0 {
        return sign(raw);
    }
    // Cospherical: perturb the point with the smallest id the most; the
    // leading perturbation term is the orientation of the other four.
    let (perm, parity) = canonical(ids);
    let sub_pts = [pts[perm[1]], pts[perm[2]], pts[perm[3]], pts[perm[4]]];
    let sub_ids = [ids[perm[1]], ids[perm[2]], ids[perm[3]], ids[perm[4]]];
    parity * orient3d_sos(sub_pts, sub_ids)
}

// ----------------------------------------------------------------------
// Tolerance tests (never used for topological branches).
// ----------------------------------------------------------------------

fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// True if `c` deviates from line (a, b) by less than `eps` relative to the
/// spanned lengths.
pub fn is_collinear(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], eps: f64) -> bool {
    let ab = sub(b, a);
    let ac = sub(c, a);
    let n = cross(&ab, &ac);
    let area2 = dot(&n, &n).sqrt();
    let scale = dot(&ab, &ab).sqrt() * dot(&ac, &ac).sqrt();
    scale == 0.0 || area2 <= eps * scale
}

/// True if the four points span a volume below `eps` relative to their
/// longest edge cubed. `vol6` is the precomputed signed volume times six.
pub fn is_coplanar(a: &[f64; 3], b: &[f64; 3], c: &[f64; 3], d: &[f64; 3], vol6: f64, eps: f64) -> bool {
    let mut longest: f64 = 0.0;
    for (p, q) in [(a, b), (a, c), (a, d), (b, c), (b, d), (c, d)] {
        let e = sub(q, p);
        longest = longest.max(dot(&e, &e));
    }
    let scale = longest.sqrt().powi(3);
    scale == 0.0 || vol6.abs() <= eps * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_signs() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        let c = [0.0, 1.0, 0.0];
        let below = [0.0, 0.0, -1.0];
        let above = [0.0, 0.0, 1.0];

        assert!(orient3d(&a, &b, &c, &below) > 0.0);
        assert!(orient3d(&a, &b, &c, &above) < 0.0);
        assert_eq!(orient3d(&a, &b, &c, &[0.5, 0.5, 0.0]), 0.0);
    }

    #[test]
    fn sos_is_deterministic_and_antisymmetric() {
        // Four exactly coplanar points.
        let pts = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
        ];
        let ids = [0, 1, 2, 3];
        let s = orient3d_sos(pts, ids);
        assert_ne!(s, 0);
        assert_eq!(s, orient3d_sos(pts, ids));

        // Swapping two arguments flips the answer.
        let swapped_pts = [pts[1], pts[0], pts[2], pts[3]];
        let swapped_ids = [ids[1], ids[0], ids[2], ids[3]];
        assert_eq!(orient3d_sos(swapped_pts, swapped_ids), -s);
    }

    #[test]
    fn cospherical_tie_break_is_consistent() {
        // Five points of a cube lie on one sphere.
        let pts = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 1.0, 0.0],
        ];
        let ids = [10, 11, 12, 13, 14];
        let s = insphere_sos(pts, ids);
        assert_ne!(s, 0);
        assert_eq!(s, insphere_sos(pts, ids));
    }

    #[test]
    fn tolerance_tests() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0];
        assert!(is_collinear(&a, &b, &[2.0, 1e-12, 0.0], 1e-8));
        assert!(!is_collinear(&a, &b, &[0.5, 0.5, 0.0], 1e-8));

        let c = [0.0, 1.0, 0.0];
        let d = [0.3, 0.3, 1e-13];
        let vol6 = orient3d(&a, &b, &c, &d);
        assert!(is_coplanar(&a, &b, &c, &d, vol6, 1e-8));
    }
}
