use crate::datatypes::{Circle, Line, PointId, slot_x, slot_y};

/// Each geometric constraint we support.
///
/// Constraints carry their geometry by value (shapes are just bundles of
/// point ids), form a closed set, and are stored contiguously in the
/// sketch's constraint list.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constraint {
    /// This point is pinned to the given coordinates.
    FixedPoint(PointId, f64, f64),
    /// These two points share both coordinates.
    Coincident(PointId, PointId),
    /// The line's endpoints have the same Y value.
    Horizontal(Line),
    /// The line's endpoints have the same X value.
    Vertical(Line),
    /// The two lines' directions have zero cross product.
    Parallel(Line, Line),
    /// The two lines' directions have zero dot product.
    Perpendicular(Line, Line),
    /// These two points are a given distance apart.
    Distance(PointId, PointId, f64),
    /// The circle's diameter is fixed.
    Diameter(Circle, f64),
    /// The line's direction passes through the circle's center.
    Normal(Circle, Line),
    /// This point lies on the circle's perimeter.
    CircleCoincident(Circle, PointId),
}

impl Constraint {
    /// How many residual rows this constraint contributes. Fixed per kind.
    pub fn residual_dim(&self) -> usize {
        match self {
            Constraint::FixedPoint(..) => 2,
            Constraint::Coincident(..) => 2,
            Constraint::Horizontal(..) => 1,
            Constraint::Vertical(..) => 1,
            Constraint::Parallel(..) => 1,
            Constraint::Perpendicular(..) => 1,
            Constraint::Distance(..) => 1,
            Constraint::Diameter(..) => 1,
            Constraint::Normal(..) => 1,
            Constraint::CircleCoincident(..) => 1,
        }
    }

    /// Human-readable constraint name, useful for conflict reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Constraint::FixedPoint(..) => "FixedPoint",
            Constraint::Coincident(..) => "Coincident",
            Constraint::Horizontal(..) => "Horizontal",
            Constraint::Vertical(..) => "Vertical",
            Constraint::Parallel(..) => "Parallel",
            Constraint::Perpendicular(..) => "Perpendicular",
            Constraint::Distance(..) => "Distance",
            Constraint::Diameter(..) => "Diameter",
            Constraint::Normal(..) => "Normal",
            Constraint::CircleCoincident(..) => "CircleCoincident",
        }
    }

    /// Every (local row, column) this constraint may write in the Jacobian,
    /// in a canonical per-kind order. [`jacobian_into`](Self::jacobian_into)
    /// emits partial derivatives in exactly this order; the compiler relies
    /// on the match to precompute one value-array slot per entry.
    pub(crate) fn jacobian_layout(&self, out: &mut Vec<(usize, usize)>) {
        match self {
            Constraint::FixedPoint(p, _, _) => {
                out.extend([(0, slot_x(*p)), (1, slot_y(*p))]);
            }
            Constraint::Coincident(p, q) => {
                out.extend([
                    (0, slot_x(*p)),
                    (0, slot_x(*q)),
                    (1, slot_y(*p)),
                    (1, slot_y(*q)),
                ]);
            }
            Constraint::Horizontal(l) => {
                out.extend([(0, slot_y(l.p1)), (0, slot_y(l.p2))]);
            }
            Constraint::Vertical(l) => {
                out.extend([(0, slot_x(l.p1)), (0, slot_x(l.p2))]);
            }
            Constraint::Parallel(a, b) | Constraint::Perpendicular(a, b) => {
                out.extend([
                    (0, slot_x(a.p1)),
                    (0, slot_y(a.p1)),
                    (0, slot_x(a.p2)),
                    (0, slot_y(a.p2)),
                    (0, slot_x(b.p1)),
                    (0, slot_y(b.p1)),
                    (0, slot_x(b.p2)),
                    (0, slot_y(b.p2)),
                ]);
            }
            Constraint::Distance(p, q, _) => {
                out.extend([
                    (0, slot_x(*p)),
                    (0, slot_y(*p)),
                    (0, slot_x(*q)),
                    (0, slot_y(*q)),
                ]);
            }
            Constraint::Diameter(c, _) => {
                out.extend([
                    (0, slot_x(c.center)),
                    (0, slot_y(c.center)),
                    (0, slot_x(c.rim)),
                    (0, slot_y(c.rim)),
                ]);
            }
            Constraint::Normal(c, l) => {
                out.extend([
                    (0, slot_x(l.p1)),
                    (0, slot_y(l.p1)),
                    (0, slot_x(l.p2)),
                    (0, slot_y(l.p2)),
                    (0, slot_x(c.center)),
                    (0, slot_y(c.center)),
                ]);
            }
            Constraint::CircleCoincident(c, p) => {
                out.extend([
                    (0, slot_x(c.center)),
                    (0, slot_y(c.center)),
                    (0, slot_x(c.rim)),
                    (0, slot_y(c.rim)),
                    (0, slot_x(*p)),
                    (0, slot_y(*p)),
                ]);
            }
        }
    }

    /// How close this constraint is to being satisfied: writes
    /// [`residual_dim`](Self::residual_dim) values into `out`.
    pub(crate) fn residual_into(&self, x: &[f64], out: &mut [f64]) {
        match self {
            Constraint::FixedPoint(p, x0, y0) => {
                out[0] = x[slot_x(*p)] - x0;
                out[1] = x[slot_y(*p)] - y0;
            }
            Constraint::Coincident(p, q) => {
                out[0] = x[slot_x(*p)] - x[slot_x(*q)];
                out[1] = x[slot_y(*p)] - x[slot_y(*q)];
            }
            Constraint::Horizontal(l) => {
                out[0] = x[slot_y(l.p1)] - x[slot_y(l.p2)];
            }
            Constraint::Vertical(l) => {
                out[0] = x[slot_x(l.p1)] - x[slot_x(l.p2)];
            }
            Constraint::Parallel(a, b) => {
                let (dx1, dy1) = direction(a, x);
                let (dx2, dy2) = direction(b, x);
                out[0] = dx1 * dy2 - dy1 * dx2;
            }
            Constraint::Perpendicular(a, b) => {
                let (dx1, dy1) = direction(a, x);
                let (dx2, dy2) = direction(b, x);
                out[0] = dx1 * dx2 + dy1 * dy2;
            }
            Constraint::Distance(p, q, d) => {
                let dx = x[slot_x(*p)] - x[slot_x(*q)];
                let dy = x[slot_y(*p)] - x[slot_y(*q)];
                out[0] = dx * dx + dy * dy - d * d;
            }
            Constraint::Diameter(c, d) => {
                let dx = x[slot_x(c.rim)] - x[slot_x(c.center)];
                let dy = x[slot_y(c.rim)] - x[slot_y(c.center)];
                let radius = d / 2.0;
                out[0] = dx * dx + dy * dy - radius * radius;
            }
            Constraint::Normal(c, l) => {
                let (dx, dy) = direction(l, x);
                let cx = x[slot_x(c.center)];
                let cy = x[slot_y(c.center)];
                out[0] = dx * (cy - x[slot_y(l.p1)]) - dy * (cx - x[slot_x(l.p1)]);
            }
            Constraint::CircleCoincident(c, p) => {
                let dpx = x[slot_x(*p)] - x[slot_x(c.center)];
                let dpy = x[slot_y(*p)] - x[slot_y(c.center)];
                let drx = x[slot_x(c.rim)] - x[slot_x(c.center)];
                let dry = x[slot_y(c.rim)] - x[slot_y(c.center)];
                out[0] = dpx * dpx + dpy * dpy - drx * drx - dry * dry;
            }
        }
    }

    /// Accumulate this constraint's partial derivatives into the Jacobian
    /// value array. `slots[k]` is the value-array position of the k-th
    /// [`jacobian_layout`](Self::jacobian_layout) entry. Accumulation
    /// (rather than assignment) makes shared points sum correctly: when both
    /// lines of a `Parallel` use one endpoint, two layout entries land in
    /// the same merged structural nonzero.
    pub(crate) fn jacobian_into(&self, x: &[f64], slots: &[usize], nzval: &mut [f64]) {
        match self {
            Constraint::FixedPoint(..) => {
                scatter(slots, &[1.0, 1.0], nzval);
            }
            Constraint::Coincident(..) => {
                scatter(slots, &[1.0, -1.0, 1.0, -1.0], nzval);
            }
            Constraint::Horizontal(..) | Constraint::Vertical(..) => {
                scatter(slots, &[1.0, -1.0], nzval);
            }
            Constraint::Parallel(a, b) => {
                let (dx1, dy1) = direction(a, x);
                let (dx2, dy2) = direction(b, x);
                scatter(
                    slots,
                    &[-dy2, dx2, dy2, -dx2, dy1, -dx1, -dy1, dx1],
                    nzval,
                );
            }
            Constraint::Perpendicular(a, b) => {
                let (dx1, dy1) = direction(a, x);
                let (dx2, dy2) = direction(b, x);
                scatter(
                    slots,
                    &[-dx2, -dy2, dx2, dy2, -dx1, -dy1, dx1, dy1],
                    nzval,
                );
            }
            Constraint::Distance(p, q, _) => {
                let dx = x[slot_x(*p)] - x[slot_x(*q)];
                let dy = x[slot_y(*p)] - x[slot_y(*q)];
                scatter(
                    slots,
                    &[2.0 * dx, 2.0 * dy, -2.0 * dx, -2.0 * dy],
                    nzval,
                );
            }
            Constraint::Diameter(c, _) => {
                let dx = x[slot_x(c.rim)] - x[slot_x(c.center)];
                let dy = x[slot_y(c.rim)] - x[slot_y(c.center)];
                scatter(
                    slots,
                    &[-2.0 * dx, -2.0 * dy, 2.0 * dx, 2.0 * dy],
                    nzval,
                );
            }
            Constraint::Normal(c, l) => {
                let x1 = x[slot_x(l.p1)];
                let y1 = x[slot_y(l.p1)];
                let x2 = x[slot_x(l.p2)];
                let y2 = x[slot_y(l.p2)];
                let cx = x[slot_x(c.center)];
                let cy = x[slot_y(c.center)];
                scatter(
                    slots,
                    &[y2 - cy, cx - x2, cy - y1, x1 - cx, y1 - y2, x2 - x1],
                    nzval,
                );
            }
            Constraint::CircleCoincident(c, p) => {
                let dpx = x[slot_x(*p)] - x[slot_x(c.center)];
                let dpy = x[slot_y(*p)] - x[slot_y(c.center)];
                let drx = x[slot_x(c.rim)] - x[slot_x(c.center)];
                let dry = x[slot_y(c.rim)] - x[slot_y(c.center)];
                scatter(
                    slots,
                    &[
                        2.0 * (drx - dpx),
                        2.0 * (dry - dpy),
                        -2.0 * drx,
                        -2.0 * dry,
                        2.0 * dpx,
                        2.0 * dpy,
                    ],
                    nzval,
                );
            }
        }
    }
}

/// Direction vector of a line, `p2 - p1`.
fn direction(l: &Line, x: &[f64]) -> (f64, f64) {
    (
        x[slot_x(l.p2)] - x[slot_x(l.p1)],
        x[slot_y(l.p2)] - x[slot_y(l.p1)],
    )
}

fn scatter(slots: &[usize], values: &[f64], nzval: &mut [f64]) {
    debug_assert_eq!(slots.len(), values.len());
    for (&slot, &value) in slots.iter().zip(values) {
        nzval[slot] += value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Five points with nothing-special coordinates.
    const X: [f64; 10] = [0.3, -1.2, 2.0, 1.5, -0.7, 0.4, 1.1, -2.3, 0.9, 2.2];

    /// Dense Jacobian from the analytic partials, accumulated through the
    /// layout the same way the compiler scatters them.
    fn dense_analytic(c: &Constraint, x: &[f64]) -> Vec<Vec<f64>> {
        let mut layout = Vec::new();
        c.jacobian_layout(&mut layout);
        let slots: Vec<usize> = (0..layout.len()).collect();
        let mut vals = vec![0.0; layout.len()];
        c.jacobian_into(x, &slots, &mut vals);

        let mut dense = vec![vec![0.0; x.len()]; c.residual_dim()];
        for (k, &(row, col)) in layout.iter().enumerate() {
            dense[row][col] += vals[k];
        }
        dense
    }

    /// Dense Jacobian by central differences of the residual.
    fn dense_numeric(c: &Constraint, x: &[f64]) -> Vec<Vec<f64>> {
        let m = c.residual_dim();
        let h = 1e-5;
        let mut dense = vec![vec![0.0; x.len()]; m];
        let mut probe = x.to_vec();
        let mut plus = vec![0.0; m];
        let mut minus = vec![0.0; m];
        for col in 0..x.len() {
            probe[col] = x[col] + h;
            c.residual_into(&probe, &mut plus);
            probe[col] = x[col] - h;
            c.residual_into(&probe, &mut minus);
            probe[col] = x[col];
            for row in 0..m {
                dense[row][col] = (plus[row] - minus[row]) / (2.0 * h);
            }
        }
        dense
    }

    #[track_caller]
    fn assert_jacobian_matches(c: Constraint) {
        let analytic = dense_analytic(&c, &X);
        let numeric = dense_numeric(&c, &X);
        for (row, (a, n)) in analytic.iter().zip(&numeric).enumerate() {
            for (col, (av, nv)) in a.iter().zip(n).enumerate() {
                assert!(
                    (av - nv).abs() < 1e-6,
                    "{} row {row} col {col}: analytic {av}, numeric {nv}",
                    c.kind(),
                );
            }
        }
    }

    #[test]
    fn analytic_partials_match_finite_differences() {
        let cases = [
            Constraint::FixedPoint(1, 0.5, -0.25),
            Constraint::Coincident(1, 2),
            Constraint::Horizontal(Line::new(1, 2)),
            Constraint::Vertical(Line::new(1, 2)),
            Constraint::Parallel(Line::new(1, 2), Line::new(3, 4)),
            Constraint::Perpendicular(Line::new(1, 2), Line::new(3, 4)),
            Constraint::Distance(1, 2, 2.5),
            Constraint::Diameter(Circle::new(1, 2), 3.0),
            Constraint::Normal(Circle::new(1, 5), Line::new(2, 3)),
            Constraint::CircleCoincident(Circle::new(1, 2), 3),
        ];
        for case in cases {
            assert_jacobian_matches(case);
        }
    }

    #[test]
    fn shared_points_accumulate() {
        // Both lines use point 2; the merged columns must hold the sum of
        // both contributions.
        assert_jacobian_matches(Constraint::Parallel(Line::new(1, 2), Line::new(2, 3)));
        assert_jacobian_matches(Constraint::Perpendicular(Line::new(1, 2), Line::new(2, 3)));
        // The rim point is also the constrained point.
        assert_jacobian_matches(Constraint::CircleCoincident(Circle::new(1, 2), 2));
    }

    #[test]
    fn layout_rows_stay_within_residual_dim() {
        let cases = [
            Constraint::FixedPoint(1, 0.0, 0.0),
            Constraint::Coincident(1, 2),
            Constraint::Parallel(Line::new(1, 2), Line::new(3, 4)),
            Constraint::Normal(Circle::new(1, 5), Line::new(2, 3)),
        ];
        for case in cases {
            let mut layout = Vec::new();
            case.jacobian_layout(&mut layout);
            for (row, _col) in layout {
                assert!(row < case.residual_dim());
            }
        }
    }

    #[test]
    fn residual_is_zero_when_satisfied() {
        // A 3-4-5 triangle's hypotenuse.
        let x = [0.0, 0.0, 3.0, 4.0];
        let mut out = [0.0];
        Constraint::Distance(1, 2, 5.0).residual_into(&x, &mut out);
        assert!(out[0].abs() < 1e-12);

        // Point on a radius-5 circle.
        let x = [0.0, 0.0, 5.0, 0.0, 3.0, 4.0];
        Constraint::CircleCoincident(Circle::new(1, 2), 3).residual_into(&x, &mut out);
        assert!(out[0].abs() < 1e-12);
    }
}
