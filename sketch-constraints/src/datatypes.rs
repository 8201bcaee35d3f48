/// Identifier of a sketch point. Point ids are 1-based and stable for the
/// lifetime of the sketch; points are append-only.
pub type PointId = u32;

/// Column of point `p`'s X coordinate in the parameter vector.
#[inline]
pub(crate) fn slot_x(p: PointId) -> usize {
    2 * (p as usize - 1)
}

/// Column of point `p`'s Y coordinate in the parameter vector.
#[inline]
pub(crate) fn slot_y(p: PointId) -> usize {
    2 * (p as usize - 1) + 1
}

/// Finite segment between two sketch points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Line {
    pub p1: PointId,
    pub p2: PointId,
}

impl Line {
    pub fn new(p1: PointId, p2: PointId) -> Self {
        Self { p1, p2 }
    }

    /// A line whose endpoints are the same point has no direction and can't
    /// carry an axis, parallel or normal constraint.
    pub(crate) fn is_degenerate(&self) -> bool {
        self.p1 == self.p2
    }
}

/// A circle through `rim`, centered at `center`. The radius is implicit:
/// `‖rim − center‖`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Circle {
    pub center: PointId,
    pub rim: PointId,
}

impl Circle {
    pub fn new(center: PointId, rim: PointId) -> Self {
        Self { center, rim }
    }
}

/// Circular arc from `start` to `end` around `center`.
///
/// Arcs are declarations only: they contribute no residuals of their own.
/// Callers pin down the geometry with [`Distance`](crate::Constraint::Distance)
/// or [`CircleCoincident`](crate::Constraint::CircleCoincident) constraints
/// on the three points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arc {
    pub center: PointId,
    pub start: PointId,
    pub end: PointId,
}

impl Arc {
    pub fn new(center: PointId, start: PointId, end: PointId) -> Self {
        Self { center, start, end }
    }
}

/// Geometric shapes a sketch can declare. Shapes carry only point ids; all
/// coordinates live in the sketch's parameter vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Line(Line),
    Circle(Circle),
    Arc(Arc),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_slots_are_consecutive_pairs() {
        assert_eq!((slot_x(1), slot_y(1)), (0, 1));
        assert_eq!((slot_x(2), slot_y(2)), (2, 3));
        assert_eq!((slot_x(7), slot_y(7)), (12, 13));
    }

    #[test]
    fn degenerate_line_detection() {
        assert!(Line::new(3, 3).is_degenerate());
        assert!(!Line::new(3, 4).is_degenerate());
    }
}
