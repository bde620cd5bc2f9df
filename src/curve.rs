//! Tempo curves
//!
//! A tempo curve is an ordered, contiguous sequence of elements, each giving
//! tempo as a function of either position (`PosTempo`) or time (`TimeTempo`).
//! Building a curve validates the descriptor and precomputes, for every
//! element, the power-basis Bézier coefficients and the cross-axis layout
//! (the length of the element in the *other* axis, found by integration).
//!
//! Conversions between the two axes use closed forms for constant and linear
//! elements and adaptive Cash–Karp integration for Bézier elements.

use crate::bezier::BezierCoeffs;
use crate::ode;
use thiserror::Error;

/// Step guess handed to the adaptive integrators.
const ODE_STEP_GUESS: f64 = 0.1;

/// Slope threshold below which the linear closed forms switch to their
/// series expansions (the exact formulas divide by the slope).
const FLAT_SLOPE: f64 = 1e-9;

/// Which axis the curve elements are expressed over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CurveAxes {
    /// Tempo as a function of position.
    PosTempo,
    /// Tempo as a function of time.
    TimeTempo,
}

/// Shape of one curve element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementKind {
    Const,
    Linear,
    Bezier,
}

/// One element of a curve descriptor.
///
/// `length` is along the curve's primary axis. Bézier interior control
/// points are normalized to `[0, 1]²` relative to the element's box.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CurveElement {
    pub kind: ElementKind,
    pub length: f64,
    pub start_value: f64,
    pub end_value: f64,
    pub p1x: f64,
    pub p1y: f64,
    pub p2x: f64,
    pub p2y: f64,
}

impl CurveElement {
    pub fn constant(value: f64, length: f64) -> Self {
        Self {
            kind: ElementKind::Const,
            length,
            start_value: value,
            end_value: value,
            p1x: 0.0,
            p1y: 0.0,
            p2x: 0.0,
            p2y: 0.0,
        }
    }

    pub fn linear(start_value: f64, end_value: f64, length: f64) -> Self {
        Self {
            kind: ElementKind::Linear,
            length,
            start_value,
            end_value,
            p1x: 0.0,
            p1y: 0.0,
            p2x: 0.0,
            p2y: 0.0,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bezier(
        start_value: f64,
        end_value: f64,
        length: f64,
        p1x: f64,
        p1y: f64,
        p2x: f64,
        p2y: f64,
    ) -> Self {
        Self {
            kind: ElementKind::Bezier,
            length,
            start_value,
            end_value,
            p1x,
            p1y,
            p2x,
            p2y,
        }
    }
}

/// Serializable description of a tempo curve.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CurveDescriptor {
    pub axes: CurveAxes,
    pub elements: Vec<CurveElement>,
}

/// Rejected curve descriptors. A failed build never yields a partial curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CurveError {
    #[error("curve descriptor has no elements")]
    Empty,
    #[error("element {index}: zero length on a non-constant element")]
    ZeroLengthElement { index: usize },
    #[error("element {index}: tempo values must be positive")]
    NonPositiveTempo { index: usize },
}

/// Where a conversion query fell relative to the curve's domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    Before,
    Inside,
    After,
}

/// One built element with its precomputed layout.
///
/// `start`/`end` are cumulative along the primary axis, `transformed_*`
/// along the other axis. Elements are contiguous in both.
#[derive(Clone, Debug)]
struct Element {
    kind: ElementKind,
    start_value: f64,
    end_value: f64,
    length: f64,
    transformed_length: f64,
    start: f64,
    end: f64,
    transformed_start: f64,
    transformed_end: f64,
    coeffs: BezierCoeffs,
}

impl Element {
    fn slope(&self) -> f64 {
        (self.end_value - self.start_value) / self.length
    }

    /// Position update after `t` time units into a position-tempo element.
    /// Solves `P'(t) = C(P(t))`.
    fn pos_tempo_over_time(&self, t: f64) -> f64 {
        let c0 = self.start_value;
        match self.kind {
            ElementKind::Const => t * c0,
            ElementKind::Linear => {
                let alpha = self.slope();
                if alpha.abs() > FLAT_SLOPE {
                    c0 / alpha * ((alpha * t).exp() - 1.0)
                } else {
                    // Fourth-order expansion; the exact formula degenerates
                    // as alpha approaches zero.
                    let t2 = t * t;
                    let t3 = t2 * t;
                    let t4 = t2 * t2;
                    let t5 = t4 * t;
                    let a2 = alpha * alpha;
                    let a3 = a2 * alpha;
                    let a4 = a2 * a2;
                    c0 * (t + alpha * t2 / 2.0 + a2 * t3 / 6.0 + a3 * t4 / 24.0 + a4 * t5 / 120.0)
                }
            }
            ElementKind::Bezier => {
                let coeffs = self.coeffs;
                ode::integrate_autonomous(
                    |p| coeffs.sample_y(coeffs.solve_x(p)),
                    0.0,
                    0.0,
                    t,
                    ODE_STEP_GUESS,
                )
                .value
            }
        }
    }

    /// Time update after `p` position units into a position-tempo element.
    /// Evaluates `T(p) = ∫ 1/C(u) du`.
    fn pos_tempo_over_pos(&self, p: f64) -> f64 {
        let c0 = self.start_value;
        match self.kind {
            ElementKind::Const => p / c0,
            ElementKind::Linear => {
                let alpha = self.slope();
                if alpha.abs() > FLAT_SLOPE {
                    ((c0 + alpha * p) / c0).ln() / alpha
                } else {
                    let p2 = p * p;
                    let p3 = p2 * p;
                    let p4 = p2 * p2;
                    let p5 = p4 * p;
                    let c02 = c0 * c0;
                    let c03 = c02 * c0;
                    let c04 = c02 * c02;
                    let c05 = c04 * c0;
                    let a2 = alpha * alpha;
                    let a3 = a2 * alpha;
                    let a4 = a2 * a2;
                    p / c0 - alpha * p2 / (2.0 * c02) + a2 * p3 / (3.0 * c03)
                        - a3 * p4 / (4.0 * c04)
                        + a4 * p5 / (5.0 * c05)
                }
            }
            ElementKind::Bezier => {
                // Change of variable: integrate dx/ds / y(s) over s, solving
                // the parameter only for the upper bound.
                let coeffs = self.coeffs;
                let s = coeffs.solve_x(p);
                ode::integrate(
                    |u| coeffs.dx_ds(u) / coeffs.sample_y(u),
                    0.0,
                    0.0,
                    s,
                    ODE_STEP_GUESS,
                )
                .value
            }
        }
    }

    /// Position update after `t` time units into a time-tempo element:
    /// the plain integral of the tempo over time.
    fn time_tempo_over_time(&self, t: f64) -> f64 {
        let c0 = self.start_value;
        match self.kind {
            ElementKind::Const => t * c0,
            ElementKind::Linear => {
                let alpha = self.slope();
                c0 * t + 0.5 * alpha * t * t
            }
            ElementKind::Bezier => {
                let coeffs = self.coeffs;
                let s = coeffs.solve_x(t);
                ode::integrate(
                    |u| coeffs.sample_y(u) * coeffs.dx_ds(u),
                    0.0,
                    0.0,
                    s,
                    ODE_STEP_GUESS,
                )
                .value
            }
        }
    }

    /// Time update after `p` position units into a time-tempo element.
    fn time_tempo_over_pos(&self, p: f64) -> f64 {
        let c0 = self.start_value;
        match self.kind {
            ElementKind::Const => p / c0,
            ElementKind::Linear => {
                let alpha = self.slope();
                if alpha.abs() > FLAT_SLOPE {
                    ((c0 * c0 + 2.0 * alpha * p).sqrt() - c0) / alpha
                } else {
                    let p2 = p * p;
                    let p3 = p2 * p;
                    let p4 = p2 * p2;
                    let p5 = p4 * p;
                    let c02 = c0 * c0;
                    let c03 = c0 * c02;
                    let c05 = c03 * c02;
                    let c07 = c05 * c02;
                    let c09 = c07 * c02;
                    let a2 = alpha * alpha;
                    let a3 = a2 * alpha;
                    let a4 = a2 * a2;
                    p / c0 - alpha * p2 / (2.0 * c03) + a2 * p3 / (2.0 * c05)
                        - a3 * p4 * 5.0 / (8.0 * c07)
                        + a4 * p5 * 7.0 / (8.0 * c09)
                }
            }
            ElementKind::Bezier => {
                // Solve the autonomous ODE T'(p) = 1/C(T(p)).
                let coeffs = self.coeffs;
                ode::integrate_autonomous(
                    |y| 1.0 / coeffs.sample_y(coeffs.solve_x(y)),
                    0.0,
                    0.0,
                    p,
                    ODE_STEP_GUESS,
                )
                .value
            }
        }
    }
}

/// A built, validated tempo curve.
pub struct TempoCurve {
    axes: CurveAxes,
    elements: Vec<Element>,
}

impl TempoCurve {
    /// Build a curve from a descriptor.
    ///
    /// Validates every element (positive tempi; zero length only on constant
    /// elements) and precomputes the cumulative layout on both axes.
    pub fn new(descriptor: &CurveDescriptor) -> Result<Self, CurveError> {
        if descriptor.elements.is_empty() {
            return Err(CurveError::Empty);
        }

        let mut elements = Vec::with_capacity(descriptor.elements.len());
        let mut start = 0.0;
        let mut transformed_start = 0.0;

        for (index, desc) in descriptor.elements.iter().enumerate() {
            if desc.length == 0.0 && desc.kind != ElementKind::Const {
                return Err(CurveError::ZeroLengthElement { index });
            }
            if desc.start_value <= 0.0 || (desc.end_value <= 0.0 && desc.kind != ElementKind::Const)
            {
                return Err(CurveError::NonPositiveTempo { index });
            }

            let end_value = match desc.kind {
                ElementKind::Const => desc.start_value,
                _ => desc.end_value,
            };

            let coeffs = if desc.kind == ElementKind::Bezier {
                let dv = end_value - desc.start_value;
                BezierCoeffs::from_control_points(
                    0.0,
                    desc.start_value,
                    desc.p1x * desc.length,
                    desc.p1y * dv + desc.start_value,
                    desc.p2x * desc.length,
                    desc.p2y * dv + desc.start_value,
                    desc.length,
                    end_value,
                )
            } else {
                BezierCoeffs::default()
            };

            let mut elt = Element {
                kind: desc.kind,
                start_value: desc.start_value,
                end_value,
                length: desc.length,
                transformed_length: 0.0,
                start,
                end: start + desc.length,
                transformed_start,
                transformed_end: 0.0,
                coeffs,
            };
            elt.transformed_length = match descriptor.axes {
                CurveAxes::PosTempo => elt.pos_tempo_over_pos(elt.length),
                CurveAxes::TimeTempo => elt.time_tempo_over_time(elt.length),
            };
            elt.transformed_end = transformed_start + elt.transformed_length;

            start = elt.end;
            transformed_start = elt.transformed_end;
            elements.push(elt);
        }

        Ok(Self { axes: descriptor.axes, elements })
    }

    pub fn axes(&self) -> CurveAxes {
        self.axes
    }

    /// Total extent along the position axis.
    pub fn pos_length(&self) -> f64 {
        let last = self.elements.last().unwrap();
        match self.axes {
            CurveAxes::PosTempo => last.end,
            CurveAxes::TimeTempo => last.transformed_end,
        }
    }

    /// Total extent along the time axis.
    pub fn time_length(&self) -> f64 {
        let last = self.elements.last().unwrap();
        match self.axes {
            CurveAxes::PosTempo => last.transformed_end,
            CurveAxes::TimeTempo => last.end,
        }
    }

    fn elt_end_time(&self, elt: &Element) -> f64 {
        match self.axes {
            CurveAxes::PosTempo => elt.transformed_end,
            CurveAxes::TimeTempo => elt.end,
        }
    }

    fn elt_end_pos(&self, elt: &Element) -> f64 {
        match self.axes {
            CurveAxes::PosTempo => elt.end,
            CurveAxes::TimeTempo => elt.transformed_end,
        }
    }

    /// Convert a time on the curve to a position.
    ///
    /// Outside the domain the curve extrapolates with constant tempo equal
    /// to the boundary value, and the returned [`Domain`] says which side
    /// the query fell on.
    pub fn position_from_time(&self, time: f64) -> (f64, Domain) {
        if time < 0.0 {
            return (time * self.elements[0].start_value, Domain::Before);
        }

        let mut elt_start_time = 0.0;
        let mut elt_start_pos = 0.0;
        for elt in &self.elements {
            // Elements are contiguous and sorted: pick the first one whose
            // end reaches the query.
            if self.elt_end_time(elt) >= time {
                let t = time - elt_start_time;
                let update = match self.axes {
                    CurveAxes::PosTempo => elt.pos_tempo_over_time(t),
                    CurveAxes::TimeTempo => elt.time_tempo_over_time(t),
                };
                return (elt_start_pos + update, Domain::Inside);
            }
            elt_start_time = self.elt_end_time(elt);
            elt_start_pos = self.elt_end_pos(elt);
        }

        let end_tempo = self.elements.last().unwrap().end_value;
        (elt_start_pos + (time - elt_start_time) * end_tempo, Domain::After)
    }

    /// Convert a position on the curve to a time.
    pub fn time_from_position(&self, pos: f64) -> (f64, Domain) {
        if pos < 0.0 {
            return (pos / self.elements[0].start_value, Domain::Before);
        }

        let mut elt_start_time = 0.0;
        let mut elt_start_pos = 0.0;
        for elt in &self.elements {
            if self.elt_end_pos(elt) >= pos {
                let p = pos - elt_start_pos;
                let update = match self.axes {
                    CurveAxes::PosTempo => elt.pos_tempo_over_pos(p),
                    CurveAxes::TimeTempo => elt.time_tempo_over_pos(p),
                };
                return (elt_start_time + update, Domain::Inside);
            }
            elt_start_time = self.elt_end_time(elt);
            elt_start_pos = self.elt_end_pos(elt);
        }

        let end_tempo = self.elements.last().unwrap().end_value;
        (elt_start_time + (pos - elt_start_pos) / end_tempo, Domain::After)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(axes: CurveAxes, elements: Vec<CurveElement>) -> TempoCurve {
        TempoCurve::new(&CurveDescriptor { axes, elements }).unwrap()
    }

    /// The two-hump Bézier curve used by the demo drivers.
    fn two_bezier() -> TempoCurve {
        build(
            CurveAxes::PosTempo,
            vec![
                CurveElement::bezier(2.0, 8.0, 10.0, 0.5, 0.0, 0.5, 1.0),
                CurveElement::bezier(8.0, 2.0, 10.0, 0.5, 0.0, 0.5, 1.0),
            ],
        )
    }

    #[test]
    fn test_build_rejects_bad_elements() {
        let r = TempoCurve::new(&CurveDescriptor {
            axes: CurveAxes::PosTempo,
            elements: vec![CurveElement::linear(1.0, 2.0, 0.0)],
        });
        assert_eq!(r.err(), Some(CurveError::ZeroLengthElement { index: 0 }));

        let r = TempoCurve::new(&CurveDescriptor {
            axes: CurveAxes::PosTempo,
            elements: vec![
                CurveElement::constant(1.0, 1.0),
                CurveElement::linear(0.0, 2.0, 1.0),
            ],
        });
        assert_eq!(r.err(), Some(CurveError::NonPositiveTempo { index: 1 }));

        let r = TempoCurve::new(&CurveDescriptor {
            axes: CurveAxes::PosTempo,
            elements: vec![],
        });
        assert_eq!(r.err(), Some(CurveError::Empty));
    }

    #[test]
    fn test_const_exact() {
        let c = build(CurveAxes::PosTempo, vec![CurveElement::constant(2.0, 10.0)]);
        let (pos, d) = c.position_from_time(3.0);
        assert_eq!(d, Domain::Inside);
        assert_eq!(pos, 6.0);
        let (time, d) = c.time_from_position(6.0);
        assert_eq!(d, Domain::Inside);
        assert_eq!(time, 3.0);
    }

    #[test]
    fn test_linear_flat_matches_const() {
        let lin = build(CurveAxes::PosTempo, vec![CurveElement::linear(2.0, 2.0, 10.0)]);
        let cst = build(CurveAxes::PosTempo, vec![CurveElement::constant(2.0, 10.0)]);
        for i in 0..=10 {
            let p = i as f64;
            let (tl, _) = lin.time_from_position(p);
            let (tc, _) = cst.time_from_position(p);
            assert!((tl - tc).abs() < 1e-12, "p={} lin={} const={}", p, tl, tc);
        }
    }

    #[test]
    fn test_linear_pos_tempo_closed_forms() {
        // C(p) = 1 + p over length 1: T(p) = ln(1 + p), P(t) = e^t - 1.
        let c = build(CurveAxes::PosTempo, vec![CurveElement::linear(1.0, 2.0, 1.0)]);
        let (t, _) = c.time_from_position(1.0);
        assert!((t - 2.0_f64.ln()).abs() < 1e-12);
        let (p, _) = c.position_from_time(2.0_f64.ln());
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_time_tempo_closed_forms() {
        // C(t) = 1 + t over length 2: P(t) = t + t²/2, so P(2) = 4.
        let c = build(CurveAxes::TimeTempo, vec![CurveElement::linear(1.0, 3.0, 2.0)]);
        let (p, _) = c.position_from_time(2.0);
        assert!((p - 4.0).abs() < 1e-12);
        let (t, _) = c.time_from_position(4.0);
        assert!((t - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_boundary_extrapolation() {
        let c = build(CurveAxes::PosTempo, vec![CurveElement::linear(2.0, 4.0, 10.0)]);
        let (pos, d) = c.position_from_time(-1.0);
        assert_eq!(d, Domain::Before);
        assert!((pos - -2.0).abs() < 1e-12);

        let end_time = c.time_length();
        let (pos, d) = c.position_from_time(end_time + 1.0);
        assert_eq!(d, Domain::After);
        assert!((pos - 14.0).abs() < 1e-9); // 10 + 1·endValue

        let (time, d) = c.time_from_position(-4.0);
        assert_eq!(d, Domain::Before);
        assert!((time - -2.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_length_const_contributes_nothing() {
        let with = build(
            CurveAxes::PosTempo,
            vec![CurveElement::constant(3.0, 0.0), CurveElement::constant(2.0, 10.0)],
        );
        let without = build(CurveAxes::PosTempo, vec![CurveElement::constant(2.0, 10.0)]);
        for i in 1..=10 {
            let t = i as f64 * 0.5;
            assert!((with.position_from_time(t).0 - without.position_from_time(t).0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bezier_identity_matches_linear() {
        // Interior control points at thirds of the diagonal make the Bézier
        // coincide with the straight ramp.
        let bez = build(
            CurveAxes::PosTempo,
            vec![CurveElement::bezier(1.0, 3.0, 2.0, 1.0 / 3.0, 1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0)],
        );
        let lin = build(CurveAxes::PosTempo, vec![CurveElement::linear(1.0, 3.0, 2.0)]);
        for i in 0..=20 {
            let p = i as f64 * 0.1;
            let (tb, _) = bez.time_from_position(p);
            let (tl, _) = lin.time_from_position(p);
            assert!((tb - tl).abs() < 1e-6, "p={} bez={} lin={}", p, tb, tl);
        }
    }

    #[test]
    fn test_two_bezier_monotone_and_roundtrip() {
        let c = two_bezier();
        let pos_len = c.pos_length();
        let time_len = c.time_length();
        assert_eq!(pos_len, 20.0);
        assert!(time_len > 0.0);

        let mut last_time = 0.0;
        let mut p = 0.0;
        while p <= pos_len {
            let (t, _) = c.time_from_position(p);
            assert!(t >= last_time - 1e-9, "time not monotone at p={}", p);
            last_time = t;
            p += 0.01;
        }

        let mut last_pos = 0.0;
        let mut t = 0.0;
        while t <= time_len {
            let (pos, _) = c.position_from_time(t);
            assert!(pos >= last_pos - 1e-9, "pos not monotone at t={}", t);
            last_pos = pos;
            t += 0.01;
        }

        // Round trip composition stays within 1e-6.
        for i in 0..=20 {
            let p = i as f64;
            let (t, _) = c.time_from_position(p);
            let (p_back, _) = c.position_from_time(t);
            assert!((p_back - p).abs() < 1e-6, "p={} back={}", p, p_back);
        }
    }

    #[test]
    fn test_time_tempo_bezier_roundtrip() {
        let c = build(
            CurveAxes::TimeTempo,
            vec![CurveElement::bezier(2.0, 6.0, 4.0, 0.5, 0.0, 0.5, 1.0)],
        );
        for i in 1..=8 {
            let t = i as f64 * 0.5;
            let (p, _) = c.position_from_time(t);
            let (t_back, _) = c.time_from_position(p);
            assert!((t_back - t).abs() < 1e-6, "t={} back={}", t, t_back);
        }
    }
}
