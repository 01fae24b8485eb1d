/// Cosmological background and leapfrog step kernels.
///
/// Growth ODEs in x = ln a (prime = d/dx):
///   y1'' = −(2 + dlnH/dlna) y1' + 1.5 Ωm(a) y1
///   y2'' = −(2 + dlnH/dlna) y2' + 1.5 Ωm(a) (y2 − y1²)
///
/// Integrated with RK4 from Einstein-de Sitter initial conditions
/// (y1 = a, y2 = −3/7 a²), normalized so that D1(1) = 1 and D2 → D1² at
/// early times. Values between samples are cubic Hermite interpolants.
///
/// Step kernels for the kick-drift-kick schedule:
///   K(ai, af, ar) = (Gf(af) − Gf(ai)) / (ar² E(ar) gf(ar))
///   D(ai, af, ar) = (Gp(af) − Gp(ai)) / (ar³ E(ar) gp(ar))

use crate::error::{EngineError, Result};

// ── Background trait ─────────────────────────────────────────────────

/// Growth functions of a homogeneous background, as pure functions of the
/// scale factor.
pub trait Background {
    /// First-order growth factor, 1 today.
    fn d1(&self, a: f64) -> f64;
    /// Second-order growth factor.
    fn d2(&self, a: f64) -> f64;
    /// dlnD1/dlna
    fn f1(&self, a: f64) -> f64;
    /// dlnD2/dlna
    fn f2(&self, a: f64) -> f64;
    /// H(a) / H0
    fn e(&self, a: f64) -> f64;
    /// Ω_m today.
    fn omega_m(&self) -> f64;

    /// Gp
    fn drift_growth(&self, a: f64) -> f64 {
        self.d1(a)
    }

    /// gp = dGp/da
    fn drift_growth_rate(&self, a: f64) -> f64 {
        self.f1(a) * self.d1(a) / a
    }

    /// Gf = a³ E dD1/da
    fn kick_growth(&self, a: f64) -> f64 {
        a * a * self.e(a) * self.f1(a) * self.d1(a)
    }

    /// gf = dGf/da
    fn kick_growth_rate(&self, a: f64) -> f64;
}

/// Momentum update coefficient of a kick from `ai` to `af`, referenced at `ar`.
pub fn kick_factor<B: Background + ?Sized>(bg: &B, ai: f64, af: f64, ar: f64) -> f64 {
    (bg.kick_growth(af) - bg.kick_growth(ai)) / (ar * ar * bg.e(ar) * bg.kick_growth_rate(ar))
}

/// Position update coefficient of a drift from `ai` to `af`, referenced at `ar`.
pub fn drift_factor<B: Background + ?Sized>(bg: &B, ai: f64, af: f64, ar: f64) -> f64 {
    (bg.drift_growth(af) - bg.drift_growth(ai)) / (ar * ar * ar * bg.e(ar) * bg.drift_growth_rate(ar))
}

// ── ΛCDM background ──────────────────────────────────────────────────

const A_MIN: f64 = 1e-5;
const A_MAX: f64 = 10.0;
const STEPS: usize = 4096;

/// Per-sample state: [y1, y1', y1'', y2, y2', y2''].
type Sample = [f64; 6];

/// Matter + cosmological constant background, with curvature
/// Ω_k = 1 − Ω_m − Ω_Λ.
///
/// Growth tables cover a ∈ [1e-5, 10]; outside that range the end segments
/// are extrapolated.
#[derive(Clone, Debug)]
pub struct Cosmology {
    omega_m: f64,
    omega_lambda: f64,
    omega_k: f64,
    x0: f64,
    dx: f64,
    samples: Vec<Sample>,
    norm1: f64,
    norm2: f64,
}

impl Cosmology {
    pub fn new(omega_m: f64, omega_lambda: f64) -> Result<Self> {
        // Without matter the kick growth rate vanishes and the kick kernel diverges.
        if !(omega_m > 0.0) || !omega_m.is_finite() || !omega_lambda.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "cosmology requires finite Ω_m > 0 and Ω_Λ, got {omega_m}, {omega_lambda}"
            )));
        }
        let mut c = Cosmology {
            omega_m,
            omega_lambda,
            omega_k: 1.0 - omega_m - omega_lambda,
            x0: A_MIN.ln(),
            dx: (A_MAX.ln() - A_MIN.ln()) / STEPS as f64,
            samples: Vec::with_capacity(STEPS + 1),
            norm1: 1.0,
            norm2: 1.0,
        };
        for i in 0..=STEPS {
            let a = (c.x0 + c.dx * i as f64).exp();
            if !(c.e2(a) > 0.0) {
                return Err(EngineError::InvalidParameter(format!(
                    "H² ≤ 0 at a = {a:.3e} for Ω_m = {omega_m}, Ω_Λ = {omega_lambda}"
                )));
            }
        }
        c.integrate();
        let y1_today = c.interp(0.0, 0);
        if !(y1_today.abs() > 0.0) {
            return Err(EngineError::InvalidParameter("growth factor vanishes today".into()));
        }
        c.norm1 = 1.0 / y1_today;
        c.norm2 = 1.0 / (-3.0 / 7.0 * y1_today * y1_today);
        Ok(c)
    }

    /// Flat ΛCDM.
    pub fn flat(omega_m: f64) -> Result<Self> {
        Self::new(omega_m, 1.0 - omega_m)
    }

    pub fn omega_lambda(&self) -> f64 {
        self.omega_lambda
    }

    pub fn omega_k(&self) -> f64 {
        self.omega_k
    }

    fn e2(&self, a: f64) -> f64 {
        self.omega_m / (a * a * a) + self.omega_k / (a * a) + self.omega_lambda
    }

    /// dE/da
    fn de_da(&self, a: f64) -> f64 {
        (-3.0 * self.omega_m / a.powi(4) - 2.0 * self.omega_k / a.powi(3)) / (2.0 * self.e(a))
    }

    /// Ω_m(a) and dlnH/dlna.
    fn coefficients(&self, a: f64) -> (f64, f64) {
        let e2 = self.e2(a);
        let om_a = self.omega_m / (a * a * a) / e2;
        let dlnh = (-3.0 * self.omega_m / (a * a * a) - 2.0 * self.omega_k / (a * a)) / (2.0 * e2);
        (om_a, dlnh)
    }

    /// Second derivatives in ln a of state [y1, y1', y2, y2'].
    fn accel(&self, a: f64, y: [f64; 4]) -> (f64, f64) {
        let (om_a, dlnh) = self.coefficients(a);
        let y1pp = -(2.0 + dlnh) * y[1] + 1.5 * om_a * y[0];
        let y2pp = -(2.0 + dlnh) * y[3] + 1.5 * om_a * (y[2] - y[0] * y[0]);
        (y1pp, y2pp)
    }

    fn rhs(&self, x: f64, y: [f64; 4]) -> [f64; 4] {
        let (y1pp, y2pp) = self.accel(x.exp(), y);
        [y[1], y1pp, y[3], y2pp]
    }

    fn integrate(&mut self) {
        let a0 = A_MIN;
        let mut y = [a0, a0, -3.0 / 7.0 * a0 * a0, -6.0 / 7.0 * a0 * a0];
        let h = self.dx;
        for i in 0..=STEPS {
            let x = self.x0 + h * i as f64;
            let (y1pp, y2pp) = self.accel(x.exp(), y);
            self.samples.push([y[0], y[1], y1pp, y[2], y[3], y2pp]);
            if i == STEPS {
                break;
            }
            let add = |y: [f64; 4], k: [f64; 4], s: f64| [0, 1, 2, 3].map(|j| y[j] + s * k[j]);
            let k1 = self.rhs(x, y);
            let k2 = self.rhs(x + 0.5 * h, add(y, k1, 0.5 * h));
            let k3 = self.rhs(x + 0.5 * h, add(y, k2, 0.5 * h));
            let k4 = self.rhs(x + h, add(y, k3, h));
            y = [0, 1, 2, 3].map(|j| y[j] + h / 6.0 * (k1[j] + 2.0 * k2[j] + 2.0 * k3[j] + k4[j]));
        }
    }

    /// Hermite interpolation of sample component `c` (value at c, its
    /// x-derivative at c + 1) at x = `x`.
    fn interp(&self, x: f64, c: usize) -> f64 {
        let u = (x - self.x0) / self.dx;
        let i = (u.floor().max(0.0) as usize).min(STEPS - 1);
        let t = u - i as f64;
        let (p, q) = (&self.samples[i], &self.samples[i + 1]);
        let (t2, t3) = (t * t, t * t * t);
        let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
        let h10 = t3 - 2.0 * t2 + t;
        let h01 = -2.0 * t3 + 3.0 * t2;
        let h11 = t3 - t2;
        h00 * p[c] + h10 * self.dx * p[c + 1] + h01 * q[c] + h11 * self.dx * q[c + 1]
    }

    /// dD1/da and d²D1/da².
    fn d1_derivatives(&self, a: f64) -> (f64, f64) {
        let x = a.ln();
        let (y, yx) = (self.interp(x, 0), self.interp(x, 1));
        let (om_a, dlnh) = self.coefficients(a);
        let yxx = -(2.0 + dlnh) * yx + 1.5 * om_a * y;
        let (yx, yxx) = (yx * self.norm1, yxx * self.norm1);
        (yx / a, (yxx - yx) / (a * a))
    }
}

impl Background for Cosmology {
    fn d1(&self, a: f64) -> f64 {
        self.interp(a.ln(), 0) * self.norm1
    }

    fn d2(&self, a: f64) -> f64 {
        self.interp(a.ln(), 3) * self.norm2
    }

    fn f1(&self, a: f64) -> f64 {
        let x = a.ln();
        self.interp(x, 1) / self.interp(x, 0)
    }

    fn f2(&self, a: f64) -> f64 {
        let x = a.ln();
        self.interp(x, 4) / self.interp(x, 3)
    }

    fn e(&self, a: f64) -> f64 {
        self.e2(a).sqrt()
    }

    fn omega_m(&self) -> f64 {
        self.omega_m
    }

    fn drift_growth_rate(&self, a: f64) -> f64 {
        self.d1_derivatives(a).0
    }

    fn kick_growth(&self, a: f64) -> f64 {
        a * a * a * self.e(a) * self.d1_derivatives(a).0
    }

    fn kick_growth_rate(&self, a: f64) -> f64 {
        let (dd, ddd) = self.d1_derivatives(a);
        let e = self.e(a);
        a * a * a * e * ddd + dd * (3.0 * a * a * e + a * a * a * self.de_da(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * b.abs().max(1.0)
    }

    #[test]
    fn test_normalized_today() {
        let c = Cosmology::flat(0.3).unwrap();
        assert!(close(c.d1(1.0), 1.0, 1e-10));
        assert!(close(c.e(1.0), 1.0, 1e-12));
    }

    #[test]
    fn test_einstein_de_sitter_limits() {
        let c = Cosmology::new(1.0, 0.0).unwrap();
        for &a in &[0.01, 0.1, 0.5, 1.0, 2.0] {
            assert!(close(c.d1(a), a, 1e-6), "D1({a}) = {}", c.d1(a));
            assert!(close(c.d2(a), a * a, 1e-6), "D2({a}) = {}", c.d2(a));
            assert!(close(c.f1(a), 1.0, 1e-6));
            assert!(close(c.f2(a), 2.0, 1e-6));
            assert!(close(c.kick_growth(a), a.powf(1.5), 1e-6));
            assert!(close(c.kick_growth_rate(a), 1.5 * a.sqrt(), 1e-5));
            assert!(close(c.drift_growth_rate(a), 1.0, 1e-6));
        }
    }

    #[test]
    fn test_lambda_suppresses_growth() {
        let c = Cosmology::flat(0.3).unwrap();
        // D1/a grows toward early times in ΛCDM once normalized today.
        assert!(c.d1(0.1) / 0.1 > 1.1);
        assert!(c.f1(1.0) < 0.6 && c.f1(1.0) > 0.45);
        assert!(close(c.f1(1e-3), 1.0, 1e-3));
    }

    #[test]
    fn test_default_rates_agree_with_table() {
        let c = Cosmology::flat(0.3).unwrap();
        let a = 0.4;
        let gp = c.f1(a) * c.d1(a) / a;
        assert!(close(c.drift_growth_rate(a), gp, 1e-8));
        let gf = a * a * c.e(a) * c.f1(a) * c.d1(a);
        assert!(close(c.kick_growth(a), gf, 1e-8));
    }

    #[test]
    fn test_kick_rate_matches_finite_difference() {
        let c = Cosmology::flat(0.3).unwrap();
        let (a, h) = (0.5, 1e-5);
        let fd = (c.kick_growth(a + h) - c.kick_growth(a - h)) / (2.0 * h);
        assert!(close(c.kick_growth_rate(a), fd, 1e-5));
    }

    #[test]
    fn test_invalid_density_rejected() {
        assert!(Cosmology::new(-0.1, 0.7).is_err());
        assert!(Cosmology::flat(0.0).is_err());
        assert!(Cosmology::new(f64::NAN, 0.7).is_err());
        // Strongly closed universe recollapses inside the table range.
        assert!(Cosmology::new(0.0, -5.0).is_err());
    }
}
