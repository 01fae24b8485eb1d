// Time-integration schedules.
//
// Each schedule appends invocations to a TapeBuilder and hands it back, so
// callers can keep appending (an objective, further steps) before finishing
// the tape. Cosmology coefficients are evaluated once here and baked into
// the invocation parameters.

use log::info;

use crate::cosmology::{drift_factor, kick_factor, Background};
use crate::error::{EngineError, Result};
use crate::tape::{Params, TapeBuilder};

/// Displace parameters for growth at `a`. Order 1 drops the second-order terms.
fn displace_params<B: Background + ?Sized>(bg: &B, a: f64, order: usize) -> Result<Params> {
    let d1 = bg.d1(a);
    let v1 = bg.f1(a) * d1 * a * a * bg.e(a);
    let (d2, v2) = match order {
        1 => (0.0, 0.0),
        2 => {
            let d2 = bg.d2(a);
            (d2, bg.f2(a) * d2 * a * a * bg.e(a))
        }
        _ => {
            return Err(EngineError::InvalidParameter(format!(
                "LPT order must be 1 or 2, got {order}"
            )))
        }
    };
    Ok(Params::new().with("D1", d1).with("v1", v1).with("D2", d2).with("v2", v2))
}

/// Reject a non-finite step coefficient before it reaches the tape.
fn finite(name: &str, value: f64, ai: f64, af: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::InvalidParameter(format!(
            "{name} coefficient from a = {ai} to a = {af} is {value}; the background has no growth there"
        )))
    }
}

fn check_scale_factor(name: &str, a: f64) -> Result<()> {
    if !(a > 0.0) || !a.is_finite() {
        return Err(EngineError::InvalidParameter(format!("{name} must be a positive scale factor, got {a}")));
    }
    Ok(())
}

/// Perturbative evolution straight to `aend`: a single Displace.
pub fn lpt<'t, C, B>(mut builder: TapeBuilder<'t, C>, bg: &B, aend: f64, order: usize) -> Result<TapeBuilder<'t, C>>
where
    B: Background + ?Sized,
{
    check_scale_factor("aend", aend)?;
    let params = displace_params(bg, aend, order)?;
    info!("LPT order {order} to a = {aend}");
    builder.invoke("Displace", params)?;
    Ok(builder)
}

/// Kick-drift-kick leapfrog from `astart` to `aend` in `nsteps` steps of
/// equal Δa, bootstrapped with second-order LPT at `astart`.
pub fn kick_drift_kick<'t, C, B>(
    mut builder: TapeBuilder<'t, C>,
    bg: &B,
    astart: f64,
    aend: f64,
    nsteps: usize,
) -> Result<TapeBuilder<'t, C>>
where
    B: Background + ?Sized,
{
    check_scale_factor("astart", astart)?;
    check_scale_factor("aend", aend)?;
    if nsteps == 0 {
        return Err(EngineError::InvalidParameter("kick-drift-kick needs at least one step".into()));
    }
    if astart >= aend {
        return Err(EngineError::InvalidParameter(format!(
            "kick-drift-kick needs astart < aend, got {astart} >= {aend}"
        )));
    }
    info!("KDK {nsteps} steps from a = {astart} to a = {aend}");

    let force = || Params::new().with("factor", 1.5 * bg.omega_m());

    builder.invoke("Displace", displace_params(bg, astart, 2)?)?;
    builder.invoke("Force", force())?;

    let da = (aend - astart) / nsteps as f64;
    let checkpoint = |i: usize| if i == nsteps { aend } else { astart + da * i as f64 };
    for i in 0..nsteps {
        let (ai, af) = (checkpoint(i), checkpoint(i + 1));
        let ac = (ai * af).sqrt();
        let kick1 = finite("kick", kick_factor(bg, ai, ac, ai), ai, ac)?;
        let drift1 = finite("drift", drift_factor(bg, ai, ac, ac), ai, ac)?;
        let drift2 = finite("drift", drift_factor(bg, ac, af, ac), ac, af)?;
        let kick2 = finite("kick", kick_factor(bg, ac, af, af), ac, af)?;
        builder.invoke("Kick", Params::new().with("dda", kick1))?;
        builder.invoke("Drift", Params::new().with("dyyy", drift1))?;
        builder.invoke("Drift", Params::new().with("dyyy", drift2))?;
        builder.invoke("Force", force())?;
        builder.invoke("Kick", Params::new().with("dda", kick2))?;
    }
    Ok(builder)
}
