use crate::error::{PsErr, Result};

/// Fails unless `value` is finite and strictly positive.
pub fn positive(what: &'static str, value: f32) -> Result<f32> {
    if value.is_finite() && value > 0. {
        return Ok(value);
    }

    Err(PsErr::invalid(what, value, "a positive finite float"))
}

/// Fails unless `value` is finite and not negative.
pub fn non_negative(what: &'static str, value: f32) -> Result<f32> {
    if value.is_finite() && value >= 0. {
        return Ok(value);
    }

    Err(PsErr::invalid(what, value, "a non-negative finite float"))
}

/// Fails unless `value` is finite.
pub fn finite(what: &'static str, value: f32) -> Result<f32> {
    if value.is_finite() {
        return Ok(value);
    }

    Err(PsErr::invalid(what, value, "a finite float"))
}

/// Fails unless `value` lies in `[0, 1)`.
pub fn decay_rate(what: &'static str, value: f32) -> Result<f32> {
    if (0. ..1.).contains(&value) {
        return Ok(value);
    }

    Err(PsErr::invalid(what, value, "a float in [0, 1)"))
}

/// Fails unless `value` lies in `(0, 1)`.
pub fn open_unit(what: &'static str, value: f32) -> Result<f32> {
    if value > 0. && value < 1. {
        return Ok(value);
    }

    Err(PsErr::invalid(what, value, "a float in (0, 1)"))
}
