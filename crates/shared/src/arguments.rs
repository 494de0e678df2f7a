//! Helpers for command line arguments shared between binaries.

use primitive_types::U256;
use std::{
    fmt::{self, Display, Formatter},
    num::{ParseFloatError, ParseIntError},
    time::Duration,
};

pub fn duration_from_seconds(s: &str) -> Result<Duration, ParseFloatError> {
    Ok(Duration::from_secs_f32(s.parse()?))
}

pub fn duration_from_millis(s: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_millis(s.parse()?))
}

pub fn display_option(option: &Option<impl Display>, f: &mut Formatter) -> fmt::Result {
    match option {
        Some(display) => write!(f, "{display}"),
        None => write!(f, "None"),
    }
}

pub fn display_secs(duration: Duration, f: &mut Formatter) -> fmt::Result {
    write!(f, "{}s", duration.as_secs_f32())
}

/// Parses an amount given in whole token units into sub-units.
pub fn wei_from_base_unit(s: &str) -> anyhow::Result<U256> {
    Ok(U256::from_dec_str(s)? * U256::exp10(18))
}
