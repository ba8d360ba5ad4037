use num::{FromPrimitive, traits::WrappingAdd};
use std::{env, time::Duration};

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::from_u8(1).unwrap());
    id
}

/// Get the default operation timeout, either from environment or 3 seconds
pub fn get_default_timeout() -> Duration {
    let seconds = env::var("EPICS_CA_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(3.0f32)
        .max(0.001f32);
    Duration::from_secs_f32(seconds)
}

/// How long a single wait increment inside the blocking primitives lasts
pub(crate) fn service_tick() -> Duration {
    Duration::from_millis(1)
}
