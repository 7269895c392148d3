pub mod copy;
pub mod drain;
pub mod prelude;
pub mod signal;
pub mod strng;
pub mod telemetry;
