pub mod exit;
pub mod log_assert;
pub mod logging;
