/// Perform a runtime assertion, but if it fails, log an error rather than
/// issuing a runtime panic.
#[macro_export]
macro_rules! log_assert {
    ($check:expr, $($field:tt)*) => {{
        let check: bool = $check;
        debug_assert!(check);
        if !check {
            tracing::error!($($field)*)
        }
    }}
}

/// Log that an internal invariant was violated. Panics in debug builds.
#[macro_export]
macro_rules! illegal_state {
    ($msg:expr, $($field:tt)*) => {{
        debug_assert!(false, "illegal state: {}", $msg);
        tracing::error!($($field)*, "illegal state: {}", $msg)
    }}
}
