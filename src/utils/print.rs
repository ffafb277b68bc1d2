//! Logging macros that stamp every line with a parenthesized prefix, which
//! for replica-scoped messages is the replica name `<app_id>.<pidx>@<status>`.

/// Log a TRACE message with a parenthesized prefix.
///
/// Example:
/// ```ignore
/// pf_trace!(name; "appending mutation {}", mu_name);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log a DEBUG message with a parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log an INFO message with a parenthesized prefix.
///
/// Example:
/// ```ignore
/// pf_info!(name; "opened replica at decree {}", decree);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log a WARN message with a parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log an ERROR message with a parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix $(, $fmt_arg)*)
    };
}

/// Log an error-level message and produce the same string wrapped in an
/// `Err(ReplicoreError)`, ready to be returned.
///
/// Example:
/// ```ignore
/// return logged_err!(name; "unexpected status {}", status);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {{
        pf_error!($prefix; $fmt_str $(, $fmt_arg)*);
        Err($crate::utils::ReplicoreError(format!(
            concat!("({}) ", $fmt_str),
            $prefix $(, $fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::ReplicoreError;

    #[test]
    fn logged_err_no_args() {
        assert_eq!(
            logged_err!("1.0"; "no can do"),
            Err::<(), ReplicoreError>(ReplicoreError("(1.0) no can do".into()))
        );
    }

    #[test]
    fn logged_err_with_args() {
        assert_eq!(
            logged_err!(7; "decree {} out of window", 42),
            Err::<(), ReplicoreError>(ReplicoreError(
                "(7) decree 42 out of window".into()
            ))
        );
    }
}
