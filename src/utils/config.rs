//! Configuration struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// the listed fields with values parsed from the given TOML string (if any).
/// Unknown keys in the TOML input are rejected so that typos do not silently
/// fall back to defaults.
///
/// Example:
/// ```ignore
/// let opts = parsed_config!(config_str => ReplicationConfig;
///                           gc_interval_ms, fd_lease_seconds)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+ $(,)?) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose = || -> Result<$config_type, ReplicoreError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;
            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    config.$field = value.try_into()?;
                }
            )+

            // any key still left was never claimed by a field above
            if let Some(stray) = table.keys().next() {
                return Err(ReplicoreError(format!(
                    "unrecognized config field '{}'",
                    stray
                )));
            }

            Ok(config)
        };

        compose()
    }};
}
