/// Generates `Display` and `FromStr` impls for option enums parsed from
/// [`ConnectorConfig`](crate::config::ConnectorConfig) values.
///
/// ```ignore
/// str_enum!(AssignerKind, lowercase, "invalid shard.assigner",
///     Uniform => "uniform";
///     Hash => "hash", "hash_based");
/// ```
///
/// The first literal of each variant is its canonical spelling (used by
/// `Display`); extra literals are accepted aliases. Parse failures become
/// `ConnectorError::ConfigurationError`.
///
/// # Normalization modes
///
/// - `lowercase`: `to_lowercase().replace('-', "_")`
/// - `uppercase`: `to_uppercase().replace('-', "_")`
macro_rules! str_enum {
    ($enum_name:ident, $norm:ident, $err_msg:literal,
        $( $variant:ident => $display:literal $(, $alias:literal)* );+ $(;)?
    ) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let s = match self {
                    $( Self::$variant => $display, )+
                };
                f.write_str(s)
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = crate::error::ConnectorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = str_enum!(@normalize $norm s);
                match normalized.as_str() {
                    $( $display $(| $alias)* => Ok(Self::$variant), )+
                    other => Err(crate::error::ConnectorError::ConfigurationError(
                        format!("{}: '{}'", $err_msg, other),
                    )),
                }
            }
        }
    };

    (@normalize lowercase $s:ident) => { $s.trim().to_lowercase().replace('-', "_") };
    (@normalize uppercase $s:ident) => { $s.trim().to_uppercase().replace('-', "_") };
}
