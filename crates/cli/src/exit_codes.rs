//! CLI Exit Code Registry
//!
//! This is the single source of truth for all `casemap` exit codes.
//! Exit codes are part of the shell contract; scripts rely on them.
//!
//! | Code | Meaning                                                  |
//! |------|----------------------------------------------------------|
//! | 0    | Success                                                  |
//! | 1    | General error (unspecified)                              |
//! | 2    | Usage error (bad args, unsupported output extension)     |
//! | 3    | Invalid config (unreadable, TOML error, failed checks)   |
//! | 4    | Snapshot store error (cannot open, unreadable revision)  |
//! | 5    | Parse error (revision label, snapshot CSV, number)       |
//! | 6    | Integrity violation (denominator conflict, duplicates)   |
//! | 7    | Render error (template, missing metric, bounds, colors)  |
//! | 8    | Output error (cannot write export or map files)          |

use casemap_io::{ExportError, RenderError};
use casemap_recon::ReconError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

/// Config file unreadable, malformed, or fails validation.
pub const EXIT_INVALID_CONFIG: u8 = 3;

/// Snapshot store could not be opened or read.
pub const EXIT_STORE: u8 = 4;

/// A revision label or snapshot table failed to parse.
pub const EXIT_PARSE: u8 = 5;

/// Reconciliation found conflicting denominators or duplicate keys.
pub const EXIT_INTEGRITY: u8 = 6;

/// Map rendering failed.
pub const EXIT_RENDER: u8 = 7;

/// Writing output files failed.
pub const EXIT_OUTPUT: u8 = 8;

/// Map a pipeline error to its exit code.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err.root() {
        ReconError::ConfigParse(_) | ReconError::ConfigValidation(_) => EXIT_INVALID_CONFIG,
        ReconError::Store(_) => EXIT_STORE,
        e if e.is_parse_error() => EXIT_PARSE,
        e if e.is_integrity_violation() => EXIT_INTEGRITY,
        _ => EXIT_ERROR,
    }
}

pub fn render_exit_code(err: &RenderError) -> u8 {
    match err {
        RenderError::Io { .. } => EXIT_OUTPUT,
        _ => EXIT_RENDER,
    }
}

pub fn export_exit_code(err: &ExportError) -> u8 {
    match err {
        ExportError::UnknownFormat(_) => EXIT_USAGE,
        _ => EXIT_OUTPUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casemap_recon::model::RegionKey;
    use chrono::NaiveDate;

    #[test]
    fn load_context_maps_to_root_class() {
        let date = NaiveDate::from_ymd_opt(2020, 4, 10).unwrap();
        let parse = ReconError::Load {
            date,
            revision: "abc".into(),
            source: Box::new(ReconError::MissingColumn {
                date,
                column: "MODIFIED_ZCTA".into(),
            }),
        };
        assert_eq!(recon_exit_code(&parse), EXIT_PARSE);

        let conflict = ReconError::DenominatorConflict {
            region: RegionKey(10001),
            values: vec![1.0, 2.0],
        };
        assert_eq!(recon_exit_code(&conflict), EXIT_INTEGRITY);
        assert_eq!(
            recon_exit_code(&ReconError::ConfigValidation("x".into())),
            EXIT_INVALID_CONFIG
        );
    }
}
