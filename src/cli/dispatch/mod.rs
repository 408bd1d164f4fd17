//! Command-line argument dispatch.
//!
//! Maps validated CLI matches to the worker action.

use crate::cli::actions::{worker::Args, Action};
use crate::cli::commands::worker;
use anyhow::Result;

/// Map validated CLI matches to the worker action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let options = worker::Options::parse(matches)?;

    Ok(Action::Worker(Args {
        subsystem: options.subsystem,
        subsystem_type: options.subsystem_type,
        inherit_fds: options.inherit_fds,
        liveness_interval: options.liveness_interval,
        session_deadline: options.session_deadline,
        max_record_bytes: options.max_record_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_subsystem_is_rejected() {
        temp_env::with_vars([("AUTH_OFFLOAD_SUBSYSTEM", Some("  "))], || {
            let matches = crate::cli::commands::new().get_matches_from(vec!["auth-offload"]);
            let result = handler(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err
                    .to_string()
                    .contains("missing required argument: --subsystem"));
            }
        });
    }

    #[test]
    fn worker_action() {
        temp_env::with_vars(
            [
                ("AUTH_OFFLOAD_SUBSYSTEM", Some("sshd")),
                ("AUTH_OFFLOAD_INHERIT_FDS", Some("3")),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec!["auth-offload"]);
                let Ok(Action::Worker(args)) = handler(&matches) else {
                    panic!("expected a worker action");
                };
                assert_eq!(args.subsystem, "sshd");
                assert_eq!(args.inherit_fds, vec![3]);
            },
        );
    }
}
