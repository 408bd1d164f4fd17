pub mod logging;
pub mod worker;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    ColorChoice, Command,
};

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let command = Command::new("auth-offload")
        .about("Authentication offload worker")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles);

    let command = worker::with_args(command);
    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use super::worker::{Options, ARG_INHERIT_FDS, ARG_SUBSYSTEM};

    const VARS: [&str; 7] = [
        "AUTH_OFFLOAD_SUBSYSTEM",
        "AUTH_OFFLOAD_SUBSYSTEM_TYPE",
        "AUTH_OFFLOAD_INHERIT_FDS",
        "AUTH_OFFLOAD_LIVENESS_INTERVAL_SECONDS",
        "AUTH_OFFLOAD_SESSION_DEADLINE_SECONDS",
        "AUTH_OFFLOAD_MAX_RECORD_BYTES",
        "AUTH_OFFLOAD_LOG_LEVEL",
    ];

    fn unset() -> Vec<(&'static str, Option<&'static str>)> {
        VARS.iter().map(|name| (*name, None)).collect()
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "auth-offload");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some("Authentication offload worker".to_string())
        );
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn test_subsystem_is_required() {
        temp_env::with_vars(unset(), || {
            let result = new().try_get_matches_from(["auth-offload"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_defaults() {
        temp_env::with_vars(unset(), || {
            let matches = new()
                .try_get_matches_from(["auth-offload", "--subsystem", "sshd"])
                .expect("valid arguments");
            let options = Options::parse(&matches).expect("options");
            assert_eq!(options.subsystem, "sshd");
            assert_eq!(options.subsystem_type.to_string(), "DAEMON");
            assert!(options.inherit_fds.is_empty());
            assert_eq!(options.liveness_interval, Duration::from_secs(20));
            assert_eq!(options.session_deadline, Duration::from_secs(120));
            assert_eq!(options.max_record_bytes, 1_048_576);
        });
    }

    #[test]
    fn test_check_args() {
        temp_env::with_vars(unset(), || {
            let matches = new()
                .try_get_matches_from([
                    "auth-offload",
                    "--subsystem",
                    "imapd",
                    "--subsystem-type",
                    "client",
                    "--inherit-fds",
                    "3, 4",
                    "--liveness-interval-seconds",
                    "5",
                    "-vv",
                ])
                .expect("valid arguments");
            assert_eq!(
                matches.get_one::<Vec<i32>>(ARG_INHERIT_FDS).cloned(),
                Some(vec![3, 4])
            );
            assert_eq!(
                matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                Some(2)
            );
            let options = Options::parse(&matches).expect("options");
            assert_eq!(options.subsystem_type.to_string(), "CLIENT");
            assert_eq!(options.liveness_interval, Duration::from_secs(5));
        });
    }

    #[test]
    fn test_invalid_inherit_fds() {
        temp_env::with_vars(unset(), || {
            let result = new().try_get_matches_from([
                "auth-offload",
                "--subsystem",
                "sshd",
                "--inherit-fds",
                "3,stdin",
            ]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("AUTH_OFFLOAD_SUBSYSTEM", Some("smtpd")),
                ("AUTH_OFFLOAD_SUBSYSTEM_TYPE", Some("TOOL")),
                ("AUTH_OFFLOAD_INHERIT_FDS", Some("7")),
                ("AUTH_OFFLOAD_SESSION_DEADLINE_SECONDS", Some("30")),
                ("AUTH_OFFLOAD_MAX_RECORD_BYTES", Some("4096")),
                ("AUTH_OFFLOAD_LOG_LEVEL", Some("info")),
            ],
            || {
                let matches = new().get_matches_from(["auth-offload"]);
                assert_eq!(
                    matches.get_one::<String>(ARG_SUBSYSTEM).cloned(),
                    Some("smtpd".to_string())
                );
                assert_eq!(
                    matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(),
                    Some(2)
                );
                let options = Options::parse(&matches).expect("options");
                assert_eq!(options.inherit_fds, vec![7]);
                assert_eq!(options.subsystem_type.to_string(), "TOOL");
                assert_eq!(options.session_deadline, Duration::from_secs(30));
                assert_eq!(options.max_record_bytes, 4096);
            },
        );
    }
}
