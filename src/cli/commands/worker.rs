use clap::{builder::ValueParser, Arg, ArgMatches, Command};
use std::{os::fd::RawFd, time::Duration};

use crate::offload::{dispatcher::SubsystemType, inherit::parse_fd_list};

pub const ARG_SUBSYSTEM: &str = "subsystem";
pub const ARG_SUBSYSTEM_TYPE: &str = "subsystem-type";
pub const ARG_INHERIT_FDS: &str = "inherit-fds";
pub const ARG_LIVENESS_INTERVAL: &str = "liveness-interval-seconds";
pub const ARG_SESSION_DEADLINE: &str = "session-deadline-seconds";
pub const ARG_MAX_RECORD_BYTES: &str = "max-record-bytes";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SUBSYSTEM)
                .long(ARG_SUBSYSTEM)
                .help("Subsystem identity adopted from the parent")
                .env("AUTH_OFFLOAD_SUBSYSTEM")
                .required(true),
        )
        .arg(
            Arg::new(ARG_SUBSYSTEM_TYPE)
                .long(ARG_SUBSYSTEM_TYPE)
                .help("Subsystem type: DAEMON, TOOL or CLIENT")
                .env("AUTH_OFFLOAD_SUBSYSTEM_TYPE")
                .default_value("DAEMON")
                .value_parser(ValueParser::from(|raw: &str| raw.parse::<SubsystemType>())),
        )
        .arg(
            Arg::new(ARG_INHERIT_FDS)
                .long(ARG_INHERIT_FDS)
                .help("Comma separated descriptors inherited from the parent, example: 3,4")
                .env("AUTH_OFFLOAD_INHERIT_FDS")
                .value_parser(ValueParser::from(parse_fd_list)),
        )
        .arg(
            Arg::new(ARG_LIVENESS_INTERVAL)
                .long(ARG_LIVENESS_INTERVAL)
                .help("Liveness timer period in seconds; the parent must send ALIVE within every period")
                .env("AUTH_OFFLOAD_LIVENESS_INTERVAL_SECONDS")
                .default_value("20")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SESSION_DEADLINE)
                .long(ARG_SESSION_DEADLINE)
                .help("Default deadline in seconds for a handshake waiting on its peer")
                .env("AUTH_OFFLOAD_SESSION_DEADLINE_SECONDS")
                .default_value("120")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_MAX_RECORD_BYTES)
                .long(ARG_MAX_RECORD_BYTES)
                .help("Largest control channel record accepted, in bytes")
                .env("AUTH_OFFLOAD_MAX_RECORD_BYTES")
                .default_value("1048576")
                .value_parser(clap::value_parser!(usize)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub subsystem: String,
    pub subsystem_type: SubsystemType,
    pub inherit_fds: Vec<RawFd>,
    pub liveness_interval: Duration,
    pub session_deadline: Duration,
    pub max_record_bytes: usize,
}

impl Options {
    /// Parse worker arguments from matches.
    ///
    /// # Errors
    /// Returns an error if required arguments are missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let subsystem = match matches.get_one::<String>(ARG_SUBSYSTEM) {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => anyhow::bail!("missing required argument: --{ARG_SUBSYSTEM}"),
        };
        let seconds = |id: &str| Duration::from_secs(matches.get_one::<u64>(id).copied().unwrap_or(0));

        Ok(Self {
            subsystem,
            subsystem_type: matches
                .get_one::<SubsystemType>(ARG_SUBSYSTEM_TYPE)
                .copied()
                .unwrap_or_default(),
            inherit_fds: matches
                .get_one::<Vec<RawFd>>(ARG_INHERIT_FDS)
                .cloned()
                .unwrap_or_default(),
            liveness_interval: seconds(ARG_LIVENESS_INTERVAL),
            session_deadline: seconds(ARG_SESSION_DEADLINE),
            max_record_bytes: matches
                .get_one::<usize>(ARG_MAX_RECORD_BYTES)
                .copied()
                .unwrap_or(crate::offload::codec::DEFAULT_MAX_RECORD_BYTES),
        })
    }
}
