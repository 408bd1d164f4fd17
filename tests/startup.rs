//! Spawns the worker binary the way a parent process would.

use auth_offload::offload::codec::{encode_simple, put_eom, put_int, Opcode};
use bytes::BytesMut;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::signal::Signal,
};
use std::{
    io::Write,
    os::{
        fd::{AsRawFd, RawFd},
        unix::{net::UnixStream, process::ExitStatusExt},
    },
    process::{Command, ExitStatus, Stdio},
};

const ENV: [&str; 8] = [
    "AUTH_OFFLOAD_SUBSYSTEM",
    "AUTH_OFFLOAD_SUBSYSTEM_TYPE",
    "AUTH_OFFLOAD_INHERIT_FDS",
    "AUTH_OFFLOAD_LIVENESS_INTERVAL_SECONDS",
    "AUTH_OFFLOAD_SESSION_DEADLINE_SECONDS",
    "AUTH_OFFLOAD_MAX_RECORD_BYTES",
    "AUTH_OFFLOAD_LOG_LEVEL",
    "RUST_LOG",
];

fn worker(args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_auth-offload"));
    for name in ENV {
        command.env_remove(name);
    }
    command
        .args(["--subsystem", "test"])
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

fn inheritable(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map(drop)
}

fn aborted(status: ExitStatus) -> bool {
    status.signal() == Some(Signal::SIGABRT as i32)
}

#[test]
fn aborts_without_control_socket() -> Result<(), Box<dyn std::error::Error>> {
    let status = worker(&[]).status()?;
    assert!(aborted(status), "unexpected status: {status:?}");
    Ok(())
}

#[test]
fn aborts_with_two_control_sockets() -> Result<(), Box<dyn std::error::Error>> {
    let (first, second) = UnixStream::pair()?;
    inheritable(first.as_raw_fd())?;
    inheritable(second.as_raw_fd())?;
    let fds = format!("{},{}", first.as_raw_fd(), second.as_raw_fd());

    let status = worker(&["--inherit-fds", &fds]).status()?;
    assert!(aborted(status), "unexpected status: {status:?}");
    Ok(())
}

#[test]
fn aborts_on_zero_liveness_interval() -> Result<(), Box<dyn std::error::Error>> {
    let (worker_end, _parent) = UnixStream::pair()?;
    inheritable(worker_end.as_raw_fd())?;
    let fd = worker_end.as_raw_fd().to_string();

    let status = worker(&["--inherit-fds", &fd, "--liveness-interval-seconds", "0"]).status()?;
    assert!(aborted(status), "unexpected status: {status:?}");
    Ok(())
}

#[test]
fn stop_exits_zero() -> Result<(), Box<dyn std::error::Error>> {
    let (worker_end, mut parent) = UnixStream::pair()?;
    inheritable(worker_end.as_raw_fd())?;
    let fd = worker_end.as_raw_fd().to_string();

    let mut child = worker(&["--inherit-fds", &fd, "--liveness-interval-seconds", "1"]).spawn()?;
    drop(worker_end);
    parent.write_all(&encode_simple(Opcode::Stop))?;

    let status = child.wait()?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[test]
fn aborts_on_unschedulable_session_deadline() -> Result<(), Box<dyn std::error::Error>> {
    let (worker_end, _parent) = UnixStream::pair()?;
    inheritable(worker_end.as_raw_fd())?;
    let fd = worker_end.as_raw_fd().to_string();
    let too_far = u64::MAX.to_string();

    let status = worker(&["--inherit-fds", &fd, "--session-deadline-seconds", &too_far]).status()?;
    assert!(aborted(status), "unexpected status: {status:?}");
    Ok(())
}

#[test]
fn aborts_on_unknown_opcode() -> Result<(), Box<dyn std::error::Error>> {
    let (worker_end, mut parent) = UnixStream::pair()?;
    inheritable(worker_end.as_raw_fd())?;
    let fd = worker_end.as_raw_fd().to_string();

    let mut child = worker(&["--inherit-fds", &fd, "--liveness-interval-seconds", "30"]).spawn()?;
    drop(worker_end);
    let mut message = BytesMut::new();
    put_int(&mut message, 99);
    put_eom(&mut message);
    parent.write_all(&message)?;

    let status = child.wait()?;
    assert!(aborted(status), "unexpected status: {status:?}");
    Ok(())
}
