//! Control channel I/O over the inherited unix stream socket.
//!
//! All reads go through `recvmsg` so descriptors attached to `TAG_FD` bytes are
//! never dropped; they are queued in arrival order and matched to descriptor
//! items by the codec. Writes of a descriptor item use `sendmsg` with the
//! descriptor attached to the single tag byte.

use bytes::BytesMut;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage as Cmsg, ControlMessageOwned, MsgFlags};
use std::{
    collections::VecDeque,
    io::{self, IoSlice, IoSliceMut},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::trace;

use super::codec::{
    self, ControlMessage, DecodeError, HandleResponse, Opcode, RequestRecord, TAG_FD,
};

/// Bytes read plus the number of descriptors beyond one per `SCM_RIGHTS` message.
struct Chunk {
    bytes: usize,
    surplus_fds: usize,
}

const READ_CHUNK: usize = 8 * 1024;

/// Upper bound of descriptors accepted by one `recvmsg` call.
const MAX_FDS_PER_READ: usize = 8;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel closed by peer")]
    Closed,
    #[error("control channel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ChannelError {
    #[must_use]
    pub fn is_desync(&self) -> bool {
        matches!(self, ChannelError::Decode(err) if err.is_desync())
    }
}

pub struct ControlChannel {
    io: AsyncFd<UnixStream>,
    inbound: BytesMut,
    descriptors: VecDeque<OwnedFd>,
    max_record_bytes: usize,
}

impl ControlChannel {
    /// Register the stream with the runtime.
    /// # Errors
    /// Returns an error if the socket cannot be made non-blocking or registered.
    pub fn new(stream: UnixStream, max_record_bytes: usize) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            io: AsyncFd::new(stream)?,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            descriptors: VecDeque::new(),
            max_record_bytes,
        })
    }

    /// Wait for the next complete parent-to-worker message.
    ///
    /// Cancel safe: bytes and descriptors read so far stay buffered.
    /// # Errors
    /// Returns an error if the channel breaks or the stream cannot be decoded.
    pub async fn next_message(&mut self) -> Result<ControlMessage, ChannelError> {
        loop {
            if let Some(message) = codec::try_decode_control(
                &mut self.inbound,
                &mut self.descriptors,
                self.max_record_bytes,
            )? {
                return Ok(message);
            }
            self.fill().await?;
        }
    }

    /// Parent side: wait for the next complete `HANDLE` response.
    /// # Errors
    /// Returns an error if the channel breaks or the stream cannot be decoded.
    pub async fn next_response(&mut self) -> Result<HandleResponse, ChannelError> {
        loop {
            if let Some(response) = codec::try_decode_response(
                &mut self.inbound,
                &mut self.descriptors,
                self.max_record_bytes,
            )? {
                return Ok(response);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), ChannelError> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = Vec::new();
        loop {
            let mut guard = self.io.readable().await?;
            match guard.try_io(|inner| recv_chunk(inner.as_raw_fd(), &mut chunk, &mut received)) {
                Ok(result) => {
                    let Chunk { bytes: read, surplus_fds } = result?;
                    if surplus_fds > 0 {
                        // no way to tell which one belongs to the item
                        received.clear();
                        return Err(DecodeError::SurplusDescriptors { extra: surplus_fds }.into());
                    }
                    self.descriptors.extend(received.drain(..));
                    if read == 0 {
                        return Err(ChannelError::Closed);
                    }
                    trace!(bytes = read, fds = self.descriptors.len(), "control channel read");
                    self.inbound.extend_from_slice(&chunk[..read]);
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Write raw encoded items.
    /// # Errors
    /// Returns an error if the channel breaks before every byte is written.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let mut written = 0;
        while written < bytes.len() {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| send_chunk(inner.as_raw_fd(), &bytes[written..], None)) {
                Ok(result) => {
                    let sent = result?;
                    if sent == 0 {
                        return Err(ChannelError::Closed);
                    }
                    written += sent;
                }
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Write a descriptor item, transferring `fd` to the other end.
    /// # Errors
    /// Returns an error if the descriptor cannot be sent.
    pub async fn send_descriptor(&self, fd: &impl AsRawFd) -> Result<(), ChannelError> {
        let tag = [TAG_FD];
        loop {
            let mut guard = self.io.writable().await?;
            match guard.try_io(|inner| send_chunk(inner.as_raw_fd(), &tag, Some(fd.as_raw_fd()))) {
                Ok(result) => {
                    if result? == 0 {
                        return Err(ChannelError::Closed);
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Parent side: send `ALIVE` or `STOP`.
    /// # Errors
    /// Returns an error if the channel breaks.
    pub async fn send_simple(&self, opcode: Opcode) -> Result<(), ChannelError> {
        self.send(&codec::encode_simple(opcode)).await
    }

    /// Parent side: send a `HANDLE` request with the peer descriptor.
    /// # Errors
    /// Returns an error if the record cannot be encoded or the channel breaks.
    pub async fn send_request(
        &self,
        request: &RequestRecord,
        peer: &impl AsRawFd,
    ) -> Result<(), ChannelError> {
        let mut head = BytesMut::new();
        codec::put_int(&mut head, Opcode::Handle as i64);
        codec::put_record(&mut head, request)?;
        self.send(&head).await?;
        self.send_descriptor(peer).await?;
        let mut tail = BytesMut::new();
        codec::put_eom(&mut tail);
        self.send(&tail).await
    }
}

fn recv_chunk(fd: RawFd, chunk: &mut [u8], received: &mut Vec<OwnedFd>) -> io::Result<Chunk> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS_PER_READ]);
    let mut iov = [IoSliceMut::new(chunk)];
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::MSG_DONTWAIT)?;
    // the kernel closed whatever did not fit
    let mut surplus_fds = usize::from(msg.flags.contains(MsgFlags::MSG_CTRUNC));
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            surplus_fds += fds.len().saturating_sub(1);
            for raw in fds {
                // SAFETY: the kernel installed `raw` as a fresh descriptor for
                // this process during recvmsg; nothing else owns it.
                received.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Ok(Chunk {
        bytes: msg.bytes,
        surplus_fds,
    })
}

fn send_chunk(fd: RawFd, bytes: &[u8], descriptor: Option<RawFd>) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let sent = match descriptor {
        Some(raw) => {
            let fds = [raw];
            sendmsg::<()>(
                fd,
                &iov,
                &[Cmsg::ScmRights(&fds)],
                MsgFlags::MSG_DONTWAIT,
                None,
            )?
        }
        None => sendmsg::<()>(fd, &iov, &[], MsgFlags::MSG_DONTWAIT, None)?,
    };
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn pair() -> io::Result<(ControlChannel, ControlChannel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((
            ControlChannel::new(a, codec::DEFAULT_MAX_RECORD_BYTES)?,
            ControlChannel::new(b, codec::DEFAULT_MAX_RECORD_BYTES)?,
        ))
    }

    #[tokio::test]
    async fn simple_messages_cross_the_channel() -> Result<(), Box<dyn std::error::Error>> {
        let (parent, mut worker) = pair()?;
        parent.send_simple(Opcode::Alive).await?;
        parent.send_simple(Opcode::Stop).await?;

        assert!(matches!(worker.next_message().await?, ControlMessage::Alive));
        assert!(matches!(worker.next_message().await?, ControlMessage::Stop));
        Ok(())
    }

    #[tokio::test]
    async fn request_descriptor_is_usable() -> Result<(), Box<dyn std::error::Error>> {
        let (parent, mut worker) = pair()?;
        let (mut client, server) = UnixStream::pair()?;
        let request = RequestRecord {
            id: 9,
            auth_methods: "CLAIMTOBE".to_string(),
            auth_timeout: 5,
            key_info_protocol: None,
            key_info_data: None,
            error_stack: Vec::new(),
        };

        parent.send_request(&request, &server).await?;
        drop(server);

        let ControlMessage::Handle {
            request: got,
            descriptor,
        } = worker.next_message().await?
        else {
            panic!("expected HANDLE");
        };
        assert_eq!(got.id, 9);

        let mut received = UnixStream::from(descriptor);
        received.write_all(b"ping")?;
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf)?;
        assert_eq!(&buf, b"ping");
        Ok(())
    }

    #[tokio::test]
    async fn closed_peer_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let (parent, mut worker) = pair()?;
        drop(parent);
        let err = worker.next_message().await.expect_err("closed");
        assert!(matches!(err, ChannelError::Closed));
        assert!(!err.is_desync());
        Ok(())
    }

    #[tokio::test]
    async fn bundled_descriptors_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let (parent, mut worker) = pair()?;
        let (first, second) = UnixStream::pair()?;
        let fds = [first.as_raw_fd(), second.as_raw_fd()];
        sendmsg::<()>(
            parent.io.get_ref().as_raw_fd(),
            &[IoSlice::new(&[TAG_FD])],
            &[Cmsg::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )?;

        let err = worker.next_message().await.expect_err("bundled descriptors");
        assert!(matches!(
            err,
            ChannelError::Decode(DecodeError::SurplusDescriptors { extra: 1 })
        ));
        assert!(!err.is_desync());
        assert!(worker.descriptors.is_empty());
        Ok(())
    }
}
