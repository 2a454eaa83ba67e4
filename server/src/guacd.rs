use crate::error::BrokerError;
use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use sandgate_common::protocol::{Instruction, WireError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const READ_CHUNK: usize = 8 * 1024;

/// Buffered instruction reader over the gateway byte stream.
///
/// Reads may return short from the socket but an instruction is only handed
/// out whole. A single logical reader owns this; there is no internal
/// locking.
pub struct InstructionReader<R> {
    inner: R,
    buf: BytesMut,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> InstructionReader<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            timeout,
        }
    }

    /// Reads exactly one instruction, waiting at most the socket timeout
    /// for each chunk from the transport.
    pub async fn read_instruction(&mut self) -> Result<Instruction, WireError> {
        loop {
            if let Some((instruction, consumed)) = Instruction::decode(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(instruction);
            }

            let n = tokio::time::timeout(self.timeout, self.inner.read_buf(&mut self.buf))
                .await
                .map_err(|_| WireError::ShortRead)??;
            if n == 0 {
                return Err(WireError::Closed);
            }
        }
    }

    /// Hands out whatever sits in the buffer beyond the last decoded
    /// instruction. The opaque-forwarding phase flushes this before it
    /// starts copying raw bytes.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Instruction writer; encodes and flushes a full instruction atomically.
pub struct InstructionWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> InstructionWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_instruction(&mut self, instruction: &Instruction) -> Result<(), WireError> {
        self.inner.write_all(&instruction.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Dials the gateway under the dial deadline and wraps the two stream
/// halves in the framer.
pub async fn dial(
    addr: &str,
    dial_timeout: Duration,
    socket_timeout: Duration,
) -> Result<(InstructionReader<OwnedReadHalf>, InstructionWriter<OwnedWriteHalf>), BrokerError> {
    debug!("dialing gateway at {addr}");

    let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BrokerError::Timeout(format!("dialing gateway at {addr}")))?
        .map_err(|err| BrokerError::GatewayUnreachable(err.to_string()))?;

    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    Ok((
        InstructionReader::new(read_half, socket_timeout),
        InstructionWriter::new(write_half),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn instr(elements: &[&str]) -> Instruction {
        Instruction::new(elements.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn reads_instruction_split_across_writes() {
        let (client, server) = duplex(64);
        let mut reader = InstructionReader::new(server, Duration::from_secs(5));

        let encoded = instr(&["size", "1024", "768", "96"]).encode();
        let (front, back) = encoded.split_at(5);
        let front = front.to_vec();
        let back = back.to_vec();

        let mut client = client;
        client.write_all(&front).await.unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(&back).await.unwrap();
            client
        });

        let decoded = reader.read_instruction().await.unwrap();
        assert_eq!(decoded.opcode(), "size");
        assert_eq!(decoded.args(), &["1024", "768", "96"]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reads_back_to_back_instructions() {
        let (mut client, server) = duplex(256);
        let mut reader = InstructionReader::new(server, Duration::from_secs(5));

        let mut bytes = instr(&["select", "rdp"]).encode();
        bytes.extend(instr(&["video"]).encode());
        client.write_all(&bytes).await.unwrap();

        assert_eq!(reader.read_instruction().await.unwrap().opcode(), "select");
        assert_eq!(reader.read_instruction().await.unwrap().opcode(), "video");
    }

    #[tokio::test]
    async fn idle_transport_times_out_as_short_read() {
        let (_client, server) = duplex(64);
        let mut reader = InstructionReader::new(server, Duration::from_millis(30));

        match reader.read_instruction().await {
            Err(WireError::ShortRead) => {}
            other => panic!("expected ShortRead, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_transport_reports_closed() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = InstructionReader::new(server, Duration::from_secs(1));

        match reader.read_instruction().await {
            Err(WireError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn take_buffered_returns_undecoded_tail() {
        let (mut client, server) = duplex(256);
        let mut reader = InstructionReader::new(server, Duration::from_secs(5));

        let mut bytes = instr(&["ready", "$1"]).encode();
        bytes.extend_from_slice(b"4.sync,8.12345678;");
        client.write_all(&bytes).await.unwrap();

        let ready = reader.read_instruction().await.unwrap();
        assert_eq!(ready.opcode(), "ready");

        let tail = reader.take_buffered();
        assert_eq!(&tail[..], b"4.sync,8.12345678;");
    }

    #[tokio::test]
    async fn writer_round_trips_through_reader() {
        let (client, server) = duplex(256);
        let mut writer = InstructionWriter::new(client);
        let mut reader = InstructionReader::new(server, Duration::from_secs(5));

        let sent = instr(&["audio", "audio/L16"]);
        writer.write_instruction(&sent).await.unwrap();

        let received = reader.read_instruction().await.unwrap();
        assert_eq!(received, sent);
    }
}
