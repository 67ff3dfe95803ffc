//! Peer protocol between simulated nodes.
//!
//! Frames are a big-endian `u32` length followed by a CBOR-encoded
//! [`Message`]. Every request has exactly one response, and a peer has at
//! most one request in flight.
//!
//! ```text
//! syncing node                         serving node
//!   |-------- GetTip ------------------>|
//!   |<------- Tip ----------------------|
//!   |-------- GetSnapshotChunk -------->|   (hypersync, per state prefix)
//!   |<------- SnapshotChunk ------------|
//!   |-------- GetHeaders -------------->|   (hypersync, 1..=snapshot)
//!   |<------- Headers ------------------|
//!   |-------- GetBlocks --------------->|   (block sync to tip)
//!   |<------- Blocks -------------------|
//! ```

use anyhow::{bail, Context};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use syncprobe_core::BlockHeight;

use crate::chain::Block;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    GetTip,
    Tip {
        height: BlockHeight,
        snapshot_height: BlockHeight,
    },
    GetHeaders {
        from: BlockHeight,
        to: BlockHeight,
    },
    Headers {
        headers: Vec<(BlockHeight, Bytes)>,
    },
    GetBlocks {
        from: BlockHeight,
        to: BlockHeight,
    },
    Blocks {
        blocks: Vec<Block>,
    },
    GetSnapshotChunk {
        snapshot_height: BlockHeight,
        prefix: Bytes,
        start_after: Option<Bytes>,
    },
    SnapshotChunk {
        snapshot_height: BlockHeight,
        entries: Vec<(Bytes, Bytes)>,
        is_full: bool,
    },
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::GetTip
                | Message::GetHeaders { .. }
                | Message::GetBlocks { .. }
                | Message::GetSnapshotChunk { .. }
        )
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).context("encode message")?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        ciborium::from_reader(bytes).context("decode message")
    }
}

pub async fn write_frame<W>(writer: &mut W, message: &Message) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = message.encode()?;
    if body.len() > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds limit", body.len());
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        bail!("peer sent {} byte frame", len);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Message::decode(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainSpec;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let blocks = ChainSpec::new(3).blocks(4);
        let sent = vec![
            Message::GetTip,
            Message::Blocks {
                blocks: blocks.clone(),
            },
            Message::SnapshotChunk {
                snapshot_height: 10,
                entries: vec![(Bytes::from_static(b"\x01k"), Bytes::from_static(b"v"))],
                is_full: true,
            },
        ];

        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move {
                for message in &sent {
                    write_frame(&mut a, message).await.unwrap();
                }
            })
        };

        for expected in &sent {
            assert_eq!(read_frame(&mut b).await.unwrap().as_ref(), Some(expected));
        }
        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_BYTES + 1) as u32).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn test_request_classification() {
        assert!(Message::GetBlocks { from: 1, to: 2 }.is_request());
        assert!(!Message::Tip {
            height: 1,
            snapshot_height: 0
        }
        .is_request());
    }
}
