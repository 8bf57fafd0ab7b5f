//! Messages exchanged with the compile server and their framing.
//!
//! Every message is `bincode`-encoded (fixed-width little-endian integers)
//! and sent as a frame prefixed by its `u32` little-endian length. Pointer
//! shaped fields only ever appear inside a [`SerializedBlob`], as offsets
//! relative to that blob.

use oopjit_arena::SerializedBlob;
use oopjit_common::{Tier, WorkItemId, WorkItemKind};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::TransportError;

const FRAME_HEADER_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub work_item: WorkItemId,
    pub tier: Tier,
    pub kind: WorkItemKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGenRequest {
    pub thread_context_id: u64,
    pub script_context_id: u64,
    pub header: RequestHeader,
    /// Flattened function snapshot.
    pub blob: SerializedBlob,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGenResponse {
    pub status: u32,
    /// Entry point relative to the code buffer carried in `blob`.
    pub entry_offset: u64,
    pub code_size: u32,
    /// Code, relocation table and deoptimization record.
    pub blob: SerializedBlob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First message on every connection.
    Hello { connection_id: Uuid, client_pid: u32 },
    InitializeThreadContext,
    InitializeScriptContext { thread_context_id: u64 },
    RemoteCodeGen(CodeGenRequest),
    CleanupScriptContext { script_context_id: u64 },
    CleanupThreadContext { thread_context_id: u64 },
    Shutdown,
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::InitializeThreadContext => "InitializeThreadContext",
            Self::InitializeScriptContext { .. } => "InitializeScriptContext",
            Self::RemoteCodeGen(_) => "RemoteCodeGen",
            Self::CleanupScriptContext { .. } => "CleanupScriptContext",
            Self::CleanupThreadContext { .. } => "CleanupThreadContext",
            Self::Shutdown => "Shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    HelloAck { server_pid: u32 },
    ThreadContextInitialized { thread_context_id: u64 },
    ScriptContextInitialized { script_context_id: u64 },
    CodeGen(CodeGenResponse),
    /// Bare status reply; also carries every failure.
    Status { code: u32 },
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T, max_frame_size: u32) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    let too_large = TransportError::FrameTooLarge {
        size: payload.len(),
        limit: max_frame_size,
    };
    let len = u32::try_from(payload.len()).map_err(|_| too_large)?;
    if len > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            limit: max_frame_size,
        });
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. A clean end of stream before a header yields `None`.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_size: u32) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(header);
    let size = usize::try_from(len).unwrap_or(usize::MAX);
    if len > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            size,
            limit: max_frame_size,
        });
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    #[test]
    fn test_frames_are_length_prefixed_little_endian() {
        runtime().block_on(async {
            let mut buffer = Vec::new();
            write_frame(&mut buffer, &ServerMessage::Status { code: 7 }, 1024)
                .await
                .unwrap();

            let len = u32::from_le_bytes(buffer[..4].try_into().unwrap());
            assert_eq!(usize::try_from(len).unwrap(), buffer.len() - 4);

            let mut reader = buffer.as_slice();
            let decoded: Option<ServerMessage> = read_frame(&mut reader, 1024).await.unwrap();
            assert_eq!(decoded, Some(ServerMessage::Status { code: 7 }));
            let end: Option<ServerMessage> = read_frame(&mut reader, 1024).await.unwrap();
            assert_eq!(end, None);
        });
    }

    #[test]
    fn test_oversized_frames_rejected_both_ways() {
        runtime().block_on(async {
            let message = ClientMessage::Hello {
                connection_id: Uuid::new_v4(),
                client_pid: 1,
            };
            let mut buffer = Vec::new();
            let err = write_frame(&mut buffer, &message, 4).await.unwrap_err();
            assert!(matches!(err, TransportError::FrameTooLarge { limit: 4, .. }));

            write_frame(&mut buffer, &message, 1024).await.unwrap();
            let mut reader = buffer.as_slice();
            let err = read_frame::<_, ClientMessage>(&mut reader, 4)
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::FrameTooLarge { .. }));
        });
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        runtime().block_on(async {
            let mut buffer = Vec::new();
            write_frame(&mut buffer, &ClientMessage::Shutdown, 1024)
                .await
                .unwrap();
            // Header promises 9 bytes, only 2 follow
            buffer.extend_from_slice(&9u32.to_le_bytes());
            buffer.extend_from_slice(&[0, 0]);

            let mut reader = buffer.as_slice();
            let first: Option<ClientMessage> = read_frame(&mut reader, 1024).await.unwrap();
            assert_eq!(first, Some(ClientMessage::Shutdown));
            assert!(read_frame::<_, ClientMessage>(&mut reader, 1024).await.is_err());
        });
    }
}
