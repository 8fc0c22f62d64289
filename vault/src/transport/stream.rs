//! Bulk file streaming for transfers above the inline ceiling.
//!
//! Large files never travel as one `write_object` payload. The sender
//! walks each file in bounded chunks and emits one-way `file_chunk`
//! frames carrying the target path, the offset and an EOF flag; the
//! receiver reassembles them at the marked offsets.

use super::client::EncryptedSocketClientTransport;
use super::TransportError;
use crate::rpc::jsonrpc::{serialize_request, Request};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

pub const FILE_CHUNK_METHOD: &str = "file_chunk";

/// Raw bytes carried per frame. Hex encoding doubles this on the wire.
pub const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("error reading local file: {0}")]
    Local(#[from] io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FileChunk {
    pub path: String,
    pub offset: u64,
    pub eof: bool,
    pub data: String,
}

/// Send each `(local, remote)` pair over the transport in `file_chunk`
/// frames. The final frame of every file carries `eof` with the file's
/// total length as offset, letting the receiver clip stale bytes.
pub async fn stream_files(
    transport: &mut EncryptedSocketClientTransport,
    pairs: &[(PathBuf, PathBuf)],
) -> Result<(), StreamError> {
    for (local, remote) in pairs {
        info!(local = %local.display(), remote = %remote.display(), "streaming file");
        let mut file = tokio::fs::File::open(local).await?;
        let mut offset = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            let chunk = FileChunk {
                path: remote.display().to_string(),
                offset,
                eof: false,
                data: hex::encode(&buf[..read]),
            };
            send_chunk(transport, &chunk).await?;
            offset += read as u64;
        }

        let eof = FileChunk {
            path: remote.display().to_string(),
            offset,
            eof: true,
            data: String::new(),
        };
        send_chunk(transport, &eof).await?;
        debug!(remote = %remote.display(), bytes = offset, "stream complete");
    }
    Ok(())
}

async fn send_chunk(
    transport: &mut EncryptedSocketClientTransport,
    chunk: &FileChunk,
) -> Result<(), TransportError> {
    let params = serde_json::to_value(chunk).expect("chunk serializes");
    let frame = serialize_request(&Request::notification(FILE_CHUNK_METHOD, params));
    transport.send_frame(&frame).await
}

/// Receiver side: land one chunk on disk. Relative paths resolve against
/// `base`; the first chunk truncates, the EOF chunk clips the file to its
/// final length.
pub async fn apply_chunk(base: &Path, chunk: &FileChunk) -> io::Result<()> {
    let path = PathBuf::from(&chunk.path);
    let path = if path.is_absolute() {
        path
    } else {
        base.join(path)
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(chunk.offset == 0 && !chunk.eof)
        .open(&path)
        .await?;

    if chunk.eof {
        file.set_len(chunk.offset).await?;
        return Ok(());
    }

    let data = hex::decode(&chunk.data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    file.seek(io::SeekFrom::Start(chunk.offset)).await?;
    file.write_all(&data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn chunks_for(content: &[u8], chunk_size: usize, remote: &str) -> Vec<FileChunk> {
        let mut chunks = Vec::new();
        let mut offset = 0u64;
        for piece in content.chunks(chunk_size) {
            chunks.push(FileChunk {
                path: remote.to_string(),
                offset,
                eof: false,
                data: hex::encode(piece),
            });
            offset += piece.len() as u64;
        }
        chunks.push(FileChunk {
            path: remote.to_string(),
            offset,
            eof: true,
            data: String::new(),
        });
        chunks
    }

    #[tokio::test]
    async fn test_chunks_reassemble_byte_for_byte() {
        let tempdir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();

        for chunk in chunks_for(&content, 1337, "nested/out.bin").await {
            apply_chunk(tempdir.path(), &chunk).await.unwrap();
        }

        let written = std::fs::read(tempdir.path().join("nested/out.bin")).unwrap();
        assert_eq!(written, content);
    }

    #[tokio::test]
    async fn test_restream_clips_stale_tail() {
        let tempdir = tempfile::tempdir().unwrap();

        for chunk in chunks_for(&vec![0xAA; 4096], 1024, "out.bin").await {
            apply_chunk(tempdir.path(), &chunk).await.unwrap();
        }
        for chunk in chunks_for(&vec![0xBB; 100], 1024, "out.bin").await {
            apply_chunk(tempdir.path(), &chunk).await.unwrap();
        }

        let written = std::fs::read(tempdir.path().join("out.bin")).unwrap();
        assert_eq!(written, vec![0xBB; 100]);
    }

    #[test]
    fn test_chunk_round_trips_as_json() {
        let chunk = FileChunk {
            path: "/app/big.iso".to_string(),
            offset: 4096,
            eof: false,
            data: "deadbeef".to_string(),
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(serde_json::from_value::<FileChunk>(value).unwrap(), chunk);
    }
}
