//! `sftp.upload`: spec §4.4. Chunks arrive ACK-paced (the caller advertises
//! `chunkSize`/`window` via `sftp.upload-ready` and only sends the next
//! batch once it sees the matching `sftp.upload-ack`). Writes go to a
//! `.part` sibling and are renamed into place on the last chunk, the same
//! temp-then-rename shape the teacher's upload action uses.

use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;

use crate::error::{classify_sftp_error, GatewayError, Result};

pub struct Upload {
    file: File,
    temp_path: String,
    final_path: String,
    next_seq: u32,
}

impl Upload {
    pub async fn open(sftp: &SftpSession, path: &str) -> Result<Self> {
        let temp_path = format!("{path}.part");
        let file = sftp
            .open_with_flags(&temp_path, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE)
            .await
            .map_err(|e| classify_sftp_error(e, &temp_path))?;
        Ok(Self { file, temp_path, final_path: path.to_string(), next_seq: 0 })
    }

    /// Rejects a chunk that arrives out of sequence rather than silently
    /// reordering it; the client's ACK pacing means this should never
    /// legitimately happen.
    pub async fn write_chunk(&mut self, seq: u32, data: &[u8]) -> Result<()> {
        if seq != self.next_seq {
            return Err(GatewayError::Protocol(format!(
                "out-of-order upload chunk: expected seq {}, got {seq}",
                self.next_seq
            )));
        }
        self.file.write_all(data).await?;
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(())
    }

    pub async fn finish(mut self, sftp: &SftpSession) -> Result<()> {
        self.file.shutdown().await?;
        drop(self.file);
        sftp.rename(&self.temp_path, &self.final_path).await.map_err(|e| classify_sftp_error(e, &self.final_path))?;
        Ok(())
    }

    /// Best-effort cleanup on cancel or error; the partial file is orphaned
    /// under `.part` if this itself fails, which is fine since a later
    /// upload to the same path overwrites it.
    pub async fn abort(self, sftp: &SftpSession) {
        drop(self.file);
        let _ = sftp.remove_file(&self.temp_path).await;
    }
}
