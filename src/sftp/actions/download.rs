//! `sftp.download`: spec §4.4. Chunks are read by seeking to an explicit
//! offset rather than relying on the handle's internal read cursor — the
//! agent crate's variant of this action does the same, which tolerates a
//! retransmitted or skipped chunk index without desynchronizing the file
//! position (unlike the daemon's sequential-read variant).

use std::io::SeekFrom;

use bytes::Bytes;
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{classify_sftp_error, Result};

pub struct Download {
    file: File,
    pub total_size: u64,
}

impl Download {
    pub async fn open(sftp: &SftpSession, path: &str) -> Result<Self> {
        let metadata = sftp.metadata(path).await.map_err(|e| classify_sftp_error(e, path))?;
        let file = sftp.open(path).await.map_err(|e| classify_sftp_error(e, path))?;
        Ok(Self { file, total_size: metadata.size.unwrap_or(0) })
    }

    /// Reads one chunk at `chunk_index * chunk_size`. Returns `None` once
    /// the offset is at or past the file's end.
    pub async fn read_chunk(&mut self, chunk_index: u32, chunk_size: u32) -> Result<Option<Bytes>> {
        let offset = chunk_index as u64 * chunk_size as u64;
        if offset >= self.total_size {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; chunk_size as usize];
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(Bytes::from(buf)))
    }
}
