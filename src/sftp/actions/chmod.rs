//! `sftp.chmod`: spec §4.4. Fetches current attributes, overwrites the
//! permission bits, and writes them back — the SSH_FXP_SETSTAT pattern the
//! original codebase uses for its one analogous case (marking an uploaded
//! binary executable).

use russh_sftp::client::SftpSession;

use crate::error::{classify_sftp_error, Result};

pub async fn chmod(sftp: &SftpSession, path: &str, mode: u32) -> Result<()> {
    let mut attrs = sftp.metadata(path).await.map_err(|e| classify_sftp_error(e, path))?;
    attrs.permissions = Some(mode);
    sftp.set_metadata(path, attrs).await.map_err(|e| classify_sftp_error(e, path))?;
    Ok(())
}
