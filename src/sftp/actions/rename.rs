//! `sftp.rename`: spec §4.4.

use russh_sftp::client::SftpSession;

use crate::error::{classify_sftp_error, GatewayError, Result};

/// `rename` reports `NotFound`/`Exists`/`CrossDevice` (spec §4.4). SFTPv3 has
/// no distinct status code for the latter two — a destination that already
/// exists and a cross-filesystem rename both come back as the same generic
/// `Failure` — so once `classify_sftp_error` rules out `NotFound`/
/// `PermissionDenied`/`Timeout`, the remaining generic case falls back to
/// checking whether `to` already exists (the same check-after-fail idiom
/// `mkdir` uses for its own `Exists` case), and only then to `CrossDevice`
/// as spec §7's "map to the closest wire code" for whatever's left.
pub async fn rename(sftp: &SftpSession, from: &str, to: &str) -> Result<()> {
    if let Err(e) = sftp.rename(from, to).await {
        return Err(match classify_sftp_error(e, from) {
            GatewayError::Sftp(_) => {
                if sftp.metadata(to).await.is_ok() {
                    GatewayError::Exists(to.to_string())
                } else {
                    GatewayError::CrossDevice(from.to_string())
                }
            }
            classified => classified,
        });
    }
    Ok(())
}
