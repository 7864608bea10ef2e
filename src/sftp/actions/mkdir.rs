//! `sftp.mkdir`: spec §4.4.

use russh_sftp::client::SftpSession;

use crate::error::{classify_sftp_error, GatewayError, Result};

/// Creates `path`. Non-recursive `mkdir` on a path that already exists is
/// `Exists` (spec §4.4); `recursive` mirrors `mkdir -p`, tolerating
/// already-existing parents and leaf.
pub async fn mkdir(sftp: &SftpSession, path: &str, recursive: bool) -> Result<()> {
    if !recursive {
        return match sftp.create_dir(path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if sftp.metadata(path).await.is_ok() {
                    Err(GatewayError::Exists(path.to_string()))
                } else {
                    Err(classify_sftp_error(e, path))
                }
            }
        };
    }

    let mut built = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if path.starts_with('/') && built.is_empty() {
            built.push('/');
        }
        built.push_str(component);
        if sftp.metadata(&built).await.is_err() {
            create_dir_tolerating_existing(sftp, &built).await?;
        }
        built.push('/');
    }
    Ok(())
}

/// Used only on the `recursive` path, where an already-existing parent or
/// leaf directory is expected, not an error.
async fn create_dir_tolerating_existing(sftp: &SftpSession, path: &str) -> Result<()> {
    match sftp.create_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if sftp.metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
                Ok(())
            } else {
                Err(classify_sftp_error(e, path))
            }
        }
    }
}
