//! `sftp.delete`: spec §4.4. Files are removed directly; directories require
//! `recursive` and are walked iteratively so child entries are removed
//! before their parent (`rmdir` rejects non-empty directories).

use russh_sftp::client::SftpSession;

use crate::error::{classify_sftp_error, GatewayError, Result};

pub async fn delete(sftp: &SftpSession, path: &str, recursive: bool) -> Result<()> {
    let attrs = sftp.metadata(path).await.map_err(|e| classify_sftp_error(e, path))?;
    if !attrs.is_dir() {
        sftp.remove_file(path).await.map_err(|e| classify_sftp_error(e, path))?;
        return Ok(());
    }

    if !recursive {
        // An empty directory removes cleanly; only a non-empty one without
        // `recursive` fails (spec §4.4 `delete`). SFTPv3 has no status code
        // dedicated to "not empty", so a failure that doesn't classify as
        // something more specific (not found, permission denied) is assumed
        // to mean that.
        return remove_dir(sftp, path).await;
    }

    let mut dirs_to_remove = vec![path.to_string()];
    let mut stack = vec![path.to_string()];
    while let Some(dir) = stack.pop() {
        for entry in sftp.read_dir(&dir).await.map_err(|e| classify_sftp_error(e, &dir))? {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child = format!("{}/{}", dir.trim_end_matches('/'), name);
            if entry.file_type().is_dir() {
                stack.push(child.clone());
                dirs_to_remove.push(child);
            } else {
                sftp.remove_file(&child).await.map_err(|e| classify_sftp_error(e, &child))?;
            }
        }
    }

    for dir in dirs_to_remove.into_iter().rev() {
        remove_dir(sftp, &dir).await?;
    }
    Ok(())
}

async fn remove_dir(sftp: &SftpSession, path: &str) -> Result<()> {
    sftp.remove_dir(path).await.map_err(|e| match classify_sftp_error(e, path) {
        GatewayError::Sftp(_) => GatewayError::NotEmpty(path.to_string()),
        classified => classified,
    })
}
