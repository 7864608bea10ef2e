//! `sftp.list`: spec §4.4. The teacher's `list_dir.rs` returns entries in
//! whatever order the server's readdir gives back; the browser file tree
//! needs directories sorted before files, so we sort on our side.

use russh_sftp::client::SftpSession;

use crate::error::{classify_sftp_error, Result};
use crate::protocol::text::SftpEntry;

pub async fn list(sftp: &SftpSession, path: &str) -> Result<Vec<SftpEntry>> {
    let mut entries = Vec::new();
    for entry in sftp.read_dir(path).await.map_err(|e| classify_sftp_error(e, path))? {
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        let attrs = entry.metadata();
        let file_type = entry.file_type();
        entries.push(SftpEntry {
            name,
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.unwrap_or(0),
            mtime: attrs.mtime.unwrap_or(0) as i64,
            is_dir: file_type.is_dir(),
            is_symlink: file_type.is_symlink(),
            target: None,
        });
    }
    sort_entries(&mut entries);
    Ok(entries)
}

fn sort_entries(entries: &mut [SftpEntry]) {
    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_dir: bool) -> SftpEntry {
        SftpEntry {
            name: name.to_string(),
            size: 0,
            mode: 0,
            mtime: 0,
            is_dir,
            is_symlink: false,
            target: None,
        }
    }

    #[test]
    fn directories_sort_before_files_then_alphabetically() {
        let mut entries = vec![entry("zeta.txt", false), entry("omega", true), entry("alpha", true), entry("beta.txt", false)];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "omega", "beta.txt", "zeta.txt"]);
    }

    #[test]
    fn empty_listing_sorts_to_empty() {
        let mut entries: Vec<SftpEntry> = vec![];
        sort_entries(&mut entries);
        assert!(entries.is_empty());
    }
}
