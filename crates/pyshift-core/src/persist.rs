//! 原子写回：同目录临时文件 → fsync → rename
//!
//! 任一步失败时临时文件随 `NamedTempFile` 的 drop 被删除，原文件保持不变。
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let perms = fs::metadata(path).map(|m| m.permissions()).ok();

    let mut tmp = tempfile::Builder::new().prefix(".pyshift-").suffix(".tmp").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    if let Some(perms) = perms {
        tmp.as_file().set_permissions(perms)?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
