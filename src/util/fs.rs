use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("create directory {}", path.display()))?;
    }
    set_permissions(path, mode)
}

pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let perm = fs::Permissions::from_mode(mode);
        fs::set_permissions(path, perm)
            .with_context(|| format!("set permissions {:o} on {}", mode, path.display()))?;
    }
    Ok(())
}

/// Write `bytes` to a temp file beside `path`, restrict it to `mode`, then
/// rename it into place. Readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;

    #[cfg(unix)]
    {
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .context("set permissions on temp file")?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.write_all(bytes).context("write temp file")?;
    tmp.flush().context("flush temp file")?;
    tmp.persist(path)
        .map_err(|err| anyhow::anyhow!("persist {}: {}", path.display(), err))?;
    Ok(())
}
