use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Platform data directory, e.g. `~/.local/share/gatehouse` on Linux.
pub fn data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("rs", "gatehouse", "gatehouse")
        .context("could not determine a home directory")?;
    let dir = dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir).context("create data dir")?;
    Ok(dir)
}

/// Uses `explicit` when given (creating it), else the platform default.
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.to_path_buf())
        }
        None => data_dir(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b");
        let got = resolve_data_dir(Some(&nested)).unwrap();
        assert_eq!(got, nested);
        assert!(nested.is_dir());
    }
}
