//! FIFO creation for the `stdin`, `control`, and `notification-stream`
//! files under a session directory.

use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::error::{Error, Result};

/// Creates a FIFO at `path` with mode 0600, if one doesn't already exist.
///
/// # Errors
///
/// Returns [`Error::SessionStartFailed`] if the FIFO cannot be created for
/// any reason other than it already existing.
pub fn create(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(source) => Err(Error::SessionStartFailed {
            session_id: None,
            source: Box::new(source),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_a_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdin");
        create(&path).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(
            std::os::unix::fs::FileTypeExt::is_fifo(&meta.file_type()),
            "expected a fifo"
        );
    }

    #[test]
    fn creating_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        create(&path).unwrap();
        create(&path).unwrap();
    }
}
