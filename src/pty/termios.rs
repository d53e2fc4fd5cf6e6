//! Termios configuration for the PTY master, matching the behavior of a
//! modern node-pty-style default: canonical line discipline on, echo
//! disabled on the master (the slave side echoes to the child's view),
//! standard control characters.

use std::os::fd::BorrowedFd;

use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SpecialCharacterIndices as CC};

use crate::error::{Error, Result};

/// Applies the session-runtime's default termios settings to `fd`.
///
/// # Errors
///
/// Returns [`Error::PTYConfigFailed`] if the terminal attributes cannot be
/// read or written.
pub fn configure(fd: BorrowedFd<'_>) -> Result<()> {
    let mut attrs = termios::tcgetattr(fd).map_err(|source| Error::PTYConfigFailed {
        session_id: None,
        source: Box::new(source),
    })?;

    attrs.input_flags.insert(InputFlags::ICRNL);
    attrs.output_flags.insert(OutputFlags::OPOST | OutputFlags::ONLCR);
    attrs
        .local_flags
        .insert(LocalFlags::ISIG | LocalFlags::ICANON | LocalFlags::IEXTEN);
    attrs.local_flags.remove(LocalFlags::ECHO);
    attrs.control_flags.remove(ControlFlags::CSIZE);
    attrs.control_flags.insert(ControlFlags::CS8);

    attrs.control_chars[CC::VINTR as usize] = 3; // ^C
    attrs.control_chars[CC::VQUIT as usize] = 28; // ^\
    attrs.control_chars[CC::VERASE as usize] = 127; // DEL
    attrs.control_chars[CC::VKILL as usize] = 21; // ^U
    attrs.control_chars[CC::VSUSP as usize] = 26; // ^Z
    attrs.control_chars[CC::VEOF as usize] = 4; // ^D
    attrs.control_chars[CC::VMIN as usize] = 1;
    attrs.control_chars[CC::VTIME as usize] = 0;

    termios::tcsetattr(fd, termios::SetArg::TCSANOW, &attrs).map_err(|source| {
        Error::PTYConfigFailed {
            session_id: None,
            source: Box::new(source),
        }
    })
}
