//! Local terminal plumbing: bounded-wait input, window size and raw mode.

use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use uberterm_protocol::WindowSize;

/// A local byte source the input loop can poll with a timeout.
pub trait InputSource: Send {
    /// Wait at most `timeout` for input.
    ///
    /// Returns `Ok(None)` if nothing arrived in time and `Ok(Some(0))` at end
    /// of input.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration)
    -> std::io::Result<Option<usize>>;
}

/// Input from any readable file descriptor (stdin, a pipe, a pty).
pub struct FdInput<F> {
    file: F,
}

impl<F> FdInput<F> {
    pub fn new(file: F) -> Self {
        Self { file }
    }
}

impl FdInput<std::fs::File> {
    /// A private duplicate of stdin, read without std's buffering so polling
    /// the descriptor tells the whole story.
    pub fn stdin() -> std::io::Result<Self> {
        let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::new(std::fs::File::from(fd)))
    }
}

impl<F> InputSource for FdInput<F>
where
    F: AsFd + std::io::Read + Send,
{
    fn read_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::io::Result<Option<usize>> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let ready = {
            let mut fds = [nix::poll::PollFd::new(
                self.file.as_fd(),
                nix::poll::PollFlags::POLLIN,
            )];
            match nix::poll::poll(&mut fds, nix::poll::PollTimeout::from(millis)) {
                Ok(n) => n > 0,
                Err(nix::errno::Errno::EINTR) => false,
                Err(e) => return Err(e.into()),
            }
        };
        if !ready {
            return Ok(None);
        }
        self.file.read(buf).map(Some)
    }
}

/// Query the controlling terminal's size.
pub fn window_size() -> std::io::Result<WindowSize> {
    let (cols, rows) = crossterm::terminal::size()?;
    Ok(WindowSize { rows, cols })
}

/// Puts a terminal into raw mode and restores the original attributes on drop.
#[derive(Debug)]
pub struct RawModeGuard<'fd> {
    fd: BorrowedFd<'fd>,
    original: nix::sys::termios::Termios,
}

impl<'fd> RawModeGuard<'fd> {
    /// Fails if `fd` is not a terminal.
    pub fn enter(fd: BorrowedFd<'fd>) -> nix::Result<Self> {
        let original = nix::sys::termios::tcgetattr(fd)?;
        let mut raw = original.clone();
        nix::sys::termios::cfmakeraw(&mut raw);
        nix::sys::termios::tcsetattr(fd, nix::sys::termios::SetArg::TCSANOW, &raw)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        let _ = nix::sys::termios::tcsetattr(
            self.fd,
            nix::sys::termios::SetArg::TCSANOW,
            &self.original,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn pipe() -> (FdInput<std::fs::File>, std::fs::File) {
        let (read, write) = nix::unistd::pipe().unwrap();
        (
            FdInput::new(std::fs::File::from(read)),
            std::fs::File::from(write),
        )
    }

    #[test]
    fn test_timeout_without_input() {
        let (mut input, _writer) = pipe();
        let mut buf = [0u8; 16];
        let started = std::time::Instant::now();
        let result = input
            .read_timeout(&mut buf, Duration::from_millis(20))
            .unwrap();
        assert_eq!(result, None);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_reads_available_bytes() {
        let (mut input, mut writer) = pipe();
        writer.write_all(b"ls\r").unwrap();
        let mut buf = [0u8; 16];
        let n = input
            .read_timeout(&mut buf, Duration::from_millis(100))
            .unwrap();
        assert_eq!(n, Some(3));
        assert_eq!(&buf[..3], b"ls\r");
    }

    #[test]
    fn test_end_of_input() {
        let (mut input, writer) = pipe();
        drop(writer);
        let mut buf = [0u8; 16];
        let n = input
            .read_timeout(&mut buf, Duration::from_millis(100))
            .unwrap();
        assert_eq!(n, Some(0));
    }

    #[test]
    fn test_raw_mode_requires_terminal() {
        let (read, _write) = nix::unistd::pipe().unwrap();
        assert!(RawModeGuard::enter(read.as_fd()).is_err());
    }
}
