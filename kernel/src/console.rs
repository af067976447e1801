//! The console device behind fds 0 and 1.

/// Keyboard input and terminal output.
///
/// fd 0 reads from it, fd 1 writes to it, and the kernel prints the
/// `name: exit(status)` line through it when a process terminates.
pub trait Console: Send + Sync {
    fn write(&self, bytes: &[u8]);

    /// Reads up to `buf.len()` bytes; returns the number read.
    fn read(&self, buf: &mut [u8]) -> usize;
}

/// A console wired to nothing.
pub struct NullConsole;

impl Console for NullConsole {
    fn write(&self, _bytes: &[u8]) {}

    fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }
}
