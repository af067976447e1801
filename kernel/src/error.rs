//! Kernel error type.

/// Everything a fallible kernel operation can report.
///
/// System-call return codes are derived from these at the dispatch
/// boundary; inside the kernel they travel as `Result` with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("out of disk sectors")]
    NoFreeSectors,
    #[error("maximum file size exceeded")]
    FileTooLarge,
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    AlreadyExists,
    #[error("invalid file name")]
    InvalidName,
    #[error("name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("bad file descriptor {0}")]
    BadFileDescriptor(usize),
    #[error("descriptor table full")]
    TooManyOpenFiles,
    #[error("invalid user pointer {0:#x}")]
    BadUserPointer(usize),
    #[error("invalid executable")]
    InvalidExecutable,
    #[error("argument list too long")]
    ArgumentListTooLong,
    #[error("exec failed")]
    ExecFailed,
    #[error("no such child process")]
    NoSuchChild,
    #[error("unknown system call {0}")]
    UnknownSyscall(u32),
}
