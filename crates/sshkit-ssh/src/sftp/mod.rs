pub mod dir;
pub mod file;
pub(crate) mod libssh2;
pub mod subsystem;

pub use dir::SftpDir;
pub use file::SftpFile;
pub use subsystem::Sftp;
