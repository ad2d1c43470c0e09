#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("DS: {0}")]
    Ds(#[from] DsError),
    #[error("FS: {0}")]
    Fs(#[from] FsError),
    #[error("usage: {0}")]
    Usage(String),
}

#[derive(thiserror::Error, Debug)]
pub enum DsError {
    #[error("unknown image format")]
    UnknownImageFormat,
}

#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not a FAT32 volume")]
    NotFat32,
    #[error("unknown path")]
    UnknownPath,
    #[error("not found")]
    NotFound,
    #[error("create failed")]
    CreateFailed,
    #[error("inconsistent on-disk structure")]
    Inconsistent,
}

pub type Result<T> = std::result::Result<T, Error>;
