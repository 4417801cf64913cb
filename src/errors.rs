use thiserror::Error;

/// Unified error type for all tallykv operations.
///
/// Variants fall into five groups: filesystem failures, corrupted on-disk
/// state, missing keys or indexes, caller contract violations, and resource
/// exhaustion. Underlying `std::io::Error`s are logged at the failure site
/// and mapped to unit variants so errors stay comparable in tests.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum Errors {
  // filesystem failures
  #[error("failed to open database file")]
  FailedToOpenFile,

  #[error("failed to read from database file")]
  FailedToReadFile,

  #[error("failed to write to database file")]
  FailedToWriteFile,

  #[error("failed to sync database file")]
  FailedToSyncFile,

  #[error("failed to create database directory")]
  FailedToCreateDatabaseDir,

  #[error("failed to copy database directory")]
  FailedToCopyDirectory,

  #[error("read past end of database file")]
  ReadPastEof,

  // corrupted on-disk state
  #[error("write-ahead log record checksum mismatch")]
  InvalidWalRecordCrc,

  #[error("write-ahead log is corrupted")]
  CorruptedWal,

  #[error("index node is corrupted")]
  CorruptedNode,

  #[error("deletion index is corrupted")]
  CorruptedDeletionIndex,

  // missing keys or indexes
  #[error("key not found in database")]
  KeyNotFound,

  #[error("index is not loaded")]
  IndexNotLoaded,

  // caller contract violations
  #[error("key size must not be zero")]
  KeyIsEmpty,

  #[error("key length does not match the index key size")]
  KeyWrongSize,

  #[error("subsection write has no base value")]
  SubsectionWithoutBase,

  #[error("index id is already loaded")]
  IndexAlreadyLoaded,

  #[error("value does not fit in a data file")]
  ValueTooLarge,

  #[error("database directory path is empty")]
  DirPathIsEmpty,

  #[error("max file size must not be zero")]
  MaxFileSizeTooSmall,

  // resource exhaustion
  #[error("no file id available")]
  NoAvailableFileId,

  #[error("the database directory is used by another process")]
  DatabaseIsUsing,
}

impl Errors {
  /// Fatal errors require closing and reopening the database; recovery runs
  /// on the next open. Recoverable errors leave the open handle usable.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Errors::FailedToOpenFile
        | Errors::FailedToReadFile
        | Errors::FailedToWriteFile
        | Errors::FailedToSyncFile
        | Errors::FailedToCreateDatabaseDir
        | Errors::FailedToCopyDirectory
        | Errors::ReadPastEof
        | Errors::InvalidWalRecordCrc
        | Errors::CorruptedWal
        | Errors::CorruptedNode
        | Errors::CorruptedDeletionIndex
    )
  }
}

pub type Result<T> = std::result::Result<T, Errors>;
