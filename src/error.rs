/// Custom Result type for gorz operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the gorz library, encompassing all error cases that
/// can occur while encoding, indexing, or iterating block files.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub enum Error {
    /// Malformed on-disk data: bad version strings, unknown column type ids,
    /// unparsable keys. Always fatal and never retryable.
    FormatError(#[from] FormatError),
    /// I/O failures while opening or reading files
    ResourceError(#[from] ResourceError),
    /// Format limits exceeded at encode time
    CapacityError(#[from] CapacityError),
    /// API misuse, such as calling a reader after `close()`
    UsageError(#[from] UsageError),
    /// Standard I/O errors from the Rust standard library
    IoError(#[from] std::io::Error),
    /// UTF-8 encoding/decoding errors
    Utf8Error(#[from] std::str::Utf8Error),
}

/// Errors raised when on-disk data does not match the expected format.
///
/// These always carry the offending file path or a snippet of the offending
/// content, and are never produced for files written by this crate's own
/// encoder.
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    /// The index file declares a version other than the supported one
    #[error("Invalid index file version: expected {expected}, found {found}")]
    InvalidIndexVersion { expected: String, found: String },

    /// A column type id in a block is not part of the encoding catalogue
    #[error("Unexpected column type id {0} when decoding block")]
    UnknownTypeId(u8),

    /// A key column contained something other than ASCII digits
    #[error("Cannot parse genomic key from: {0}")]
    MalformedKey(String),

    /// A block line did not contain the expected `chrom\tpos\tpayload` fields
    #[error("Could not find compressed block in {path}: line holds {len} bytes")]
    MissingBlockPayload { path: String, len: usize },

    /// An index entry line did not contain `chrom\tpos\toffset`
    #[error("Malformed index entry: {0}")]
    MalformedIndexEntry(String),

    /// A block payload is shorter than its declared column types require, or
    /// references a lookup id outside its table
    #[error("Block payload inconsistent with declared column types: {0}")]
    InconsistentBlock(String),
}

/// I/O failures, split into a transient stale-handle condition (safe to retry
/// against another replica) and permanent read errors.
#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    /// The underlying handle went stale (NFS and friends); retryable elsewhere
    #[error("Stale file handle reading {path}")]
    StaleHandle {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A permanent read failure; carries the path and the original cause
    #[error("Error reading block file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Block content inconsistent with its declared encoding
    #[error("Corrupt block file {path}: {reason}")]
    CorruptFile { path: String, reason: String },
}

/// Hard limits of the external lookup-table wire format. Never silently
/// truncated; encoding fails instead.
#[derive(thiserror::Error, Debug)]
pub enum CapacityError {
    /// Externalized column indices must be byte-delta encodable
    #[error("Cannot externalize lookup map: column index delta {0} exceeds 255")]
    ColumnIndexGap(usize),

    /// An external table is limited to 65536 entries per column
    #[error("Cannot externalize lookup map: {0} entries exceed the u16 id space")]
    ExternalTableOverflow(usize),

    /// Header plus serialized external tables must fit in one read chunk
    #[error("Header and external tables too large: {size} > {limit} bytes")]
    HeaderTooLarge { size: usize, limit: usize },
}

/// Programming errors in how the API is driven
#[derive(thiserror::Error, Debug)]
pub enum UsageError {
    /// Any reader method called after `close()`
    #[error("Reader is closed")]
    ReaderClosed,

    /// A header may only be set before the first row is flushed
    #[error("Header can only be written before the first block: {0}")]
    HeaderAlreadyWritten(String),
}

impl Error {
    /// Wraps an I/O error from reading `path`, classifying stale handles as
    /// the transient [`ResourceError::StaleHandle`] variant.
    pub(crate) fn from_read(path: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::StaleNetworkFileHandle {
            ResourceError::StaleHandle {
                path: path.to_string(),
                source,
            }
            .into()
        } else {
            ResourceError::Read {
                path: path.to_string(),
                source,
            }
            .into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_classify_as_transient() {
        let stale = std::io::Error::from(std::io::ErrorKind::StaleNetworkFileHandle);
        assert!(matches!(
            Error::from_read("a.gorz", stale),
            Error::ResourceError(ResourceError::StaleHandle { .. })
        ));
        let gone = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            Error::from_read("a.gorz", gone),
            Error::ResourceError(ResourceError::Read { .. })
        ));
    }
}
