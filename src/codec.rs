//! Per-file framing: push one file onto a stream, or pull one file off it.
//!
//! The sender reads the source in `MAX_CHUNK_LEN` pieces and length-prefixes
//! each one. The receiver creates `<dir>/<filename>` and appends chunks until
//! the declared length is reached. Both sides use `read_exact`/`write_all`,
//! so short reads and short writes are retried the same way.

use crate::protocol::{read_len, write_len, LEN_FIELD, MAX_CHUNK_LEN, MAX_FILENAME_LEN};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to open {}: {source}", .path.display())]
    OpenSource { path: PathBuf, source: io::Error },
    #[error("{} is {len} bytes, larger than the 4 GiB frame limit", .path.display())]
    FileTooLarge { path: PathBuf, len: u64 },
    #[error("{} has no file name", .path.display())]
    NoFileName { path: PathBuf },
    #[error("source {} ended {missing} bytes early", .path.display())]
    SourceShrank { path: PathBuf, missing: u64 },
    #[error("failed to create {}: {source}", .path.display())]
    CreateDestination { path: PathBuf, source: io::Error },
    #[error("connection ended while reading {stage}")]
    Truncated { stage: &'static str },
    #[error("empty filename in frame header")]
    EmptyFilename,
    #[error("filename length {0} exceeds {max}", max = MAX_FILENAME_LEN)]
    FilenameTooLong(u32),
    #[error("chunk length {0} exceeds {max}", max = MAX_CHUNK_LEN)]
    ChunkTooLarge(u32),
    #[error("chunk of {len} bytes overruns the {remaining} bytes left in the file")]
    ChunkOverrun { len: u32, remaining: u64 },
    #[error("could not allocate a {0} byte chunk buffer")]
    Allocation(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What one frame carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSummary {
    pub filename: OsString,
    pub file_len: u32,
    pub chunks: u64,
    /// Local source (send) or destination (receive).
    pub path: PathBuf,
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    Frame(FrameSummary),
    /// Peer closed cleanly at a frame boundary.
    Disconnected,
}

/// Send one file as a single frame.
///
/// `progress` is called with each chunk's payload size after it is written.
pub fn send_file<W, F>(out: &mut W, path: &Path, mut progress: F) -> Result<FrameSummary, CodecError>
where
    W: Write + ?Sized,
    F: FnMut(u64),
{
    let mut file = File::open(path).map_err(|source| CodecError::OpenSource {
        path: path.to_path_buf(),
        source,
    })?;
    let len = file.metadata()?.len();
    let file_len = u32::try_from(len).map_err(|_| CodecError::FileTooLarge {
        path: path.to_path_buf(),
        len,
    })?;
    let filename = path
        .file_name()
        .ok_or_else(|| CodecError::NoFileName {
            path: path.to_path_buf(),
        })?
        .to_os_string();
    let name_bytes = filename.as_bytes();

    write_len(out, name_bytes.len() as u32)?;
    out.write_all(name_bytes)?;
    write_len(out, file_len)?;

    let mut buf = [0u8; MAX_CHUNK_LEN];
    let mut remaining = file_len as usize;
    let mut chunks = 0u64;
    while remaining > 0 {
        let want = remaining.min(MAX_CHUNK_LEN);
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(CodecError::SourceShrank {
                    path: path.to_path_buf(),
                    missing: remaining as u64,
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        write_len(out, n as u32)?;
        out.write_all(&buf[..n])?;
        remaining -= n;
        chunks += 1;
        progress(n as u64);
    }
    out.flush()?;

    Ok(FrameSummary {
        filename,
        file_len,
        chunks,
        path: path.to_path_buf(),
    })
}

/// How far a frame got before it failed. Only known once the header parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFrame {
    pub filename: OsString,
    pub path: PathBuf,
    /// Payload bytes handed to the destination file before the failure.
    pub received: u64,
}

/// A failed receive, with whatever the header already told us.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ReceiveError {
    pub partial: Option<PartialFrame>,
    pub error: CodecError,
}

impl From<CodecError> for ReceiveError {
    fn from(error: CodecError) -> Self {
        Self {
            partial: None,
            error,
        }
    }
}

/// Receive one frame into `directory`.
///
/// Zero bytes at the frame boundary is an orderly disconnect; any other short
/// read is an error for this connection.
pub fn receive_frame<R>(input: &mut R, directory: &Path) -> Result<ReceiveOutcome, ReceiveError>
where
    R: Read + ?Sized,
{
    let mut field = [0u8; LEN_FIELD];
    let first = loop {
        match input.read(&mut field) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::from(e).into()),
        }
    };
    if first == 0 {
        return Ok(ReceiveOutcome::Disconnected);
    }
    fill(input, &mut field[first..], "filename length")?;
    let name_len = u32::from_ne_bytes(field);
    if name_len == 0 {
        return Err(CodecError::EmptyFilename.into());
    }
    if name_len as usize > MAX_FILENAME_LEN {
        return Err(CodecError::FilenameTooLong(name_len).into());
    }

    let mut name = vec![0u8; name_len as usize];
    fill(input, &mut name, "filename")?;
    let filename = OsString::from_vec(name);
    let file_len = read_len(input).map_err(|e| truncated(e, "file length"))?;

    let path = destination_path(directory, &filename);
    let mut received = 0u64;
    match receive_payload(input, &path, file_len, &mut received) {
        Ok(chunks) => Ok(ReceiveOutcome::Frame(FrameSummary {
            filename,
            file_len,
            chunks,
            path,
        })),
        Err(error) => Err(ReceiveError {
            partial: Some(PartialFrame {
                filename,
                path,
                received,
            }),
            error,
        }),
    }
}

/// Create `path` and append chunks until `file_len` bytes arrived.
fn receive_payload<R>(
    input: &mut R,
    path: &Path,
    file_len: u32,
    received: &mut u64,
) -> Result<u64, CodecError>
where
    R: Read + ?Sized,
{
    let file = File::create(path).map_err(|source| CodecError::CreateDestination {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);

    let mut chunks = 0u64;
    while *received < u64::from(file_len) {
        let chunk_len = read_len(input).map_err(|e| truncated(e, "chunk length"))?;
        if chunk_len as usize > MAX_CHUNK_LEN {
            return Err(CodecError::ChunkTooLarge(chunk_len));
        }
        let remaining = u64::from(file_len) - *received;
        if u64::from(chunk_len) > remaining {
            return Err(CodecError::ChunkOverrun {
                len: chunk_len,
                remaining,
            });
        }
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(chunk_len as usize)
            .map_err(|_| CodecError::Allocation(chunk_len))?;
        chunk.resize(chunk_len as usize, 0);
        fill(input, &mut chunk, "chunk payload")?;
        writer.write_all(&chunk)?;
        *received += u64::from(chunk_len);
        chunks += 1;
    }
    writer.flush()?;
    Ok(chunks)
}

/// `directory + "/" + filename`, with no further path policy.
pub fn destination_path(directory: &Path, filename: &OsStr) -> PathBuf {
    let mut joined = directory.as_os_str().to_os_string();
    joined.push("/");
    joined.push(filename);
    PathBuf::from(joined)
}

fn fill<R: Read + ?Sized>(input: &mut R, buf: &mut [u8], stage: &'static str) -> Result<(), CodecError> {
    input.read_exact(buf).map_err(|e| truncated(e, stage))
}

fn truncated(e: io::Error, stage: &'static str) -> CodecError {
    if e.kind() == ErrorKind::UnexpectedEof {
        CodecError::Truncated { stage }
    } else {
        CodecError::Io(e)
    }
}
