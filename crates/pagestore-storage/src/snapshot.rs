//! Session registry snapshot
//!
//! Backing files carry no headers, so the ledgers are the only way to make
//! sense of them. On shutdown the registry is saved next to the session
//! directories; the next open loads it and deletes the file, so a crash in
//! between starts from an empty registry instead of a stale one.
//!
//! Format: `[magic u32][version u32][length u64][crc32c u32]` followed by the
//! bincode-encoded sessions, all little-endian.

use crate::session::SessionEntry;
use pagestore_common::{Error, Result};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, error, info};

const MAGIC: u32 = 0x5047_5349; // "PGSI"
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 20;

/// Write `sessions` to `path` atomically
pub fn save(path: &Path, sessions: &[SessionEntry]) -> Result<()> {
    let data = bincode::serialize(sessions)
        .map_err(|e| Error::Serialization(format!("failed to serialize registry: {}", e)))?;

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&(data.len() as u64).to_le_bytes());
    header[16..20].copy_from_slice(&crc32c::crc32c(&data).to_le_bytes());

    let temp_path = path.with_extension("index.tmp");
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::Storage(format!("failed to create registry snapshot: {}", e)))?;

        let mut writer = BufWriter::new(file);
        writer
            .write_all(&header)
            .and_then(|()| writer.write_all(&data))
            .and_then(|()| writer.flush())
            .map_err(|e| Error::Storage(format!("failed to write registry snapshot: {}", e)))?;

        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::Storage(format!("failed to sync registry snapshot: {}", e)))?;
    }

    std::fs::rename(&temp_path, path)
        .map_err(|e| Error::Storage(format!("failed to rename registry snapshot: {}", e)))?;

    debug!("Saved {} sessions to {}", sessions.len(), path.display());
    Ok(())
}

/// Read sessions from `path`, `Ok(None)` if there is no snapshot
pub fn load(path: &Path) -> Result<Option<Vec<SessionEntry>>> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Storage(format!("failed to read registry snapshot: {}", e))),
    };

    if buf.len() < HEADER_SIZE {
        return Err(Error::Deserialization("registry snapshot truncated".into()));
    }
    let (header, data) = buf.split_at(HEADER_SIZE);

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[8..16]);
    let length = u64::from_le_bytes(len_bytes);
    let checksum = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);

    if magic != MAGIC {
        return Err(Error::Deserialization("invalid registry snapshot header".into()));
    }
    if version != VERSION {
        return Err(Error::Deserialization(format!(
            "unsupported registry snapshot version {}",
            version
        )));
    }
    if length != data.len() as u64 {
        return Err(Error::Deserialization(format!(
            "registry snapshot length mismatch: header says {}, found {}",
            length,
            data.len()
        )));
    }
    if crc32c::crc32c(data) != checksum {
        return Err(Error::Deserialization("registry snapshot checksum mismatch".into()));
    }

    let sessions = bincode::deserialize(data)
        .map_err(|e| Error::Deserialization(format!("failed to deserialize registry: {}", e)))?;
    Ok(Some(sessions))
}

/// Load the snapshot if there is a usable one, then delete it
pub fn take(path: &Path) -> Vec<SessionEntry> {
    let sessions = match load(path) {
        Ok(Some(sessions)) => {
            info!("Restored {} sessions from {}", sessions.len(), path.display());
            sessions
        }
        Ok(None) => return Vec::new(),
        Err(e) => {
            error!("Ignoring registry snapshot {}: {}", path.display(), e);
            Vec::new()
        }
    };

    if let Err(e) = std::fs::remove_file(path) {
        error!("Failed to delete registry snapshot {}: {}", path.display(), e);
    }
    sessions
}
