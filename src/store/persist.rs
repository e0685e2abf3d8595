//! Binary storage for owner partitions.
//!
//! One file per owner: `embeddings/<sha256(owner)[..32]>.bin`
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of embedding model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Owner: u16 length + UTF-8 bytes
//!
//! Entries (repeated):
//! - seq: u64
//! - created_at, updated_at: i64 seconds + u32 nanos each
//! - task_type: u8
//! - id: u16 length + bytes
//! - source_ref_id, content_hash, source_text: u32 length + bytes
//! - embedding: [f32; dimensions]
//!
//! All integers are little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::eid::{OwnerId, RecordId};
use crate::store::record::{ContentHash, EmbeddingRecord, TaskType};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

const FILE_EXTENSION: &str = "bin";

/// Errors that can occur during partition file operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: {0} was written by a different embedding model")]
    ModelMismatch(PathBuf),

    #[error("Checksum mismatch: {0} may be corrupted")]
    ChecksumMismatch(PathBuf),

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

/// Reads and writes partition files below one directory.
#[derive(Debug, Clone)]
pub struct PartitionFiles {
    dir: PathBuf,
    model_id: [u8; 32],
    dimensions: usize,
}

/// SHA256 of the model name, stamped into every file header.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

impl PartitionFiles {
    pub fn new(dir: PathBuf, model_name: &str, dimensions: usize) -> Result<Self, PersistError> {
        if dimensions == 0 || dimensions > u16::MAX as usize {
            return Err(PersistError::InvalidFormat(format!(
                "unsupported dimensionality {dimensions}"
            )));
        }
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            model_id: model_id_hash(model_name),
            dimensions,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `owner`'s partition. Owner ids are hashed so any string is a safe name.
    pub fn path_for(&self, owner: &OwnerId) -> PathBuf {
        let digest = Sha256::digest(owner.as_str().as_bytes());
        let name = format!("{digest:x}");
        self.dir.join(format!("{}.{FILE_EXTENSION}", &name[..32]))
    }

    /// Persist one owner's records.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, owner: &OwnerId, records: &[&EmbeddingRecord]) -> Result<(), PersistError> {
        let path = self.path_for(owner);
        let temp_path = path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, owner, records);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Remove an owner's file if it exists.
    pub fn delete(&self, owner: &OwnerId) -> Result<(), PersistError> {
        let path = self.path_for(owner);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Load every partition file in the directory.
    pub fn load_all(&self) -> Result<Vec<(OwnerId, Vec<EmbeddingRecord>)>, PersistError> {
        let mut partitions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            partitions.push(self.load(&path)?);
        }
        Ok(partitions)
    }

    pub fn load(&self, path: &Path) -> Result<(OwnerId, Vec<EmbeddingRecord>), PersistError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader, path)?;
        self.validate_header(&header, path)?;

        let owner = OwnerId::new(read_string16(&mut reader)?);
        let dimensions = header.dimensions as usize;

        let mut records = Vec::with_capacity(header.entry_count.min(1 << 20) as usize);
        for _ in 0..header.entry_count {
            records.push(read_entry(&mut reader, &owner, dimensions)?);
        }

        Ok((owner, records))
    }

    fn write_to_file(
        &self,
        path: &Path,
        owner: &OwnerId,
        records: &[&EmbeddingRecord],
    ) -> Result<(), PersistError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: self.model_id,
            dimensions: self.dimensions as u16,
            entry_count: records.len() as u64,
        };
        write_header(&mut writer, &header)?;
        write_string16(&mut writer, owner.as_str())?;

        for record in records {
            if record.vector.len() != self.dimensions {
                return Err(PersistError::DimensionMismatch {
                    expected: self.dimensions,
                    got: record.vector.len(),
                });
            }
            write_entry(&mut writer, record)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header<R: Read>(reader: &mut R, path: &Path) -> Result<Header, PersistError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION {
            return Err(PersistError::VersionMismatch(version, FORMAT_VERSION));
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header_bytes[35..43]);
        let entry_count = u64::from_le_bytes(count_bytes);
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&header_bytes[43..47]);
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(PersistError::ChecksumMismatch(path.to_path_buf()));
        }

        Ok(Header {
            version,
            model_id,
            dimensions,
            entry_count,
        })
    }

    fn validate_header(&self, header: &Header, path: &Path) -> Result<(), PersistError> {
        if header.version == 0 {
            return Err(PersistError::InvalidFormat("version 0".to_string()));
        }
        if header.model_id != self.model_id {
            return Err(PersistError::ModelMismatch(path.to_path_buf()));
        }
        if header.dimensions as usize != self.dimensions {
            return Err(PersistError::DimensionMismatch {
                expected: self.dimensions,
                got: header.dimensions as usize,
            });
        }
        Ok(())
    }
}

fn write_header<W: Write>(writer: &mut W, header: &Header) -> Result<(), PersistError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn write_entry<W: Write>(writer: &mut W, record: &EmbeddingRecord) -> Result<(), PersistError> {
    writer.write_all(&record.seq.to_le_bytes())?;
    write_timestamp(writer, &record.created_at)?;
    write_timestamp(writer, &record.updated_at)?;
    writer.write_all(&[record.task_type.code()])?;
    write_string16(writer, &record.id)?;
    write_string32(writer, &record.source_ref_id)?;
    write_string32(writer, record.content_hash.as_str())?;
    write_string32(writer, &record.source_text)?;

    for &value in &record.vector {
        writer.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn read_entry<R: Read>(
    reader: &mut R,
    owner: &OwnerId,
    dimensions: usize,
) -> Result<EmbeddingRecord, PersistError> {
    let seq = read_u64(reader)?;
    let created_at = read_timestamp(reader)?;
    let updated_at = read_timestamp(reader)?;

    let mut code = [0u8; 1];
    reader.read_exact(&mut code)?;
    let task_type = TaskType::from_code(code[0])
        .ok_or_else(|| PersistError::InvalidFormat(format!("unknown task type {}", code[0])))?;

    let id = RecordId::from(read_string16(reader)?);
    let source_ref_id = read_string32(reader)?;
    let content_hash = ContentHash::from_hex(read_string32(reader)?);
    let source_text = read_string32(reader)?;

    let mut vector = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        vector.push(f32::from_le_bytes(float_bytes));
    }

    Ok(EmbeddingRecord {
        id,
        owner_id: owner.clone(),
        source_ref_id,
        task_type,
        vector,
        content_hash,
        source_text,
        created_at,
        updated_at,
        seq,
    })
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, PersistError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn write_timestamp<W: Write>(writer: &mut W, ts: &DateTime<Utc>) -> Result<(), PersistError> {
    writer.write_all(&ts.timestamp().to_le_bytes())?;
    writer.write_all(&ts.timestamp_subsec_nanos().to_le_bytes())?;
    Ok(())
}

fn read_timestamp<R: Read>(reader: &mut R) -> Result<DateTime<Utc>, PersistError> {
    let mut secs = [0u8; 8];
    reader.read_exact(&mut secs)?;
    let mut nanos = [0u8; 4];
    reader.read_exact(&mut nanos)?;
    let secs = i64::from_le_bytes(secs);
    let nanos = u32::from_le_bytes(nanos);
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| PersistError::InvalidFormat(format!("bad timestamp {secs}.{nanos}")))
}

fn write_string16<W: Write>(writer: &mut W, value: &str) -> Result<(), PersistError> {
    let len = u16::try_from(value.len())
        .map_err(|_| PersistError::InvalidFormat(format!("string too long: {}", value.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn write_string32<W: Write>(writer: &mut W, value: &str) -> Result<(), PersistError> {
    let len = u32::try_from(value.len())
        .map_err(|_| PersistError::InvalidFormat(format!("string too long: {}", value.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn read_string16<R: Read>(reader: &mut R) -> Result<String, PersistError> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    read_utf8(reader, u16::from_le_bytes(len) as usize)
}

fn read_string32<R: Read>(reader: &mut R) -> Result<String, PersistError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    read_utf8(reader, u32::from_le_bytes(len) as usize)
}

fn read_utf8<R: Read>(reader: &mut R, len: usize) -> Result<String, PersistError> {
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| PersistError::InvalidFormat(e.to_string()))
}
