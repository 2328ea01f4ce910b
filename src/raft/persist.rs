//! Stable storage for Raft state and snapshots
//!
//! One file per replica holding both blobs:
//! `[MAGIC][STATE_LEN][SNAP_LEN][STATE][SNAPSHOT][CRC32]`
//!
//! Writes go to a temp file which is then renamed over the live one, so a
//! crash leaves either the old pair or the new pair, never a mix. The pair
//! write is the only way the snapshot blob changes, which keeps the two
//! blobs agreeing on the snapshot index.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::common::{Error, Result};

const PERSIST_MAGIC: &[u8; 8] = b"SHARDKV1";

struct Blobs {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// Stable storage for one replica
pub struct Persister {
    path: PathBuf,
    blobs: Mutex<Blobs>,
}

impl Persister {
    /// Open the persister file, loading any previously saved pair.
    ///
    /// A missing file yields empty blobs; a malformed or checksum-failing
    /// file is fatal, the replica must not start from corrupt state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let blobs = match File::open(&path) {
            Ok(mut file) => Self::read_blobs(&mut file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Blobs {
                state: Vec::new(),
                snapshot: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            blobs: Mutex::new(blobs),
        })
    }

    fn read_blobs(file: &mut File) -> Result<Blobs> {
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        if content.len() < 8 + 8 + 8 + 4 {
            return Err(Error::Corrupted("persister file too short".into()));
        }
        if &content[0..8] != PERSIST_MAGIC {
            return Err(Error::Corrupted("bad persister magic".into()));
        }

        let state_len = u64::from_le_bytes(content[8..16].try_into().unwrap()) as usize;
        let snap_len = u64::from_le_bytes(content[16..24].try_into().unwrap()) as usize;
        let body_end = 24 + state_len + snap_len;
        if content.len() != body_end + 4 {
            return Err(Error::Corrupted("persister length mismatch".into()));
        }

        let stored_crc = u32::from_le_bytes(content[body_end..].try_into().unwrap());
        let actual_crc = crc32fast::hash(&content[..body_end]);
        if stored_crc != actual_crc {
            return Err(Error::Corrupted(format!(
                "persister checksum mismatch: expected {stored_crc:08x}, got {actual_crc:08x}"
            )));
        }

        Ok(Blobs {
            state: content[24..24 + state_len].to_vec(),
            snapshot: content[24 + state_len..body_end].to_vec(),
        })
    }

    fn write_blobs(&self, blobs: &Blobs) -> Result<()> {
        let mut content =
            Vec::with_capacity(8 + 8 + 8 + blobs.state.len() + blobs.snapshot.len() + 4);
        content.extend_from_slice(PERSIST_MAGIC);
        content.extend_from_slice(&(blobs.state.len() as u64).to_le_bytes());
        content.extend_from_slice(&(blobs.snapshot.len() as u64).to_le_bytes());
        content.extend_from_slice(&blobs.state);
        content.extend_from_slice(&blobs.snapshot);
        let crc = crc32fast::hash(&content);
        content.extend_from_slice(&crc.to_le_bytes());

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Save the Raft state blob, keeping the current snapshot.
    pub fn save_state(&self, state: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.state = state;
        self.write_blobs(&blobs)
    }

    /// Save both blobs as one atomic pair.
    pub fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.state = state;
        blobs.snapshot = snapshot;
        self.write_blobs(&blobs)
    }

    pub fn read_state(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().state.clone()
    }

    pub fn read_snapshot(&self) -> Vec<u8> {
        self.blobs.lock().unwrap().snapshot.clone()
    }

    /// Size in bytes of the persisted Raft state blob.
    pub fn state_size(&self) -> usize {
        self.blobs.lock().unwrap().state.len()
    }
}
