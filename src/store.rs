// The shared in-memory store: committed blobs keyed by filename, and
// per-transfer session state keyed by the local TID (the transfer socket's
// port). Both maps are shared by the listener and every transfer server.
//
// A write session accumulates DATA blocks and commits the blob when the
// final short block arrives; a read session hands out 512-byte slices as the
// client ACKs them. Any block-number mismatch is fatal for the session.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::SrvError;
use crate::tftp::BLOCK_SIZE;

/// Largest blob a write transfer may create. The cap keeps every block
/// number, including the terminal one, within the protocol's 16-bit field,
/// so slice offsets never need to wrap.
pub const MAX_FILE_SIZE: usize = u16::MAX as usize * BLOCK_SIZE - 1;

/// Which way a transfer moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug)]
struct SessionInfo {
    filename: String,
    remote_tid: u16,
    next_block_num: u16,
    direction: Direction,
    /// Blocks received so far; writes only.
    data: Vec<u8>,
}

/// The blob and session registry. One instance is shared across the listener
/// and all transfer servers; each map takes a coarse lock, always in
/// sessions-then-files order.
pub struct FileStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
    sessions: Mutex<HashMap<u16, SessionInfo>>,
}

impl FileStore {
    pub fn new() -> FileStore {
        FileStore { files: Mutex::new(HashMap::new()), sessions: Mutex::new(HashMap::new()) }
    }

    /// Returns a store prepopulated with blobs. Handy for testing.
    #[cfg(test)]
    pub fn with_files(files: HashMap<String, Vec<u8>>) -> FileStore {
        FileStore { files: Mutex::new(files), sessions: Mutex::new(HashMap::new()) }
    }

    /// Snapshot check for a committed blob.
    pub fn file_exists(&self, filename: &str) -> bool {
        self.files.lock().unwrap().contains_key(filename)
    }

    /// Atomically commits a blob; the first writer wins.
    pub fn add_file(&self, filename: &str, data: Vec<u8>) -> Result<(), SrvError> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(filename) {
            return Err(SrvError::FileExists { filename: filename.to_string() });
        }
        files.insert(filename.to_string(), data);
        Ok(())
    }

    /// Registers a new transfer session under its local TID.
    pub fn add_session(
        &self,
        local_tid: u16,
        remote_tid: u16,
        filename: &str,
        next_block_num: u16,
        direction: Direction,
    ) -> Result<(), SrvError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&local_tid) {
            return Err(SrvError::DuplicateLocalTid { local_tid });
        }
        sessions.insert(
            local_tid,
            SessionInfo {
                filename: filename.to_string(),
                remote_tid,
                next_block_num,
                direction,
                data: Vec::new(),
            },
        );
        Ok(())
    }

    /// Removes a session. Dropping a TID that is already gone is a no-op.
    pub fn drop_session(&self, local_tid: u16) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(info) = sessions.remove(&local_tid) {
            log::debug!(
                "Dropped {:?} session for \"{}\" (local TID {local_tid})",
                info.direction,
                info.filename
            );
        }
    }

    /// Appends one DATA block to the session's accumulator. A full block
    /// advances the expected block number; a short (or empty) block commits
    /// the blob and ends the session. The session is torn down on any error
    /// except an unexpected remote TID, which leaves it untouched.
    pub fn write(
        &self,
        local_tid: u16,
        remote_tid: u16,
        block_num: u16,
        buf: &[u8],
    ) -> Result<(), SrvError> {
        let mut sessions = self.sessions.lock().unwrap();
        let info = match sessions.get_mut(&local_tid) {
            Some(info) => info,
            None => return Err(SrvError::NoSession { local_tid }),
        };
        if remote_tid != info.remote_tid {
            return Err(SrvError::UnexpectedRemoteTid { got: remote_tid, want: info.remote_tid });
        }
        if self.file_exists(&info.filename) {
            let filename = info.filename.clone();
            sessions.remove(&local_tid);
            return Err(SrvError::FileExists { filename });
        }
        if block_num != info.next_block_num {
            let want = info.next_block_num;
            sessions.remove(&local_tid);
            return Err(SrvError::BadBlock { got: block_num, want });
        }
        if info.data.len() + buf.len() > MAX_FILE_SIZE {
            let filename = info.filename.clone();
            sessions.remove(&local_tid);
            return Err(SrvError::FileTooLarge { filename });
        }
        info.data.extend_from_slice(buf);

        // Not done yet...
        if buf.len() == BLOCK_SIZE {
            info.next_block_num += 1;
            return Ok(());
        }

        // Done; the short block completes the transfer, so move the
        // accumulator into the file map.
        let filename = info.filename.clone();
        let data = std::mem::take(&mut info.data);
        sessions.remove(&local_tid);
        drop(sessions);
        self.add_file(&filename, data)?;
        log::info!("Committed \"{filename}\"");
        Ok(())
    }

    /// Returns the slice for `block_num`, or `None` once the ACK points past
    /// the end of the blob (the terminal ACK, which needs no response and
    /// ends the session).
    pub fn read(
        &self,
        local_tid: u16,
        remote_tid: u16,
        block_num: u16,
    ) -> Result<Option<Vec<u8>>, SrvError> {
        let mut sessions = self.sessions.lock().unwrap();
        let info = match sessions.get_mut(&local_tid) {
            Some(info) => info,
            None => return Err(SrvError::NoSession { local_tid }),
        };
        if remote_tid != info.remote_tid {
            return Err(SrvError::UnexpectedRemoteTid { got: remote_tid, want: info.remote_tid });
        }
        if block_num != info.next_block_num {
            let want = info.next_block_num;
            sessions.remove(&local_tid);
            return Err(SrvError::BadBlock { got: block_num, want });
        }

        let files = self.files.lock().unwrap();
        let data = files.get(&info.filename).map(Vec::as_slice).unwrap_or(&[]);
        let start = block_num as usize * BLOCK_SIZE;
        if start > data.len() {
            drop(files);
            sessions.remove(&local_tid);
            return Ok(None);
        }
        let end = (start + BLOCK_SIZE).min(data.len());
        let slice = data[start..end].to_vec();
        drop(files);
        info.next_block_num += 1;
        Ok(Some(slice))
    }

    #[cfg(test)]
    pub fn file_contents(&self, filename: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(filename).cloned()
    }

    #[cfg(test)]
    fn session_next_block(&self, local_tid: u16) -> Option<u16> {
        self.sessions.lock().unwrap().get(&local_tid).map(|info| info.next_block_num)
    }

    #[cfg(test)]
    fn set_session_data(&self, local_tid: u16, data: Vec<u8>) {
        if let Some(info) = self.sessions.lock().unwrap().get_mut(&local_tid) {
            info.data = data;
        }
    }
}
