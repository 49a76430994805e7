use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SCAN_CHUNK: u64 = 4096;

/// A CSV file that only ever grows. Each row is encoded in memory first and
/// handed to the OS in a single `write_all` on an `O_APPEND` handle, then
/// synced. A failed write is rolled back to the last complete row.
///
/// Not synchronised itself; owners keep it behind a mutex.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    file: File,
    committed: u64,
}

impl AppendLog {
    /// Opens `path` for appending, creating parent directories and the file
    /// as needed. `header` is written only when the file is empty. A last
    /// line left without a terminator is closed off first, so new rows never
    /// continue it.
    pub fn open(path: &Path, header: &[&str]) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let mut log = Self {
            path: path.to_path_buf(),
            file,
            committed: len,
        };

        if len == 0 {
            log.append(header)?;
        } else if last_byte(&mut log.file, len)? != b'\n' {
            tracing::warn!(path = %path.display(), "Log ends mid-line, terminating it");
            log.write_committed(b"\n")?;
        }

        Ok(log)
    }

    #[cfg(test)]
    pub(crate) fn from_file(path: &Path, file: File) -> Self {
        let committed = file.metadata().map(|m| m.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            file,
            committed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes covered by complete, synced rows.
    pub fn committed_len(&self) -> u64 {
        self.committed
    }

    pub fn append<I, T>(&mut self, fields: I) -> io::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let row = encode_row(fields)?;
        self.write_committed(&row)
    }

    fn write_committed(&mut self, bytes: &[u8]) -> io::Result<()> {
        let written = self
            .file
            .write_all(bytes)
            .and_then(|()| self.file.sync_data());

        match written {
            Ok(()) => {
                self.committed += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.file.set_len(self.committed) {
                    tracing::warn!(path = %self.path.display(), error = %rollback, "Could not roll back partial row");
                }
                Err(e)
            }
        }
    }
}

fn encode_row<I, T>(fields: I) -> io::Result<Vec<u8>>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(fields).map_err(io::Error::other)?;
    writer.into_inner().map_err(|e| e.into_error())
}

fn last_byte(file: &mut File, len: u64) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Length of the prefix of the first `len` bytes that ends in a line
/// terminator; anything after the last `\n` is an unfinished row.
pub fn terminated_len(file: &mut File, len: u64) -> io::Result<u64> {
    let mut end = len;
    let mut chunk = Vec::new();
    while end > 0 {
        let start = end.saturating_sub(SCAN_CHUNK);
        chunk.resize((end - start) as usize, 0);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            file.seek(SeekFrom::Start(0))?;
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(0)
}
