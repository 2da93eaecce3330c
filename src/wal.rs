use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Outcome of reading one frame during replay.
enum Frame {
    Event(Event),
    /// Clean end of log, or a frame cut short by a crash.
    End,
    /// A complete frame whose checksum or payload is bad.
    Corrupt(String),
}

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for a frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf`, or report `false` if the file ends first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(Frame::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(Frame::End);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Corrupt("checksum mismatch".into()));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Frame::Event(event),
        Err(e) => Frame::Corrupt(format!("undecodable entry ({e})")),
    })
}

/// Append-only log of booking events, one `[len][bincode][crc32]` frame
/// each (little-endian u32 length and checksum). Compaction writes a
/// snapshot beside the log and renames it into place.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: Self::append_handle(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn append_handle(path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Buffer an event without syncing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Write `events` to the snapshot file and sync it. The live log is untouched.
    pub fn write_snapshot(&self, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(self.snapshot_path())?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Replace the log with the snapshot and resume appending to it.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        // Anything still buffered belongs to the old file.
        self.writer.flush()?;
        fs::rename(self.snapshot_path(), &self.path)?;
        self.writer = Self::append_handle(&self.path)?;
        self.appends_since_compact = 0;
        tracing::debug!("installed WAL snapshot at {}", self.path.display());
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in order. A missing file is an empty log; replay
    /// stops at the first torn or corrupt frame.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event) => events.push(event),
                Frame::End => break,
                Frame::Corrupt(why) => {
                    tracing::warn!("WAL {}: {why}, dropping tail", path.display());
                    break;
                }
            }
        }
        Ok(events)
    }
}
