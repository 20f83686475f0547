use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a record may carry. A longer length prefix is a torn header.
pub const MAX_RECORD_BYTES: u32 = 16 * 1024 * 1024;

/// Bytes of framing around each payload: length prefix and checksum.
const FRAME_BYTES: u64 = 8;

/// Encode one record as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_BYTES)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the log ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A torn or corrupt tail (crash mid-write) ends replay at the last good record,
/// so a multi-row series record is either replayed whole or not at all.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
}

/// Result of scanning a log file.
#[derive(Debug, Default)]
pub struct Scan {
    pub events: Vec<Event>,
    /// Length of the prefix holding only whole, valid records.
    pub valid_len: u64,
    pub file_len: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
        })
    }

    /// Replay the log and cut off any torn tail, so later appends follow the
    /// last good record instead of garbage that would hide them on the next replay.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let scan = Self::scan(path)?;
        if scan.file_len > scan.valid_len {
            tracing::warn!(
                "WAL {}: truncating {} bytes of torn tail",
                path.display(),
                scan.file_len - scan.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }
        Ok(scan.events)
    }

    /// Append and fsync one event. Production code goes through group commit instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        Ok(())
    }

    /// Drop everything written or buffered since the last successful `flush_sync`.
    /// Called after a failed flush so a partial record never precedes later appends.
    pub fn discard_unflushed(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        let reopened = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(reopened));
        // Discard the buffer rather than letting drop flush it past the cut.
        let _ = stale.into_parts();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Phase one of compaction: write the snapshot to a temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every valid event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.events)
    }

    pub fn scan(path: &Path) -> io::Result<Scan> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Scan::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_full(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf);
            if len > MAX_RECORD_BYTES || valid_len + FRAME_BYTES + u64::from(len) > file_len {
                tracing::warn!("WAL {}: record length {len} runs past the log, dropping tail", path.display());
                break;
            }
            let mut payload = vec![0u8; len as usize];
            if !read_full(&mut reader, &mut payload)? {
                break;
            }
            let mut crc_buf = [0u8; 4];
            if !read_full(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!("WAL {}: checksum mismatch, dropping tail", path.display());
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!("WAL {}: undecodable record ({e}), dropping tail", path.display());
                    break;
                }
            }
            valid_len += FRAME_BYTES + u64::from(len);
        }

        Ok(Scan {
            events,
            valid_len,
            file_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reservation, Span};
    use chrono::DateTime;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn reservation(id: i64, start: &str, end: &str) -> Reservation {
        Reservation {
            id,
            room_id: 1,
            requester: "Ted".into(),
            span: Span::new(
                DateTime::parse_from_rfc3339(start).unwrap(),
                DateTime::parse_from_rfc3339(end).unwrap(),
            ),
            memo: Some("weekly sync".into()),
        }
    }

    fn room_created() -> Event {
        Event::RoomCreated { id: 1, name: "Room A".into() }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            room_created(),
            Event::ReservationMade {
                reservation: reservation(1, "2018-08-07T16:00:00+09:00", "2018-08-07T19:00:00+09:00"),
            },
            Event::ReservationCancelled { id: 1, room_id: 1 },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created()).unwrap();
        }
        // Simulate a crash in the middle of the next record.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![room_created()]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_series_record_is_dropped_whole() {
        let path = tmp_path("torn_series.wal");
        let series = Event::SeriesMade {
            reservations: vec![
                reservation(1, "2018-08-07T10:00:00+09:00", "2018-08-07T11:00:00+09:00"),
                reservation(2, "2018-08-14T10:00:00+09:00", "2018-08-14T11:00:00+09:00"),
                reservation(3, "2018-08-21T10:00:00+09:00", "2018-08-21T11:00:00+09:00"),
            ],
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created()).unwrap();
            wal.append(&series).unwrap();
        }
        // Chop off the checksum and part of the payload of the series record.
        let full = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full - 10).unwrap();

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![room_created()]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_truncates.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created()).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap();
        }

        let scan = Wal::scan(&path).unwrap();
        assert_eq!(scan.valid_len, good_len);
        assert_eq!(scan.file_len, good_len + 6);

        assert_eq!(Wal::recover(&path).unwrap(), vec![room_created()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        let second = Event::RoomCreated { id: 2, name: "Room B".into() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![room_created(), second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_a_torn_tail() {
        let path = tmp_path("oversized_len.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created()).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&0xFFFF_FFF0u32.to_le_bytes()).unwrap();
            f.write_all(&[7; 32]).unwrap();
        }

        let scan = Wal::scan(&path).unwrap();
        assert_eq!(scan.events, vec![room_created()]);
        assert_eq!(scan.file_len - scan.valid_len, 36);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn discard_unflushed_cuts_back_to_last_sync() {
        let path = tmp_path("discard_unflushed.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&room_created()).unwrap();
        let synced = fs::metadata(&path).unwrap().len();

        // Bytes reach the file but are never synced, as when fsync fails.
        wal.append_buffered(&Event::RoomCreated { id: 2, name: "Room B".into() })
            .unwrap();
        wal.writer.flush().unwrap();
        assert!(fs::metadata(&path).unwrap().len() > synced);

        wal.discard_unflushed().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced);

        let third = Event::RoomCreated { id: 3, name: "Room C".into() };
        wal.append(&third).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![room_created(), third]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        {
            let payload = bincode::serialize(&room_created()).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact_replaces.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created()).unwrap();
            for id in 1..=10 {
                wal.append(&Event::ReservationMade {
                    reservation: reservation(id, "2018-08-07T10:00:00+09:00", "2018-08-07T11:00:00+09:00"),
                })
                .unwrap();
                wal.append(&Event::ReservationCancelled { id, room_id: 1 }).unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Event::IdCheckpoint { next_id: 11 }, room_created()];
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&snapshot).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), snapshot);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let made = Event::ReservationMade {
            reservation: reservation(4, "2018-08-07T10:00:00+09:00", "2018-08-07T11:00:00+09:00"),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room_created()).unwrap();
            wal.compact(&[room_created()]).unwrap();
            wal.append(&made).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![room_created(), made]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_counts_and_flushes() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (1..=5)
            .map(|id| Event::RoomCreated { id, name: format!("Room {id}") })
            .collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
