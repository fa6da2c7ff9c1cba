//! A VersionEdit describes one transition of the version set: files added to and deleted from
//! levels, plus bookkeeping marks (log number, next file number, last sequence number). Edits
//! are encoded as a sequence of (tag, payload) tuples and appended to the MANIFEST as single
//! records; replaying all records of a MANIFEST reconstructs the current Version.

use crate::error::{err, Result, StatusCode};
use crate::types::{FileMetaData, FileNum, SequenceNumber};

use integer_encoding::{VarIntReader, VarIntWriter};

use std::collections::HashSet;
use std::io::{Read, Write};

enum EditTag {
    ComparatorName = 1,
    LogNumber = 2,
    NextFileNumber = 3,
    LastSequence = 4,
    DeletedFile = 6,
    NewFile = 7,
    PrevLogNumber = 9, // sic!
}

fn tag2enum(t: u32) -> Option<EditTag> {
    match t {
        1 => Some(EditTag::ComparatorName),
        2 => Some(EditTag::LogNumber),
        3 => Some(EditTag::NextFileNumber),
        4 => Some(EditTag::LastSequence),
        6 => Some(EditTag::DeletedFile),
        7 => Some(EditTag::NewFile),
        9 => Some(EditTag::PrevLogNumber),
        _ => None,
    }
}

fn read_length_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let length = reader
        .read_varint::<usize>()
        .map_err(|_| crate::error::Status::new(StatusCode::Corruption, "bad key length"))?;
    let mut buf = vec![0; length];
    match reader.read(&mut buf) {
        Ok(n) if n == length => Ok(buf),
        _ => err(StatusCode::Corruption, "short read of length-prefixed data"),
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<FileNum>,
    pub prev_log_number: Option<FileNum>,
    pub next_file_number: Option<FileNum>,
    pub last_sequence: Option<SequenceNumber>,

    pub deleted_files: HashSet<(usize, FileNum)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new() -> VersionEdit {
        VersionEdit::default()
    }

    pub fn add_file(&mut self, level: usize, file: FileMetaData) {
        self.new_files.push((level, file))
    }

    pub fn delete_file(&mut self, level: usize, file_num: FileNum) {
        self.deleted_files.insert((level, file_num));
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string())
    }

    pub fn set_log_num(&mut self, num: FileNum) {
        self.log_number = Some(num)
    }

    pub fn set_prev_log_num(&mut self, num: FileNum) {
        self.prev_log_number = Some(num)
    }

    pub fn set_next_file(&mut self, num: FileNum) {
        self.next_file_number = Some(num)
    }

    pub fn set_last_sequence(&mut self, seq: SequenceNumber) {
        self.last_sequence = Some(seq)
    }

    /// Encodes the edit into a buffer ready to be appended to the MANIFEST. The writes cannot
    /// fail, they go to memory.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);

        if let Some(ref name) = self.comparator_name {
            buf.write_varint(EditTag::ComparatorName as u32).unwrap();
            buf.write_varint(name.len()).unwrap();
            buf.write_all(name.as_bytes()).unwrap();
        }
        if let Some(num) = self.log_number {
            buf.write_varint(EditTag::LogNumber as u32).unwrap();
            buf.write_varint(num).unwrap();
        }
        if let Some(num) = self.prev_log_number {
            buf.write_varint(EditTag::PrevLogNumber as u32).unwrap();
            buf.write_varint(num).unwrap();
        }
        if let Some(num) = self.next_file_number {
            buf.write_varint(EditTag::NextFileNumber as u32).unwrap();
            buf.write_varint(num).unwrap();
        }
        if let Some(seq) = self.last_sequence {
            buf.write_varint(EditTag::LastSequence as u32).unwrap();
            buf.write_varint(seq).unwrap();
        }
        for &(level, num) in self.deleted_files.iter() {
            buf.write_varint(EditTag::DeletedFile as u32).unwrap();
            buf.write_varint(level).unwrap();
            buf.write_varint(num).unwrap();
        }
        for (level, f) in self.new_files.iter() {
            buf.write_varint(EditTag::NewFile as u32).unwrap();
            buf.write_varint(*level).unwrap();
            buf.write_varint(f.num).unwrap();
            buf.write_varint(f.size).unwrap();
            buf.write_varint(f.smallest.len()).unwrap();
            buf.write_all(&f.smallest).unwrap();
            buf.write_varint(f.largest.len()).unwrap();
            buf.write_all(&f.largest).unwrap();
        }

        buf
    }

    pub fn decode_from(src: &[u8]) -> Result<VersionEdit> {
        let mut reader = src;
        let mut edit = VersionEdit::new();

        while let Ok(tag) = reader.read_varint::<u32>() {
            match tag2enum(tag) {
                None => {
                    return err(
                        StatusCode::Corruption,
                        &format!("invalid tag number {} in version edit", tag),
                    )
                }
                Some(EditTag::ComparatorName) => {
                    let buf = read_length_prefixed(&mut reader)?;
                    match String::from_utf8(buf) {
                        Ok(name) => edit.comparator_name = Some(name),
                        Err(_) => {
                            return err(StatusCode::Corruption, "bad comparator name encoding")
                        }
                    }
                }
                Some(EditTag::LogNumber) => match reader.read_varint() {
                    Ok(num) => edit.log_number = Some(num),
                    Err(_) => return err(StatusCode::Corruption, "couldn't read log number"),
                },
                Some(EditTag::PrevLogNumber) => match reader.read_varint() {
                    Ok(num) => edit.prev_log_number = Some(num),
                    Err(_) => return err(StatusCode::Corruption, "couldn't read prev log number"),
                },
                Some(EditTag::NextFileNumber) => match reader.read_varint() {
                    Ok(num) => edit.next_file_number = Some(num),
                    Err(_) => return err(StatusCode::Corruption, "couldn't read next file number"),
                },
                Some(EditTag::LastSequence) => match reader.read_varint() {
                    Ok(seq) => edit.last_sequence = Some(seq),
                    Err(_) => return err(StatusCode::Corruption, "couldn't read last sequence"),
                },
                Some(EditTag::DeletedFile) => {
                    match (reader.read_varint(), reader.read_varint()) {
                        (Ok(level), Ok(num)) => {
                            edit.deleted_files.insert((level, num));
                        }
                        _ => return err(StatusCode::Corruption, "couldn't read deleted file"),
                    }
                }
                Some(EditTag::NewFile) => {
                    let (level, num, size) = match (
                        reader.read_varint(),
                        reader.read_varint(),
                        reader.read_varint(),
                    ) {
                        (Ok(level), Ok(num), Ok(size)) => (level, num, size),
                        _ => return err(StatusCode::Corruption, "couldn't read new file"),
                    };
                    let smallest = read_length_prefixed(&mut reader)?;
                    let largest = read_length_prefixed(&mut reader)?;
                    edit.new_files.push((
                        level,
                        FileMetaData {
                            num,
                            size,
                            smallest,
                            largest,
                        },
                    ))
                }
            }
        }

        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikey::{make_internal_key, KIND_SET};

    #[test]
    fn test_version_edit_roundtrip() {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("shaledb.BytewiseComparator");
        edit.set_log_num(12);
        edit.set_prev_log_num(0);
        edit.set_next_file(14);
        edit.set_last_sequence(777);
        edit.delete_file(2, 4);
        edit.delete_file(1, 3);
        edit.add_file(
            3,
            FileMetaData {
                num: 13,
                size: 4096,
                smallest: make_internal_key(b"aardvark", 5, KIND_SET),
                largest: make_internal_key(b"zebra", 700, KIND_SET),
            },
        );

        let decoded = VersionEdit::decode_from(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn test_version_edit_empty_roundtrip() {
        let edit = VersionEdit::new();
        let decoded = VersionEdit::decode_from(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn test_version_edit_rejects_bad_tag() {
        let mut buf = Vec::new();
        buf.write_varint(5u32).unwrap();
        assert_eq!(
            VersionEdit::decode_from(&buf).err().unwrap().code,
            StatusCode::Corruption
        );
    }

    #[test]
    fn test_version_edit_rejects_truncation() {
        let mut edit = VersionEdit::new();
        edit.add_file(
            1,
            FileMetaData {
                num: 1,
                size: 100,
                smallest: make_internal_key(b"a", 1, KIND_SET),
                largest: make_internal_key(b"b", 2, KIND_SET),
            },
        );
        let enc = edit.encode();
        assert!(VersionEdit::decode_from(&enc[..enc.len() - 4]).is_err());
    }
}
