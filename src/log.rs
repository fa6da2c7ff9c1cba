//! The record file format shared by the write-ahead log and the MANIFEST.
//!
//! A file is a sequence of 32 KiB blocks; a block holds records and an optional trailer (filler).
//! A record is one or more fragments `[checksum: u32, length: u16, type: u8, payload]` where the
//! checksum is the masked CRC32C of type and payload, and the type marks the fragment's position
//! within its record (Full/First/Middle/Last). A record never spans a block boundary inside a
//! fragment; the writer pads the block instead.
//!
//! A truncated trailing record, as left behind by a crash between syncs, reads as a clean end of
//! file. Checksum mismatches are corruption.

use crate::env::WritableFile;
use crate::error::{err, Result, StatusCode};

use std::io::{Read, Write};

use crc::crc32;
use crc::Hasher32;
use integer_encoding::FixedInt;
use integer_encoding::FixedIntWriter;

pub const BLOCK_SIZE: usize = 32 * 1024;
const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Clone, Copy)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

pub struct LogWriter<W: Write> {
    dst: W,
    digest: crc32::Digest,
    current_block_offset: usize,
    block_size: usize,
}

impl<W: Write> LogWriter<W> {
    pub fn new(writer: W) -> LogWriter<W> {
        LogWriter {
            dst: writer,
            current_block_offset: 0,
            block_size: BLOCK_SIZE,
            digest: crc32::Digest::new(crc32::CASTAGNOLI),
        }
    }

    /// new_with_off opens a writer positioned at some offset of an existing log file. The file
    /// must have the default block size.
    pub fn new_with_off(writer: W, off: usize) -> LogWriter<W> {
        let mut w = LogWriter::new(writer);
        w.current_block_offset = off % BLOCK_SIZE;
        w
    }

    /// Appends one logical record, splitting it into fragments at block boundaries.
    pub fn add_record(&mut self, r: &[u8]) -> Result<usize> {
        let mut record = r;
        let mut first_frag = true;
        let mut written = 0;
        loop {
            assert!(self.block_size > HEADER_SIZE);

            let space_left = self.block_size - self.current_block_offset;
            if space_left < HEADER_SIZE {
                // Pad to the next block.
                self.dst.write_all(&[0u8; HEADER_SIZE][0..space_left])?;
                self.current_block_offset = 0;
            }

            let avail_for_data = self.block_size - self.current_block_offset - HEADER_SIZE;
            let data_frag_len = record.len().min(avail_for_data);

            let recordtype = match (first_frag, data_frag_len == record.len()) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            written += self.emit_record(recordtype, record, data_frag_len)?;
            record = &record[data_frag_len..];
            first_frag = false;

            if record.is_empty() {
                return Ok(written);
            }
        }
    }

    fn emit_record(&mut self, t: RecordType, data: &[u8], len: usize) -> Result<usize> {
        assert!(len < 256 * 256);

        self.digest.reset();
        self.digest.write(&[t as u8]);
        self.digest.write(&data[0..len]);
        let chksum = mask_crc(self.digest.sum32());

        let mut s = 0;
        s += self.dst.write(&chksum.encode_fixed_vec())?;
        s += self.dst.write_fixedint(len as u16)?;
        s += self.dst.write(&[t as u8])?;
        s += self.dst.write(&data[0..len])?;

        self.current_block_offset += s;
        Ok(s)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.dst.flush()?;
        Ok(())
    }
}

impl<W: WritableFile> LogWriter<W> {
    /// Durability point: flushes buffers and syncs the underlying file.
    pub fn sync(&mut self) -> Result<()> {
        self.dst.sync()
    }
}

pub struct LogReader<R: Read> {
    src: R,
    digest: crc32::Digest,
    blk_off: usize,
    block_size: usize,
    head_scratch: [u8; HEADER_SIZE],
    checksums: bool,
}

impl<R: Read> LogReader<R> {
    pub fn new(src: R, checksums: bool) -> LogReader<R> {
        LogReader {
            src,
            blk_off: 0,
            block_size: BLOCK_SIZE,
            checksums,
            head_scratch: [0; HEADER_SIZE],
            digest: crc32::Digest::new(crc32::CASTAGNOLI),
        }
    }

    /// Reads the next complete record into dest. Returns the record's length; 0 signals the end
    /// of the log, including a torn trailing record.
    pub fn read(&mut self, dest: &mut Vec<u8>) -> Result<usize> {
        dest.clear();
        let mut dst_offset = 0;
        let mut in_record = false;

        loop {
            let remaining = self.block_size - self.blk_off;
            if remaining < HEADER_SIZE {
                // The rest of the block is filler; skip to the next block.
                let mut filler = [0u8; HEADER_SIZE];
                if read_full(&mut self.src, &mut filler[0..remaining])? < remaining {
                    return Ok(0);
                }
                self.blk_off = 0;
                continue;
            }

            let head_len = read_full(&mut self.src, &mut self.head_scratch)?;
            if head_len < HEADER_SIZE {
                // A clean end of file or a torn header; either way the log ends here.
                return Ok(0);
            }
            self.blk_off += head_len;

            let checksum = u32::decode_fixed(&self.head_scratch[0..4]).unwrap();
            let length = u16::decode_fixed(&self.head_scratch[4..6]).unwrap() as usize;
            let typ = self.head_scratch[6];

            dest.resize(dst_offset + length, 0);
            let n = read_full(&mut self.src, &mut dest[dst_offset..dst_offset + length])?;
            self.blk_off += n;
            if n < length {
                // Torn payload.
                dest.truncate(dst_offset);
                return Ok(0);
            }

            if self.checksums
                && !self.check_integrity(typ, &dest[dst_offset..dst_offset + length], checksum)
            {
                return err(StatusCode::Corruption, "checksum mismatch in log record");
            }
            dst_offset += length;

            match typ {
                t if t == RecordType::Full as u8 => {
                    if in_record {
                        return err(StatusCode::Corruption, "unexpected full record fragment");
                    }
                    return Ok(dst_offset);
                }
                t if t == RecordType::First as u8 => {
                    if in_record {
                        return err(StatusCode::Corruption, "unexpected first record fragment");
                    }
                    in_record = true;
                }
                t if t == RecordType::Middle as u8 || t == RecordType::Last as u8 => {
                    if !in_record {
                        return err(StatusCode::Corruption, "orphaned record fragment");
                    }
                    if t == RecordType::Last as u8 {
                        return Ok(dst_offset);
                    }
                }
                _ => return err(StatusCode::Corruption, "unknown record fragment type"),
            }
        }
    }

    fn check_integrity(&mut self, typ: u8, data: &[u8], expected: u32) -> bool {
        self.digest.reset();
        self.digest.write(&[typ]);
        self.digest.write(data);
        unmask_crc(expected) == self.digest.sum32()
    }
}

/// Reads until dst is full or the source is exhausted; returns the number of bytes read.
fn read_full<R: Read>(src: &mut R, dst: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < dst.len() {
        let n = src.read(&mut dst[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

const MASK_DELTA: u32 = 0xa282ead8;

pub fn mask_crc(c: u32) -> u32 {
    (c.wrapping_shr(15) | c.wrapping_shl(17)).wrapping_add(MASK_DELTA)
}

pub fn unmask_crc(mc: u32) -> u32 {
    let rot = mc.wrapping_sub(MASK_DELTA);
    rot.wrapping_shr(17) | rot.wrapping_shl(15)
}
