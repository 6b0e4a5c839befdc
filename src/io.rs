//! On-disk image: fixed header + three word sections.
//!
//! ```text
//! header   (HEADER_BYTES, little-endian integers)
//! offsets  bucket offsets, hash width bits each, table + 1 values
//! entries  packed entries
//! positions position lists
//! ```
//! Sections are whole `u64` words stored little-endian, so every section
//! starts 8-byte aligned and loads as a view into the mapped file. The image
//! is versioned by its build parameters: the loader re-derives the codec and
//! rejects any geometry it disagrees with.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::bits::BitPackedArray;
use crate::codec::KeyCodec;
use crate::index::{IndexError, MerCounts, PositionDb, Widths};
use crate::mismatch::MismatchMatcher;

pub const POSDB_MAGIC: u32 = 0x50_44_42_31; // "PDB1"
pub const POSDB_VERSION: u32 = 1;

/// Size of [`FileHeader`] on disk.
pub const HEADER_BYTES: u64 = 128;

const FLAG_EXTERNAL_COUNTS: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub mer_size: u32,
    pub mer_skip: u32,
    pub table_bits: u32,
    pub shift1: u32,
    pub shift2: u32,
    pub hash_width: u32,
    pub chck_width: u32,
    pub posn_width: u32,
    pub pptr_width: u32,
    pub list_width: u32,
    pub flags: u32,
    pub max_mismatch: u32,
    pub reserved0: u32,
    pub number_of_mers: u64,
    pub number_of_positions: u64,
    pub number_of_distinct: u64,
    pub number_of_unique: u64,
    pub number_of_entries: u64,
    pub offsets_len: u64,
    pub positions_len: u64,
    /// Approximate mer count the build was sized for; fixes the mismatch
    /// pattern budget across reloads.
    pub approx_mers: u64,
}

impl FileHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LE>(self.magic)?;
        w.write_u32::<LE>(self.version)?;
        w.write_u32::<LE>(self.mer_size)?;
        w.write_u32::<LE>(self.mer_skip)?;
        w.write_u32::<LE>(self.table_bits)?;
        w.write_u32::<LE>(self.shift1)?;
        w.write_u32::<LE>(self.shift2)?;
        w.write_u32::<LE>(self.hash_width)?;
        w.write_u32::<LE>(self.chck_width)?;
        w.write_u32::<LE>(self.posn_width)?;
        w.write_u32::<LE>(self.pptr_width)?;
        w.write_u32::<LE>(self.list_width)?;
        w.write_u32::<LE>(self.flags)?;
        w.write_u32::<LE>(self.max_mismatch)?;
        w.write_u32::<LE>(self.reserved0)?;
        w.write_u32::<LE>(0)?; // pad to 8
        w.write_u64::<LE>(self.number_of_mers)?;
        w.write_u64::<LE>(self.number_of_positions)?;
        w.write_u64::<LE>(self.number_of_distinct)?;
        w.write_u64::<LE>(self.number_of_unique)?;
        w.write_u64::<LE>(self.number_of_entries)?;
        w.write_u64::<LE>(self.offsets_len)?;
        w.write_u64::<LE>(self.positions_len)?;
        w.write_u64::<LE>(self.approx_mers)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let magic = r.read_u32::<LE>()?;
        let version = r.read_u32::<LE>()?;
        let mer_size = r.read_u32::<LE>()?;
        let mer_skip = r.read_u32::<LE>()?;
        let table_bits = r.read_u32::<LE>()?;
        let shift1 = r.read_u32::<LE>()?;
        let shift2 = r.read_u32::<LE>()?;
        let hash_width = r.read_u32::<LE>()?;
        let chck_width = r.read_u32::<LE>()?;
        let posn_width = r.read_u32::<LE>()?;
        let pptr_width = r.read_u32::<LE>()?;
        let list_width = r.read_u32::<LE>()?;
        let flags = r.read_u32::<LE>()?;
        let max_mismatch = r.read_u32::<LE>()?;
        let reserved0 = r.read_u32::<LE>()?;
        let _pad = r.read_u32::<LE>()?;
        Ok(FileHeader {
            magic,
            version,
            mer_size,
            mer_skip,
            table_bits,
            shift1,
            shift2,
            hash_width,
            chck_width,
            posn_width,
            pptr_width,
            list_width,
            flags,
            max_mismatch,
            reserved0,
            number_of_mers: r.read_u64::<LE>()?,
            number_of_positions: r.read_u64::<LE>()?,
            number_of_distinct: r.read_u64::<LE>()?,
            number_of_unique: r.read_u64::<LE>()?,
            number_of_entries: r.read_u64::<LE>()?,
            offsets_len: r.read_u64::<LE>()?,
            positions_len: r.read_u64::<LE>()?,
            approx_mers: r.read_u64::<LE>()?,
        })
    }

    fn widths(&self) -> Widths {
        Widths {
            hash: self.hash_width,
            chck: self.chck_width,
            posn: self.posn_width,
            pptr: self.pptr_width,
            list: self.list_width,
        }
    }

    fn counts(&self) -> MerCounts {
        MerCounts {
            mers: self.number_of_mers,
            positions: self.number_of_positions,
            distinct: self.number_of_distinct,
            unique: self.number_of_unique,
            entries: self.number_of_entries,
        }
    }

    /// Word counts of the offsets, entries and positions sections.
    fn section_words(&self) -> [usize; 3] {
        let w = self.widths();
        [
            BitPackedArray::words_for(w.hash, self.offsets_len),
            BitPackedArray::words_for(w.entry(), self.number_of_entries),
            BitPackedArray::words_for(w.list, self.positions_len),
        ]
    }

    fn image_bytes(&self) -> u64 {
        self.section_words()
            .iter()
            .fold(HEADER_BYTES, |acc, &n| acc.saturating_add((n as u64).saturating_mul(8)))
    }

    /// Check magic, version and that the stored geometry is the one the codec
    /// derives for these parameters.
    fn validate(&self) -> Result<KeyCodec, IndexError> {
        if self.magic != POSDB_MAGIC {
            return Err(IndexError::Format("bad magic".into()));
        }
        if self.version != POSDB_VERSION {
            return Err(IndexError::Format(format!("unsupported version {}", self.version)));
        }
        let codec = KeyCodec::new(self.mer_size, self.table_bits)
            .map_err(|e| IndexError::Format(format!("stored geometry rejected: {e}")))?;
        if codec.shifts() != (self.shift1, self.shift2) {
            return Err(IndexError::Format(format!(
                "shifts ({}, {}) do not match {}-mers with tableBits={}",
                self.shift1, self.shift2, self.mer_size, self.table_bits
            )));
        }
        let w = self.widths();
        if w.chck != codec.check_width() {
            return Err(IndexError::Format(format!(
                "check width {} does not match the codec's {}",
                w.chck,
                codec.check_width()
            )));
        }
        let in_range = |b: u32| (1..=64).contains(&b);
        if ![w.hash, w.posn, w.pptr, w.list].into_iter().all(in_range) || w.entry() > 64 {
            return Err(IndexError::Format("field widths out of range".into()));
        }
        if self.offsets_len != codec.table_entries() + 1 {
            return Err(IndexError::Format(format!(
                "{} bucket offsets for a table of {}",
                self.offsets_len,
                codec.table_entries()
            )));
        }
        if self.max_mismatch > 0
            && MismatchMatcher::supported_errors(self.mer_size, self.max_mismatch, self.approx_mers)
                != self.max_mismatch
        {
            return Err(IndexError::Format(format!(
                "mismatch budget {} exceeds the pattern budget for ~{} mers",
                self.max_mismatch, self.approx_mers
            )));
        }
        Ok(codec)
    }
}

impl PositionDb {
    /// Write the whole index as one image.
    pub fn save_state(&self, path: &Path) -> Result<(), IndexError> {
        if !self.data_loaded {
            return Err(IndexError::Format(
                "metadata-only index has no data to save".into(),
            ));
        }
        let (shift1, shift2) = self.codec.shifts();
        let header = FileHeader {
            magic: POSDB_MAGIC,
            version: POSDB_VERSION,
            mer_size: self.mer_size,
            mer_skip: self.mer_skip,
            table_bits: self.codec.table_bits(),
            shift1,
            shift2,
            hash_width: self.widths.hash,
            chck_width: self.widths.chck,
            posn_width: self.widths.posn,
            pptr_width: self.widths.pptr,
            list_width: self.widths.list,
            flags: if self.has_counts { FLAG_EXTERNAL_COUNTS } else { 0 },
            max_mismatch: self.matcher.errors_allowed(),
            reserved0: 0,
            number_of_mers: self.counts.mers,
            number_of_positions: self.counts.positions,
            number_of_distinct: self.counts.distinct,
            number_of_unique: self.counts.unique,
            number_of_entries: self.entries.len(),
            offsets_len: self.offsets.len(),
            positions_len: self.positions.len(),
            approx_mers: self.approx_mers,
        };

        let mut w = BufWriter::new(File::create(path)?);
        header.write_to(&mut w)?;
        for section in [&self.offsets, &self.entries, &self.positions] {
            write_words(&mut w, section.words())?;
        }
        w.flush()?;
        log::debug!(
            "saved {} ({} bytes)",
            path.display(),
            header.image_bytes()
        );
        Ok(())
    }

    /// Read an image written by [`save_state`](Self::save_state).
    ///
    /// With `load_data = false` only the header and counters are read; the
    /// returned index reports its counters but answers every query with
    /// "not found".
    pub fn load_state(path: &Path, be_noisy: bool, load_data: bool) -> Result<Self, IndexError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_BYTES {
            return Err(IndexError::Format(format!(
                "{} is truncated ({file_len} bytes)",
                path.display()
            )));
        }

        let mut reader = BufReader::new(file);
        let header = FileHeader::read_from(&mut reader)?;
        let codec = header.validate()?;
        if file_len != header.image_bytes() {
            return Err(IndexError::Format(format!(
                "{} holds {file_len} bytes, header describes {}",
                path.display(),
                header.image_bytes()
            )));
        }

        let widths = header.widths();
        let mut db = PositionDb {
            mer_size: header.mer_size,
            mer_skip: header.mer_skip,
            codec,
            widths,
            has_counts: header.flags & FLAG_EXTERNAL_COUNTS != 0,
            offsets: BitPackedArray::default(),
            entries: BitPackedArray::default(),
            positions: BitPackedArray::default(),
            data_loaded: false,
            counts: header.counts(),
            approx_mers: header.approx_mers,
            matcher: MismatchMatcher::exact(),
        };

        if load_data {
            let file = reader.into_inner();
            let map = Arc::new(unsafe { memmap2::MmapOptions::new().map(&file)? });
            let [n_off, n_ent, n_pos] = header.section_words();
            let mut at = HEADER_BYTES as usize;
            let mut section = |width: u32, len: u64, n: usize| -> Result<BitPackedArray, IndexError> {
                let start = at;
                at += 8 * n;
                let array = if cfg!(target_endian = "little") {
                    BitPackedArray::from_mapped(width, len, map.clone(), start)
                } else {
                    BitPackedArray::from_words(width, len, read_words(&map[start..at])?)
                };
                array.ok_or_else(|| IndexError::Cast(format!("section at byte {start} is not word aligned")))
            };
            db.offsets = section(widths.hash, header.offsets_len, n_off)?;
            db.entries = section(widths.entry(), header.number_of_entries, n_ent)?;
            db.positions = section(widths.list, header.positions_len, n_pos)?;

            db.check_structure()?;
            db.data_loaded = true;
            if header.max_mismatch > 0 {
                db.matcher = MismatchMatcher::new(
                    &db.codec,
                    db.mer_size,
                    header.max_mismatch,
                    header.approx_mers,
                );
            }
        }

        progress!(
            be_noisy,
            "loaded {}: {}-mers, tableBits={}, {} distinct mers{}",
            path.display(),
            db.mer_size,
            db.codec.table_bits(),
            db.counts.distinct,
            if load_data { "" } else { " (metadata only)" }
        );
        Ok(db)
    }

    /// Load an image and check it was built with `mer_size` and `mer_skip`.
    /// The mismatch matcher is prepared for `max_mismatch` substitutions.
    pub fn open(
        path: &Path,
        mer_size: u32,
        mer_skip: u32,
        max_mismatch: u32,
        load_data: bool,
    ) -> Result<Self, IndexError> {
        let mut db = Self::load_state(path, false, load_data)?;
        if db.mer_size != mer_size {
            return Err(IndexError::Format(format!(
                "{} holds {}-mers, expected {mer_size}-mers",
                path.display(),
                db.mer_size
            )));
        }
        if db.mer_skip != mer_skip {
            return Err(IndexError::Format(format!(
                "{} was built with merSkip={}, expected {mer_skip}",
                path.display(),
                db.mer_skip
            )));
        }
        if load_data {
            db.matcher = if max_mismatch > 0 {
                MismatchMatcher::new(&db.codec, mer_size, max_mismatch, db.approx_mers)
            } else {
                MismatchMatcher::exact()
            };
        }
        Ok(db)
    }
}

impl PositionDb {
    /// Bounds-check a freshly loaded image: bucket offsets non-decreasing up
    /// to the entry count, every list inside the position array.
    fn check_structure(&self) -> Result<(), IndexError> {
        let table = self.codec.table_entries();
        let n_entries = self.entries.len();
        if self.offsets.get(0) != 0 {
            return Err(IndexError::Format("first bucket offset is not zero".into()));
        }
        let mut prev = 0u64;
        for b in 1..=table {
            let o = self.offsets.get(b);
            if o < prev || o > n_entries {
                return Err(IndexError::Format(format!(
                    "bucket offset {b} ({o}) out of order or past {n_entries} entries"
                )));
            }
            prev = o;
        }
        if prev != n_entries {
            return Err(IndexError::Format(
                "bucket offsets do not cover the entries".into(),
            ));
        }

        let header = self.header_slots();
        let slots = self.positions.len();
        for i in 0..n_entries {
            let e = self.entries.get(i);
            if self.entry_unique(e) {
                continue;
            }
            let ptr = self.entry_value(e);
            let fits = match ptr.checked_add(header) {
                Some(first) if first <= slots => {
                    let len = self.positions.get(ptr);
                    len > 0 && first.checked_add(len).is_some_and(|end| end <= slots)
                }
                _ => false,
            };
            if !fits {
                return Err(IndexError::Format(format!(
                    "entry {i} points outside the {slots} position slots"
                )));
            }
        }
        Ok(())
    }
}

fn write_words<W: Write>(w: &mut W, words: &[u64]) -> std::io::Result<()> {
    if cfg!(target_endian = "little") {
        w.write_all(bytemuck::cast_slice::<u64, u8>(words))
    } else {
        for &x in words {
            w.write_u64::<LE>(x)?;
        }
        Ok(())
    }
}

fn read_words(bytes: &[u8]) -> Result<Vec<u64>, IndexError> {
    let words: &[u64] =
        bytemuck::try_cast_slice(bytes).map_err(|e| IndexError::Cast(format!("{e:?}")))?;
    Ok(words.iter().map(|&x| u64::from_le(x)).collect())
}
