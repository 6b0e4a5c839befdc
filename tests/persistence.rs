use kira_posdb::*;
use std::collections::HashMap;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

fn sample() -> Vec<MerPosition> {
    let mut out = Vec::new();
    let mut x = 0x9E37_79B9_7F4A_7C15u64;
    for i in 0..3_000u64 {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let mer = if i % 4 == 0 { (x >> 60) & 0xF } else { (x >> 24) & 0xFF_FFFF };
        out.push(MerPosition::new(mer, i));
    }
    out
}

fn build(cfg: &BuildConfig<'_>) -> PositionDb {
    PositionDb::build(&sample(), 12, cfg).unwrap()
}

#[test]
fn save_then_load_answers_identically() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("sample.posdb");
    let db = build(&BuildConfig::default().max_mismatch(1));
    db.save_state(&path)?;

    let loaded = PositionDb::load_state(&path, true, true)?;
    assert!(loaded.has_data());
    assert_eq!(loaded.counts(), db.counts());
    assert_eq!(loaded.table_bits(), db.table_bits());
    assert_eq!(loaded.max_mismatch(), 1);
    let mut state = Vec::new();
    loaded.print_state(&mut state)?;
    let mapped = String::from_utf8(state)?.contains("mappedImage:      true");
    assert_eq!(mapped, cfg!(target_endian = "little"));

    let mut a = Vec::new();
    let mut b = Vec::new();
    for mp in sample() {
        for mer in [mp.mer, mp.mer ^ 1] {
            assert_eq!(loaded.exists_exact(mer), db.exists_exact(mer));
            assert_eq!(loaded.count_exact(mer), db.count_exact(mer));
            assert_eq!(loaded.get_exact(mer, &mut a), db.get_exact(mer, &mut b));
            assert_eq!(a, b);
            loaded.get_up_to_n_mismatches(mer, 1, &mut a);
            db.get_up_to_n_mismatches(mer, 1, &mut b);
            assert_eq!(a, b);
        }
    }
    Ok(())
}

#[test]
fn filtered_index_round_trips() -> Result<(), Box<dyn std::error::Error>> {
    let file = NamedTempFile::new()?;
    let mut db = build(&BuildConfig::default());
    db.filter(2, u64::MAX);
    db.save_state(file.path())?;

    let loaded = PositionDb::load_state(file.path(), false, true)?;
    assert_eq!(loaded.counts(), db.counts());
    let mut model = HashMap::<u64, u64>::new();
    for mp in sample() {
        *model.entry(mp.mer).or_default() += 1;
    }
    for (mer, n) in model {
        assert_eq!(loaded.count_exact(mer), if n >= 2 { n } else { 0 });
    }
    Ok(())
}

#[test]
fn metadata_only_load_keeps_counters() -> Result<(), Box<dyn std::error::Error>> {
    let file = NamedTempFile::new()?;
    let db = build(&BuildConfig::default());
    db.save_state(file.path())?;

    let meta = PositionDb::load_state(file.path(), false, false)?;
    assert!(!meta.has_data());
    assert_eq!(meta.counts(), db.counts());
    assert_eq!(meta.mer_size(), 12);
    let mer = sample()[0].mer;
    assert!(!meta.exists_exact(mer));
    assert_eq!(meta.count_exact(mer), 0);
    assert_eq!(meta.memory_bytes(), 0);

    let mut out = Vec::new();
    meta.print_state(&mut out)?;
    assert!(String::from_utf8(out)?.contains("dataLoaded:       false"));

    // no data, nothing to save
    let err = meta.save_state(file.path()).unwrap_err();
    assert!(matches!(err, IndexError::Format(_)));
    Ok(())
}

#[test]
fn open_checks_build_parameters() -> Result<(), Box<dyn std::error::Error>> {
    let file = NamedTempFile::new()?;
    build(&BuildConfig::default().mer_skip(0)).save_state(file.path())?;

    let db = PositionDb::open(file.path(), 12, 0, 2, true)?;
    assert_eq!(db.max_mismatch(), 2);

    let err = PositionDb::open(file.path(), 11, 0, 0, true).unwrap_err();
    assert!(matches!(err, IndexError::Format(_)));
    let err = PositionDb::open(file.path(), 12, 3, 0, false).unwrap_err();
    assert!(matches!(err, IndexError::Format(_)));
    Ok(())
}

#[test]
fn damaged_images_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let file = NamedTempFile::new()?;
    build(&BuildConfig::default()).save_state(file.path())?;
    let bytes = std::fs::read(file.path())?;

    let missing = file.path().with_extension("missing");
    assert!(matches!(
        PositionDb::load_state(&missing, false, true),
        Err(IndexError::Io(_))
    ));

    // truncated body
    let cut = NamedTempFile::new()?;
    cut.as_file().write_all(&bytes[..bytes.len() - 8])?;
    assert!(matches!(
        PositionDb::load_state(cut.path(), false, true),
        Err(IndexError::Format(_))
    ));
    assert!(matches!(
        PositionDb::load_state(cut.path(), false, false),
        Err(IndexError::Format(_))
    ));

    // truncated header
    let stub = NamedTempFile::new()?;
    stub.as_file().write_all(&bytes[..40])?;
    assert!(matches!(
        PositionDb::load_state(stub.path(), false, true),
        Err(IndexError::Format(_))
    ));

    // bad magic
    let mut bad = bytes.clone();
    bad[0] ^= 0xFF;
    let magic = NamedTempFile::new()?;
    magic.as_file().write_all(&bad)?;
    assert!(matches!(
        PositionDb::load_state(magic.path(), false, true),
        Err(IndexError::Format(_))
    ));

    // bucket offsets overwritten in place
    let mut offs = bytes.clone();
    let at = HEADER_BYTES as usize + 16;
    offs[at..at + 8].fill(0xFF);
    let scrambled = NamedTempFile::new()?;
    scrambled.as_file().write_all(&offs)?;
    assert!(matches!(
        PositionDb::load_state(scrambled.path(), false, true),
        Err(IndexError::Format(_))
    ));

    // first list length overwritten in place
    let header = FileHeader::read_from(&mut bytes.as_slice())?;
    let words = |width: u32, len: u64| (width as u64 * len).div_ceil(64) as usize;
    let value = header.posn_width.max(header.pptr_width);
    let entry = 1 + header.chck_width + value;
    let lists = HEADER_BYTES as usize
        + 8 * (words(header.hash_width, header.offsets_len) + words(entry, header.number_of_entries));
    assert!(header.positions_len > 0);
    let mut list = bytes.clone();
    list[lists..lists + 8].fill(0xFF);
    let overlong = NamedTempFile::new()?;
    overlong.as_file().write_all(&list)?;
    assert!(matches!(
        PositionDb::load_state(overlong.path(), false, true),
        Err(IndexError::Format(_))
    ));
    // the header alone is still readable
    assert!(PositionDb::load_state(overlong.path(), false, false).is_ok());

    // mismatch budget the stored mer count cannot support
    let mut budget = bytes.clone();
    budget[52..56].copy_from_slice(&12u32.to_le_bytes());
    let greedy = NamedTempFile::new()?;
    greedy.as_file().write_all(&budget)?;
    assert!(matches!(
        PositionDb::load_state(greedy.path(), false, true),
        Err(IndexError::Format(_))
    ));

    // table size that disagrees with the stored shifts
    let mut geom = bytes.clone();
    let tb = u32::from_le_bytes(geom[16..20].try_into()?);
    geom[16..20].copy_from_slice(&(tb - 1).to_le_bytes());
    let mismatched = NamedTempFile::new()?;
    mismatched.as_file().write_all(&geom)?;
    assert!(matches!(
        PositionDb::load_state(mismatched.path(), false, true),
        Err(IndexError::Format(_))
    ));
    Ok(())
}

/// Claims more mers than it yields, as a streamed source sized up front would.
struct Padded(Vec<MerPosition>);

impl KeySource for Padded {
    type Keys<'a> = std::iter::Copied<std::slice::Iter<'a, MerPosition>>;

    fn keys(&self) -> Self::Keys<'_> {
        self.0.iter().copied()
    }

    fn approximate_len(&self) -> u64 {
        200_000
    }
}

#[test]
fn filtered_reload_keeps_mismatch_budget() -> Result<(), Box<dyn std::error::Error>> {
    let mut keys = Vec::new();
    for i in 0..40u64 {
        let mer = i.wrapping_mul(0x0123_4567) & 0xFFFF_FFFF;
        let copies = if i < 10 { 3 } else { 1 };
        for _ in 0..copies {
            keys.push(MerPosition::new(mer, keys.len() as u64));
        }
    }
    let source = Padded(keys);

    // 16-mers with 4 substitutions need ~164k patterns
    let mut db = PositionDb::build(&source, 16, &BuildConfig::default().max_mismatch(4))?;
    assert_eq!(db.max_mismatch(), 4);
    db.filter(2, u64::MAX);
    assert_eq!(db.counts().distinct, 10);

    let file = NamedTempFile::new()?;
    db.save_state(file.path())?;
    let loaded = PositionDb::load_state(file.path(), false, true)?;
    assert_eq!(loaded.max_mismatch(), 4);
    let reopened = PositionDb::open(file.path(), 16, 0, 4, true)?;
    assert_eq!(reopened.max_mismatch(), 4);

    let (mut a, mut b, mut c) = (Vec::new(), Vec::new(), Vec::new());
    for mp in &source.0 {
        let far = mp.mer ^ 0b11 ^ (0b10 << 8) ^ (0b01 << 20) ^ (0b11 << 30);
        for (mer, m) in [(mp.mer, 2), (far, 4), (far, 3)] {
            db.get_up_to_n_mismatches(mer, m, &mut a);
            loaded.get_up_to_n_mismatches(mer, m, &mut b);
            reopened.get_up_to_n_mismatches(mer, m, &mut c);
            assert_eq!(a, b);
            assert_eq!(a, c);
        }
    }
    // four substitutions away from a retained mer
    let kept = source.0[0].mer;
    let far = kept ^ 0b11 ^ (0b10 << 8) ^ (0b01 << 20) ^ (0b11 << 30);
    assert!(loaded.get_up_to_n_mismatches(far, 4, &mut b));
    assert!(b.contains(&0));
    Ok(())
}

#[test]
fn header_round_trips() -> std::io::Result<()> {
    let header = FileHeader {
        magic: POSDB_MAGIC,
        version: POSDB_VERSION,
        mer_size: 20,
        table_bits: 22,
        shift1: 18,
        shift2: 9,
        number_of_mers: 12345,
        approx_mers: 20000,
        ..FileHeader::default()
    };
    let mut buf = Vec::new();
    header.write_to(&mut buf)?;
    assert_eq!(buf.len() as u64, HEADER_BYTES);
    assert_eq!(FileHeader::read_from(&mut buf.as_slice())?, header);
    Ok(())
}
