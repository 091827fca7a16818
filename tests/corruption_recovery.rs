//! End-to-end corruption-and-repair scenarios driving `Log` through its
//! public API only, without reaching into its internals.

use std::path::{Path, PathBuf};

use chainlog::Log;
use tempfile::TempDir;

// ── PRNG (xorshift64), for reproducible random-mutation corruption ──

struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0xDEAD_BEEF } else { seed })
    }
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
    fn next_range(&mut self, max: u64) -> u64 {
        self.next() % max
    }
}

fn backup_of(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".bak");
    PathBuf::from(s)
}

fn write_records(log: &mut Log, n: u32) {
    for i in 0..n {
        log.write(&i.to_be_bytes()).unwrap();
        log.force_commit().unwrap();
    }
}

#[test]
fn layout_after_two_writes_matches_exact_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let mut log = Log::new(&path);

    log.write(b"hello").unwrap();
    log.force_commit().unwrap();
    log.write(b"goodbye").unwrap();
    log.force_commit().unwrap();

    let on_disk = std::fs::read(&path).unwrap();
    let expected: Vec<u8> = vec![
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l',
        b'l', b'o', 0x00, 0x00, 0x00, 0x05, 0xb5, 0x71, 0x54, 0x7d, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x07, b'g', b'o', b'o', b'd', b'b', b'y', b'e', 0x00,
        0x00, 0x00, 0x07, 0x68, 0x66, 0x73, 0xc3,
    ];
    assert_eq!(on_disk, expected);
}

#[test]
fn reverse_read_of_one_thousand_small_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let mut log = Log::new(&path);
    write_records(&mut log, 1000);

    for expected in (0u32..1000).rev() {
        let got = log.read().unwrap().expect("record expected");
        assert_eq!(u32::from_be_bytes(got.try_into().unwrap()), expected);
    }
    assert_eq!(log.read().unwrap(), None);
}

#[test]
fn head_damage_recovers_from_backup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let backup = backup_of(&path);
    let mut log = Log::new(&path);
    write_records(&mut log, 10_000);
    log.close().unwrap();

    let pre_damage_backup = std::fs::read(&backup).unwrap();
    std::fs::remove_file(&path).unwrap();

    let mut log2 = Log::new(&path);
    log2.fix().unwrap();

    let repaired = std::fs::read(&path).unwrap();
    assert_eq!(repaired, pre_damage_backup);
}

#[test]
fn tail_damage_on_primary_is_repaired_from_backup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let backup = backup_of(&path);
    let mut log = Log::new(&path);
    write_records(&mut log, 10_000);
    log.close().unwrap();

    let pre_damage = std::fs::read(&path).unwrap();
    let mut primary_bytes = pre_damage.clone();
    let cut = primary_bytes.len() - 100;
    primary_bytes.truncate(cut);
    std::fs::write(&path, &primary_bytes).unwrap();

    let mut log2 = Log::new(&path);
    log2.fix().unwrap();

    let fixed_primary = std::fs::read(&path).unwrap();
    let fixed_backup = std::fs::read(&backup).unwrap();
    assert_eq!(fixed_primary, fixed_backup);
    assert_eq!(fixed_primary, pre_damage);
}

#[test]
fn random_mutation_of_primary_is_repaired_during_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let mut log = Log::new(&path);
    write_records(&mut log, 10_000);
    log.close().unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    let mut rng = Rng::new(20260728);
    for _ in 0..20 {
        let at = rng.next_range(bytes.len() as u64) as usize;
        bytes[at] ^= (rng.next() & 0xFF) as u8;
    }
    std::fs::write(&path, &bytes).unwrap();

    let mut log2 = Log::new(&path);
    for expected in (0u32..10_000).rev() {
        let got = log2.read().unwrap().expect("record expected after repair");
        assert_eq!(u32::from_be_bytes(got.try_into().unwrap()), expected);
    }
    assert_eq!(log2.read().unwrap(), None);
}

#[test]
fn both_files_damaged_but_overlapping_reconciles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let backup = backup_of(&path);
    let mut log = Log::new(&path);
    write_records(&mut log, 10_000);
    log.close().unwrap();

    let mut primary_bytes = std::fs::read(&path).unwrap();
    primary_bytes.drain(0..40);
    std::fs::write(&path, &primary_bytes).unwrap();

    let mut backup_bytes = std::fs::read(&backup).unwrap();
    let cut = backup_bytes.len() - 10;
    backup_bytes.truncate(cut);
    std::fs::write(&backup, &backup_bytes).unwrap();

    let mut log2 = Log::new(&path);
    log2.fix().unwrap();

    let fixed_primary = std::fs::read(&path).unwrap();
    let fixed_backup = std::fs::read(&backup).unwrap();
    assert_eq!(fixed_primary, fixed_backup);
}

#[test]
fn both_files_damaged_at_head_without_overlap_is_unrecoverable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let backup = backup_of(&path);
    let mut log = Log::new(&path);
    write_records(&mut log, 10_000);
    log.close().unwrap();

    let mut primary_bytes = std::fs::read(&path).unwrap();
    primary_bytes.drain(0..40);
    std::fs::write(&path, &primary_bytes).unwrap();

    let mut backup_bytes = std::fs::read(&backup).unwrap();
    backup_bytes.drain(0..40);
    std::fs::write(&backup, &backup_bytes).unwrap();

    let mut log2 = Log::new(&path);
    let err = log2.fix().unwrap_err();
    assert!(matches!(err, chainlog::GianError::Unrecoverable(_)));
}

#[test]
fn backward_scan_boundary_on_truncated_head() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log");
    let mut log = Log::new(&path);
    write_records(&mut log, 5);
    log.close().unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes.drain(0..2);
    std::fs::write(&path, &bytes).unwrap();

    let found = chainlog::repair::backward_load_to(&path, 1).unwrap();
    assert!(found.is_some());

    let missing = chainlog::repair::backward_load_to(&path, 0).unwrap();
    assert!(missing.is_none());
}
