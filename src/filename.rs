//! On-disk file naming. The forms are part of the storage format; readers
//! of existing stores depend on them bit-for-bit.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log,
    Table,
    Descriptor,
    Current,
    DbLock,
    InfoLog,
    Temp,
}

/// `<db>/<N>.log`
pub fn log_file_name(db: &Path, number: u64) -> PathBuf {
    make_file_name(db, number, "log")
}

/// `<db>/<N>.ldb`
pub fn table_file_name(db: &Path, number: u64) -> PathBuf {
    make_file_name(db, number, "ldb")
}

/// `<db>/<N>.sst`, the historical table suffix, still readable.
pub fn sst_table_file_name(db: &Path, number: u64) -> PathBuf {
    make_file_name(db, number, "sst")
}

/// `<db>/MANIFEST-<N>`
pub fn descriptor_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("MANIFEST-{number:06}"))
}

/// `<db>/CURRENT`
pub fn current_file_name(db: &Path) -> PathBuf {
    db.join("CURRENT")
}

/// `<db>/LOCK`
pub fn lock_file_name(db: &Path) -> PathBuf {
    db.join("LOCK")
}

/// `<db>/LOG`
pub fn info_log_file_name(db: &Path) -> PathBuf {
    db.join("LOG")
}

/// `<db>/LOG.old`
pub fn old_info_log_file_name(db: &Path) -> PathBuf {
    db.join("LOG.old")
}

/// `<db>/<N>.dbtemp`
pub fn temp_file_name(db: &Path, number: u64) -> PathBuf {
    make_file_name(db, number, "dbtemp")
}

fn make_file_name(db: &Path, number: u64, suffix: &str) -> PathBuf {
    db.join(format!("{number:06}.{suffix}"))
}

/// Decodes a bare file name back into its number and type. Owned files
/// only; anything else returns `None`.
pub fn parse_file_name(name: &str) -> Option<(u64, FileType)> {
    match name {
        "CURRENT" => return Some((0, FileType::Current)),
        "LOCK" => return Some((0, FileType::DbLock)),
        "LOG" | "LOG.old" => return Some((0, FileType::InfoLog)),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = parse_number(rest)?;
        return Some((number, FileType::Descriptor));
    }

    let (stem, suffix) = name.rsplit_once('.')?;
    let number = parse_number(stem)?;
    let ty = match suffix {
        "log" => FileType::Log,
        "ldb" | "sst" => FileType::Table,
        "dbtemp" => FileType::Temp,
        _ => return None,
    };
    Some((number, ty))
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
