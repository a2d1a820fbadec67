//! FAT directory management: traversal across clusters and the fixed
//! FAT12/16 root area, 8.3 short-name matching, VFAT long-name chains,
//! short-name synthesis with numeric tails, and slot allocation.

use crate::errors::{FsError, FsResult};
use crate::fat::desc::*;
use crate::fat::fs::{FatFs, Loc};
use crate::fspath;
use crate::ucs2;
use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes};

/// Longest long name in UCS-2 code units.
pub const FAT_MAX_LONGNAME: usize = 255;

/// Where a 32-byte directory record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DentryPos {
    pub loc: Loc,
    /// Byte offset within the record.
    pub offset: u32,
}

/// A located directory entry. `pos` is None only for the synthesized
/// root-directory entry, which exists nowhere on disk.
#[derive(Debug, Clone)]
pub struct DentryRef {
    pub dentry: FatDentry,
    pub pos: Option<DentryPos>,
    pub long_pos: Option<DentryPos>,
}

/// Make up a dentry for the root directory.
pub fn root_dentry(fs: &FatFs) -> FatDentry {
    let mut ent = FatDentry::default();
    ent.attr = FAT_ATTR_DIRECTORY;
    if let Loc::Cluster(cl) = fs.root_loc() {
        ent.set_first_cluster(cl);
    }
    ent
}

/// Data start of a located entry; None for an empty file that owns no
/// clusters yet.
pub fn dentry_start_loc(fs: &FatFs, r: &DentryRef) -> Option<Loc> {
    if r.pos.is_none() {
        return Some(fs.root_loc());
    }
    let cl = r.dentry.first_cluster();
    if cl >= 2 {
        Some(Loc::Cluster(cl))
    } else {
        None
    }
}

/// Cursor over the 32-byte records of a directory, following the FAT
/// chain for cluster directories and bounded by the entry count for the
/// fixed FAT12/16 root area.
#[derive(Debug, Clone)]
pub(crate) struct DirWalker {
    pub loc: Loc,
    /// Entry index within the current record.
    pub entry: u32,
    per_rec: u32,
    /// Entries visited so far (bounds the fixed root area).
    scanned: u32,
}

impl DirWalker {
    pub fn new(fs: &FatFs, start: Loc) -> Self {
        Self {
            loc: start,
            entry: 0,
            per_rec: fs.dentries_per_record(start),
            scanned: 0,
        }
    }

    /// Resume at a known position.
    pub fn at(fs: &FatFs, pos: DentryPos) -> Self {
        let per_rec = fs.dentries_per_record(pos.loc);
        let entry = pos.offset / FAT_DENTRY_SIZE as u32;
        let scanned = match pos.loc {
            Loc::Sector(s) => (s - fs.sb.root_dir_sector) * per_rec + entry,
            Loc::Cluster(_) => entry,
        };
        Self {
            loc: pos.loc,
            entry,
            per_rec,
            scanned,
        }
    }

    pub fn pos(&self) -> DentryPos {
        DentryPos {
            loc: self.loc,
            offset: self.entry * FAT_DENTRY_SIZE as u32,
        }
    }

    pub fn read(&self, fs: &mut FatFs) -> FsResult<FatDentry> {
        let off = (self.entry as usize) * FAT_DENTRY_SIZE;
        let buf = fs.record(self.loc)?;
        FatDentry::read_from(&buf[off..off + FAT_DENTRY_SIZE]).ok_or(FsError::Corrupt)
    }

    pub fn read_long(&self, fs: &mut FatFs) -> FsResult<FatLongName> {
        let off = (self.entry as usize) * FAT_DENTRY_SIZE;
        let buf = fs.record(self.loc)?;
        FatLongName::read_from(&buf[off..off + FAT_DENTRY_SIZE]).ok_or(FsError::Corrupt)
    }

    /// Step to the next record slot. Returns false at the end of the
    /// directory's allocated space.
    pub fn advance(&mut self, fs: &mut FatFs) -> FsResult<bool> {
        self.scanned += 1;
        self.entry += 1;
        if self.entry == self.per_rec {
            match fs.next_dir_loc(self.loc, self.scanned)? {
                Some(next) => {
                    self.loc = next;
                    self.entry = 0;
                }
                None => {
                    self.entry -= 1;
                    self.scanned -= 1;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn write_bytes_at(fs: &mut FatFs, pos: DentryPos, bytes: &[u8]) -> FsResult<()> {
    let off = pos.offset as usize;
    let buf = fs.record(pos.loc)?;
    buf[off..off + bytes.len()].copy_from_slice(bytes);
    fs.mark_record_dirty(pos.loc)
}

pub fn get_dentry(fs: &mut FatFs, pos: DentryPos) -> FsResult<FatDentry> {
    let off = pos.offset as usize;
    let buf = fs.record(pos.loc)?;
    FatDentry::read_from(&buf[off..off + FAT_DENTRY_SIZE]).ok_or(FsError::Corrupt)
}

/// Write a (possibly modified) entry back in place.
pub fn update_dentry(fs: &mut FatFs, ent: &FatDentry, pos: DentryPos) -> FsResult<()> {
    write_bytes_at(fs, pos, ent.as_bytes())
}

/// Fill in a fresh short entry with creation timestamps.
pub fn make_raw_dentry(shortname: &[u8; 11], attr: u8, cluster: u32) -> FatDentry {
    let mut ent = FatDentry::default();
    ent.name = *shortname;
    ent.attr = attr;
    ent.set_first_cluster(cluster);
    fill_create_timestamps(&mut ent);
    ent
}

/* Short-name handling. */

/// Uppercase, space-padded 8.3 form of a name already known to satisfy
/// the short-name rules.
pub fn normalize_shortname(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let bytes = name.as_bytes();
    let dot = name.rfind('.');
    let base_end = dot.unwrap_or(bytes.len());

    for (i, &b) in bytes[..base_end.min(8)].iter().enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    if let Some(dot) = dot {
        for (i, &b) in bytes[dot + 1..].iter().take(3).enumerate() {
            out[8 + i] = b.to_ascii_uppercase();
        }
    }
    out
}

/// Whether a path component already fits the 8.3 rules and can live as a
/// bare short entry.
pub fn is_component_short(name: &str) -> bool {
    let bytes = name.as_bytes();
    let l = bytes.len();
    // 8.3 means at most 12 characters with the dot.
    if l > 12 || l == 0 {
        return false;
    }
    if bytes[0] == b'.' {
        return false;
    }
    let dot = name.rfind('.');
    match dot {
        Some(d) => {
            if d > 8 {
                return false;
            }
            // Extension longer than three characters.
            if l - d > 4 {
                return false;
            }
        }
        None => {
            if l > 8 {
                return false;
            }
        }
    }
    let mut dots = 0;
    for &b in bytes {
        match b {
            b'+' | b',' | b';' | b'[' | b']' | b' ' | b'=' => return false,
            b'*' | b':' | b'/' | b'\\' | b'|' | b'"' | b'?' | b'<' | b'>' => return false,
            b'.' => dots += 1,
            _ if b > 0x7F => return false,
            _ => {}
        }
    }
    dots <= 1
}

/// Restore the displayable form of an on-disk short name.
pub fn copy_shortname(ent: &FatDentry) -> String {
    let mut out = Vec::with_capacity(12);
    for &b in ent.name[..8].iter() {
        if b == b' ' {
            break;
        }
        out.push(b);
    }
    if ent.name[8] != b' ' {
        out.push(b'.');
        for &b in ent.name[8..].iter() {
            if b == b' ' {
                break;
            }
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Derive the 8.3 name for a long-named file: uppercase ASCII with
/// illegal-in-short characters mapped to `_`, truncated to 8+3, plus a
/// `~N` tail chosen to dodge every existing entry in the directory.
pub fn create_shortname(
    fs: &mut FatFs,
    name: &str,
    parent_start: Loc,
) -> FsResult<[u8; 11]> {
    let bytes = name.as_bytes();
    let mut fnc: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut has_ext = 0u8;
    let mut last_period: Option<usize> = None;
    let mut found_char = false;

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b <= b' ' {
            // Spaces and control characters drop out entirely.
            i += 1;
        } else if matches!(b, b'*' | b':' | b'/' | b'\\' | b'|' | b'"' | b'?' | b'<' | b'>') {
            // Not legal even in a long name.
            return Err(FsError::IllegalSeq);
        } else if matches!(b, b'+' | b',' | b';' | b'[' | b']' | b'=') {
            fnc.push(b'_');
            found_char = true;
            if has_ext == 1 {
                has_ext = 2;
            }
            i += 1;
        } else if b == b'.' {
            if found_char {
                has_ext = 1;
                last_period = Some(fnc.len());
                fnc.push(b'.');
            }
            i += 1;
        } else if b <= 0x7F {
            fnc.push(b.to_ascii_uppercase());
            found_char = true;
            if has_ext == 1 {
                has_ext = 2;
            }
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            fnc.push(b'_');
            found_char = true;
            if has_ext == 1 {
                has_ext = 2;
            }
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            fnc.push(b'_');
            found_char = true;
            if has_ext == 1 {
                has_ext = 2;
            }
            i += 3;
        } else {
            // A 4-byte sequence cannot be a UCS-2 long name either.
            return Err(FsError::IllegalSeq);
        }
    }

    // Basis name: up to eight characters before the last period, then up
    // to three after it.
    let mut denorm: Vec<u8> = Vec::with_capacity(12);
    let base_end = last_period.unwrap_or(fnc.len());
    for &b in fnc[..base_end].iter() {
        if b != b'.' && denorm.len() < 8 {
            denorm.push(b);
        }
    }
    if has_ext != 0 {
        denorm.push(b'.');
        if let Some(p) = last_period {
            for &b in fnc[p + 1..].iter().take(3) {
                denorm.push(b);
            }
        }
    }

    let mut out = normalize_shortname(std::str::from_utf8(&denorm).unwrap_or(""));

    // Numeric tail: digits grow leftward from position 7 as N widens.
    for tail in 1u32..1_000_000 {
        let digits = tail.to_string();
        let start = 8 - digits.len() - 1;
        out[start] = b'~';
        for (i, d) in digits.bytes().enumerate() {
            out[start + 1 + i] = d;
        }
        if search_dir(fs, &out, parent_start)?.is_none() {
            debug!("short name {:?}", String::from_utf8_lossy(&out));
            return Ok(out);
        }
    }
    Err(FsError::NoSpace)
}

/* Directory search. */

/// Scan for an exact 11-byte short name. Returns the entry and where it
/// lives.
pub fn search_dir(
    fs: &mut FatFs,
    name: &[u8; 11],
    start: Loc,
) -> FsResult<Option<(FatDentry, DentryPos)>> {
    let mut w = DirWalker::new(fs, start);
    loop {
        let ent = w.read(fs)?;
        if ent.name[0] == FAT_ENTRY_EOD {
            return Ok(None);
        }
        if ent.name[0] != FAT_ENTRY_FREE && !ent.is_long_name() && ent.name == *name {
            return Ok(Some((ent, w.pos())));
        }
        if !w.advance(fs)? {
            return Ok(None);
        }
    }
}

/// Look up a long name. The name is matched case-insensitively against
/// reconstructed long-name chains; on success the short entry that
/// terminates the chain is returned along with both positions.
pub fn search_long(
    fs: &mut FatFs,
    name: &str,
    start: Loc,
) -> FsResult<Option<(FatDentry, DentryPos, DentryPos)>> {
    let target = ucs2::utf8_to_ucs2(name.as_bytes())?;
    if target.is_empty() || target.len() > FAT_MAX_LONGNAME {
        return Err(FsError::NameTooLong);
    }
    let mut target_lc = target.clone();
    ucs2::ucs2_tolower(&mut target_lc);

    let mut w = DirWalker::new(fs, start);
    let mut skip = 0u32;

    loop {
        let ent = w.read(fs)?;

        if skip > 0 {
            skip -= 1;
        } else if ent.name[0] == FAT_ENTRY_EOD {
            return Ok(None);
        } else if ent.name[0] != FAT_ENTRY_FREE && ent.is_long_name() {
            let lent = w.read_long(fs)?;
            if lent.is_last() {
                let count = lent.position() as usize;
                if count == 0 || count * FAT_LONGNAME_SEGMENT > FAT_MAX_LONGNAME + 13 {
                    warn!("implausible long-name chain length {}", count);
                } else if target.len() > count * FAT_LONGNAME_SEGMENT {
                    // Too short to match; skip the whole chain.
                    skip = count as u32;
                } else {
                    let long_pos = w.pos();
                    match read_longname_chain(fs, &mut w, &lent, count)? {
                        Some(reconstructed) => {
                            let len = ucs2::strlen_ucs2(&reconstructed);
                            let mut lowered = reconstructed[..len].to_vec();
                            ucs2::ucs2_tolower(&mut lowered);
                            if lowered == target_lc {
                                // The short entry follows the chain.
                                if !w.advance(fs)? {
                                    return Err(FsError::Corrupt);
                                }
                                let short = w.read(fs)?;
                                if short.name[0] == FAT_ENTRY_EOD
                                    || short.name[0] == FAT_ENTRY_FREE
                                {
                                    return Ok(None);
                                }
                                return Ok(Some((short, w.pos(), long_pos)));
                            }
                        }
                        None => return Err(FsError::Corrupt),
                    }
                }
            }
        }

        if !w.advance(fs)? {
            return Ok(None);
        }
    }
}

/// Walk the remaining records of a long-name chain (orders count-1 down
/// to 1), assembling the full UCS-2 name. The walker ends on the order-1
/// record.
fn read_longname_chain(
    fs: &mut FatFs,
    w: &mut DirWalker,
    last: &FatLongName,
    count: usize,
) -> FsResult<Option<Vec<u16>>> {
    let mut buf = vec![0u16; count * FAT_LONGNAME_SEGMENT + 1];
    buf[(count - 1) * FAT_LONGNAME_SEGMENT..count * FAT_LONGNAME_SEGMENT]
        .copy_from_slice(&last.segment());

    let mut expect = count - 1;
    while expect > 0 {
        if !w.advance(fs)? {
            return Ok(None);
        }
        let ent = w.read(fs)?;
        if ent.name[0] == FAT_ENTRY_EOD || ent.name[0] == FAT_ENTRY_FREE || !ent.is_long_name() {
            // A broken chain in the middle of a long name.
            return Ok(None);
        }
        let lent = w.read_long(fs)?;
        let pos = lent.position() as usize;
        if pos != expect {
            return Ok(None);
        }
        buf[(pos - 1) * FAT_LONGNAME_SEGMENT..pos * FAT_LONGNAME_SEGMENT]
            .copy_from_slice(&lent.segment());
        expect -= 1;
    }
    Ok(Some(buf))
}

/// Find `name` in the directory starting at `start`, via the short or
/// long path as the name demands.
pub fn find_child(fs: &mut FatFs, name: &str, start: Loc) -> FsResult<Option<DentryRef>> {
    if is_component_short(name) {
        let comp = normalize_shortname(name);
        Ok(search_dir(fs, &comp, start)?.map(|(dentry, pos)| DentryRef {
            dentry,
            pos: Some(pos),
            long_pos: None,
        }))
    } else {
        Ok(search_long(fs, name, start)?.map(|(dentry, pos, long_pos)| DentryRef {
            dentry,
            pos: Some(pos),
            long_pos: Some(long_pos),
        }))
    }
}

/// Resolve a whole path from the root.
pub fn find_dentry(fs: &mut FatFs, path: &str) -> FsResult<DentryRef> {
    let comps: Vec<&str> = fspath::components(path).collect();
    if comps.is_empty() {
        return Ok(DentryRef {
            dentry: root_dentry(fs),
            pos: None,
            long_pos: None,
        });
    }

    let mut cur = fs.root_loc();
    let mut found: Option<DentryRef> = None;
    for comp in comps.iter() {
        if let Some(prev) = &found {
            if !prev.dentry.is_dir() {
                return Err(FsError::NotDir);
            }
            let cl = prev.dentry.first_cluster();
            if !fs.cluster_in_range(cl) {
                return Err(FsError::Corrupt);
            }
            cur = Loc::Cluster(cl);
        }
        let child = find_child(fs, comp, cur)?.ok_or(FsError::NoEntry)?;
        found = Some(child);
    }

    let found = found.unwrap();
    if fspath::names_directory(path) && !found.dentry.is_dir() {
        return Err(FsError::NotDir);
    }
    Ok(found)
}

/* Entry removal and emptiness. */

/// Tombstone an entry and its whole long-name chain.
pub fn erase_dentry(fs: &mut FatFs, r: &DentryRef) -> FsResult<()> {
    let pos = r.pos.ok_or(FsError::InvalidArg)?;
    let free = [FAT_ENTRY_FREE];
    write_bytes_at(fs, pos, &free)?;

    if let Some(long_pos) = r.long_pos {
        let mut w = DirWalker::at(fs, long_pos);
        loop {
            let ent = w.read(fs)?;
            if ent.name[0] == FAT_ENTRY_FREE {
                // We just freed the short entry; the chain ends here.
                return Ok(());
            }
            if ent.name[0] == FAT_ENTRY_EOD || !ent.is_long_name() {
                warn!("long-name chain broken during erase");
                return Err(FsError::Corrupt);
            }
            write_bytes_at(fs, w.pos(), &free)?;
            if !w.advance(fs)? {
                return Err(FsError::Corrupt);
            }
        }
    }
    Ok(())
}

/// True iff the directory holds nothing beyond `.` and `..`.
pub fn is_dir_empty(fs: &mut FatFs, start: Loc) -> FsResult<bool> {
    let mut w = DirWalker::new(fs, start);
    loop {
        let ent = w.read(fs)?;
        if ent.name[0] == FAT_ENTRY_EOD {
            return Ok(true);
        }
        if ent.name[0] != FAT_ENTRY_FREE
            && !ent.is_long_name()
            && !ent.is_volume_label()
            && ent.name != *DOT_NAME
            && ent.name != *DOTDOT_NAME
        {
            return Ok(false);
        }
        if !w.advance(fs)? {
            return Ok(true);
        }
    }
}

/* Slot allocation. */

/// Grow a cluster directory by one zeroed cluster linked after `last`.
fn extend_dir(fs: &mut FatFs, last: u32) -> FsResult<u32> {
    let ncl = fs.allocate_cluster()?;
    if let Err(e) = fs.write_chain_link(last, ncl) {
        fs.write_fat(ncl, FAT_FREE_CLUSTER)?;
        return Err(e);
    }
    if let Err(e) = fs.record_cleared(Loc::Cluster(ncl)).map(|_| ()) {
        fs.write_fat(ncl, FAT_FREE_CLUSTER)?;
        fs.write_fat(last, 0x0FFF_FFFF)?;
        return Err(e);
    }
    Ok(ncl)
}

/// Find a run of `num` contiguous free records, growing the directory
/// when the run would spill past its allocation. The fixed FAT12/16
/// root cannot grow.
pub fn get_free_dentries(fs: &mut FatFs, start: Loc, num: u32) -> FsResult<DentryPos> {
    let mut w = DirWalker::new(fs, start);
    let mut run_start: Option<DentryPos> = None;
    let mut count = 0u32;

    loop {
        let ent = w.read(fs)?;

        if ent.name[0] == FAT_ENTRY_FREE {
            if count == 0 {
                run_start = Some(w.pos());
            }
            count += 1;
            if count == num {
                return Ok(run_start.unwrap());
            }
        } else if ent.name[0] == FAT_ENTRY_EOD {
            // Everything from here on is unused; make sure the run fits
            // in the allocated space, extending the chain if not.
            if count == 0 {
                run_start = Some(w.pos());
            }
            let start_pos = run_start.unwrap();
            let mut needed = num - count - 1;
            while needed > 0 {
                if w.advance(fs)? {
                    needed -= 1;
                    continue;
                }
                let mut last = match w.loc {
                    Loc::Sector(_) => return Err(FsError::NoSpace),
                    Loc::Cluster(cl) => cl,
                };
                let per_rec = fs.dentries_per_record(w.loc);
                while needed > 0 {
                    last = extend_dir(fs, last)?;
                    needed = needed.saturating_sub(per_rec);
                }
            }
            return Ok(start_pos);
        } else {
            // Occupied; the run is broken.
            count = 0;
            run_start = None;
        }

        if !w.advance(fs)? {
            // Ran off the end of the allocation without an end marker.
            let (cl, per_rec) = match w.loc {
                Loc::Sector(_) => return Err(FsError::NoSpace),
                Loc::Cluster(cl) => (cl, fs.dentries_per_record(w.loc)),
            };
            let mut needed = num - count;
            let mut last = cl;
            loop {
                let ncl = extend_dir(fs, last)?;
                if run_start.is_none() {
                    run_start = Some(DentryPos {
                        loc: Loc::Cluster(ncl),
                        offset: 0,
                    });
                }
                if needed <= per_rec {
                    return Ok(run_start.unwrap());
                }
                needed -= per_rec;
                last = ncl;
            }
        }
    }
}

/* Entry insertion. */

/// Add a directory entry for `name`, producing a bare short entry when
/// the name fits 8.3 and a long-name chain otherwise. Returns the short
/// entry position and the start of the chain, if any.
pub fn add_dentry(
    fs: &mut FatFs,
    name: &str,
    parent_start: Loc,
    attr: u8,
    first_cluster: u32,
) -> FsResult<(DentryPos, Option<DentryPos>)> {
    if is_component_short(name) {
        let comp = normalize_shortname(name);
        let pos = get_free_dentries(fs, parent_start, 1)?;
        let ent = make_raw_dentry(&comp, attr, first_cluster);
        update_dentry(fs, &ent, pos)?;
        return Ok((pos, None));
    }

    if name.len() > 255 {
        return Err(FsError::NameTooLong);
    }
    let target = ucs2::utf8_to_ucs2(name.as_bytes())?;
    let len = target.len();
    if len == 0 || len > FAT_MAX_LONGNAME {
        return Err(FsError::NameTooLong);
    }

    let dents = (len + FAT_LONGNAME_SEGMENT - 1) / FAT_LONGNAME_SEGMENT;

    // Segment buffer: the name, a NUL if there is room, 0xFFFF fill.
    let mut padded = vec![0xFFFFu16; dents * FAT_LONGNAME_SEGMENT];
    padded[..len].copy_from_slice(&target);
    if len < padded.len() {
        padded[len] = 0;
    }

    let shortname = create_shortname(fs, name, parent_start)?;
    let cs = shortname_checksum(&shortname);

    let start = get_free_dentries(fs, parent_start, dents as u32 + 1)?;
    let mut w = DirWalker::at(fs, start);

    // Long entries go down from the last (highest-order) segment.
    for j in (1..=dents).rev() {
        let order = if j == dents {
            FAT_ORDER_LAST | dents as u8
        } else {
            j as u8
        };
        let mut segment = [0u16; FAT_LONGNAME_SEGMENT];
        segment.copy_from_slice(&padded[(j - 1) * FAT_LONGNAME_SEGMENT..j * FAT_LONGNAME_SEGMENT]);
        let lent = FatLongName::new(order, cs, &segment);
        write_bytes_at(fs, w.pos(), lent.as_bytes())?;
        if !w.advance(fs)? {
            return Err(FsError::Corrupt);
        }
    }

    let ent = make_raw_dentry(&shortname, attr, first_cluster);
    let short_pos = w.pos();
    update_dentry(fs, &ent, short_pos)?;
    Ok((short_pos, Some(start)))
}
