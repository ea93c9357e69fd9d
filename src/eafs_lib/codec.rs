//! Packing and unpacking of attribute records inside one block.
//!
//! Everything here works on plain byte slices so the same routines serve a
//! locked block buffer, a private clone and a freshly built block.
use std::cmp::{min, Ordering};
use zerocopy::{AsBytes, FromBytes};
use crate::eafs_lib::desc::*;

/// Structural damage found while walking a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corruption(pub &'static str);

pub type CodecResult<T> = std::result::Result<T, Corruption>;

const NAME_HASH_SHIFT: u32 = 5;
const VALUE_HASH_SHIFT: u32 = 16;
const BLOCK_HASH_SHIFT: u32 = 16;

pub fn read_header(block: &[u8]) -> CodecResult<XattrHeader> {
    XattrHeader::read_from_prefix(block).ok_or(Corruption("block shorter than header"))
}

/// Read the header and check magic and block count
pub fn check_header(block: &[u8]) -> CodecResult<XattrHeader> {
    let header = read_header(block)?;
    if !header.magic_matched() {
        return Err(Corruption("bad magic or block count"));
    }
    Ok(header)
}

fn write_header(block: &mut [u8], header: &XattrHeader) {
    block[..XATTR_HEADER_SIZE].copy_from_slice(header.as_bytes());
}

/// Zero the block and give it a valid empty header with one reference
pub fn init_block(block: &mut [u8]) {
    block.fill(0);
    write_header(block, &XattrHeader::new());
}

pub fn refcount(block: &[u8]) -> CodecResult<u32> {
    Ok(read_header(block)?.h_refcount.get())
}

pub fn set_refcount(block: &mut [u8], refcount: u32) -> CodecResult<()> {
    let mut header = read_header(block)?;
    header.h_refcount.set(refcount);
    write_header(block, &header);
    Ok(())
}

pub fn block_hash(block: &[u8]) -> CodecResult<u32> {
    Ok(read_header(block)?.h_hash.get())
}

pub fn is_last_entry(block: &[u8], offset: usize) -> bool {
    block.get(offset..offset + XATTR_LAST_ENTRY_SIZE)
        .map_or(true, |word| word.iter().all(|b| *b == 0))
}

/// True when the entry list holds nothing but the terminator
pub fn is_empty(block: &[u8]) -> bool {
    is_last_entry(block, XATTR_HEADER_SIZE)
}

fn entry_at(block: &[u8], offset: usize) -> CodecResult<XattrEntry> {
    block.get(offset..)
        .and_then(XattrEntry::read_from_prefix)
        .ok_or(Corruption("entry runs past end of block"))
}

fn write_entry(block: &mut [u8], offset: usize, entry: &XattrEntry) {
    block[offset..offset + XATTR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
}

/// One entry descriptor and where it sits in the block
#[derive(Debug, Clone, Copy)]
pub struct EntryRef {
    pub offset: usize,
    pub entry: XattrEntry,
}

impl EntryRef {
    pub fn name_index(&self) -> u8 { self.entry.e_name_index }

    pub fn name_len(&self) -> usize { self.entry.e_name_len as usize }

    pub fn value_offs(&self) -> usize { self.entry.e_value_offs.get() as usize }

    pub fn value_block(&self) -> u32 { self.entry.e_value_block.get() }

    pub fn value_size(&self) -> usize { self.entry.e_value_size.get() as usize }

    pub fn hash(&self) -> u32 { self.entry.e_hash.get() }

    pub fn next_offset(&self) -> usize { self.offset + xattr_len(self.name_len()) }

    /// Value bytes live in this block (not elsewhere, not empty)
    pub fn has_block_value(&self) -> bool {
        self.value_block() == 0 && self.value_size() != 0
    }

    /// Name bytes. Only valid for entries produced by [`Entries`], which has
    /// checked that the descriptor fits in the block.
    pub fn name<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[self.offset + XATTR_ENTRY_SIZE..][..self.name_len()]
    }

    /// Value bytes, checked to be aligned and to fit the block with their
    /// padding
    pub fn value<'a>(&self, block: &'a [u8]) -> CodecResult<&'a [u8]> {
        if self.value_block() != 0 {
            return Err(Corruption("value stored outside block"));
        }
        let size = self.value_size();
        if size == 0 {
            return Ok(&[]);
        }
        let offs = self.value_offs();
        if offs % XATTR_PAD != 0 {
            return Err(Corruption("value not aligned"));
        }
        if size > block.len() || offs + xattr_size(size) > block.len() {
            return Err(Corruption("value runs past end of block"));
        }
        Ok(&block[offs..offs + size])
    }

    /// Value bytes including the padding, as hashed
    fn padded_value<'a>(&self, block: &'a [u8]) -> CodecResult<&'a [u8]> {
        self.value(block)?;
        let offs = self.value_offs();
        Ok(&block[offs..offs + xattr_size(self.value_size())])
    }

    fn key_cmp(&self, block: &[u8], name_index: u8, name: &[u8]) -> Ordering {
        name_index.cmp(&self.name_index())
            .then(name.len().cmp(&self.name_len()))
            .then_with(|| name.cmp(self.name(block)))
    }
}

/// Walks the entry list. Yields an error and stops when a descriptor would
/// run past the end of the block.
pub struct Entries<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Entries<'a> {
    /// Offset of the terminator once iteration has finished
    pub fn end(&self) -> usize { self.offset }
}

impl<'a> Iterator for Entries<'a> {
    type Item = CodecResult<EntryRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.offset + XATTR_LAST_ENTRY_SIZE > self.block.len() {
            self.failed = true;
            return Some(Err(Corruption("entry list not terminated")));
        }
        if is_last_entry(self.block, self.offset) {
            return None;
        }
        let here = match entry_at(self.block, self.offset) {
            Ok(entry) => EntryRef { offset: self.offset, entry },
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let next = here.next_offset();
        if next >= self.block.len() {
            self.failed = true;
            return Some(Err(Corruption("entry runs past end of block")));
        }
        self.offset = next;
        Some(Ok(here))
    }
}

pub fn entries(block: &[u8]) -> Entries<'_> {
    Entries { block, offset: XATTR_HEADER_SIZE, failed: false }
}

/// Look an attribute up by equality.
///
/// When the attribute is absent the walk runs to the terminator, so every
/// descriptor of the block gets its bounds checked.
pub fn find(block: &[u8], name_index: u8, name: &[u8]) -> CodecResult<Option<EntryRef>> {
    for entry in entries(block) {
        let entry = entry?;
        if entry.name_index() == name_index && entry.name(block) == name {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Lowest offset of any value stored in the block, block size if none
pub fn min_offs(block: &[u8]) -> CodecResult<usize> {
    let mut min_offs = block.len();
    for entry in entries(block) {
        let entry = entry?;
        if entry.has_block_value() {
            min_offs = min(min_offs, entry.value_offs());
        }
    }
    Ok(min_offs)
}

/// Where a named attribute is, or would be inserted, in a block
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    /// The named entry, or the place for inserting it
    pub here: usize,
    /// The terminator
    pub last: usize,
    /// First byte of the value region
    pub min_offs: usize,
    pub found: Option<EntryRef>,
}

impl Slot {
    /// Slot in a block that does not exist yet
    pub fn empty(block_size: usize) -> Self {
        Self { here: XATTR_HEADER_SIZE, last: XATTR_HEADER_SIZE, min_offs: block_size, found: None }
    }

    /// Gap between the terminator and the value region
    pub fn free(&self) -> usize {
        self.min_offs - self.last - XATTR_LAST_ENTRY_SIZE
    }
}

/// Find the sorted position of an attribute. Unlike [`find`] this always
/// walks the whole list, `min_offs` and `last` are needed for editing.
pub fn locate(block: &[u8], name_index: u8, name: &[u8]) -> CodecResult<Slot> {
    let mut min_offs = block.len();
    let mut here = None;
    let mut found = None;
    let mut iter = entries(block);
    for entry in iter.by_ref() {
        let entry = entry?;
        if entry.has_block_value() {
            entry.value(block)?;
            min_offs = min(min_offs, entry.value_offs());
        }
        if here.is_none() {
            match entry.key_cmp(block, name_index, name) {
                Ordering::Greater => {}
                Ordering::Equal => {
                    here = Some(entry.offset);
                    found = Some(entry);
                }
                Ordering::Less => here = Some(entry.offset),
            }
        }
    }
    let last = iter.end();
    if min_offs < last + XATTR_LAST_ENTRY_SIZE {
        return Err(Corruption("value region overlaps entries"));
    }
    Ok(Slot { here: here.unwrap_or(last), last, min_offs, found })
}

/// Create, replace or remove (`value` is `None`) one attribute.
///
/// The caller has located `slot` in this very block and checked that the new
/// record fits. Freed bytes are zeroed so equal attribute sets produce equal
/// blocks. Returns the offset of the edited entry, to be passed to [`rehash`].
pub fn apply(block: &mut [u8], slot: &Slot, name_index: u8, name: &[u8], value: Option<&[u8]>) -> CodecResult<usize> {
    let here = slot.here;
    let mut min_offs = slot.min_offs;
    if let Some(found) = &slot.found {
        // nothing is touched unless the old value can be moved
        found.value(block)?;
    }
    match slot.found {
        None if value.is_none() => return Ok(here),
        None => {
            let size = xattr_len(name.len());
            block.copy_within(here..slot.last, here + size);
            block[here..here + size].fill(0);
            write_entry(block, here, &XattrEntry::new(name_index, name.len() as u8));
            block[here + XATTR_ENTRY_SIZE..][..name.len()].copy_from_slice(name);
        }
        Some(found) => {
            if found.has_block_value() {
                let offs = found.value_offs();
                let size = xattr_size(found.value_size());
                if let Some(value) = value {
                    if size == xattr_size(value.len()) {
                        // same padded size, just replace
                        let mut entry = entry_at(block, here)?;
                        entry.e_value_size.set(value.len() as u32);
                        write_entry(block, here, &entry);
                        block[offs + size - XATTR_PAD..offs + size].fill(0);
                        block[offs..offs + value.len()].copy_from_slice(value);
                        return Ok(here);
                    }
                }
                // remove the old value
                block.copy_within(min_offs..offs, min_offs + size);
                block[min_offs..min_offs + size].fill(0);
                min_offs += size;
                let mut entry = entry_at(block, here)?;
                entry.e_value_offs.set(0);
                write_entry(block, here, &entry);

                // values below the removed one moved up by `size`
                let mut p = XATTR_HEADER_SIZE;
                while !is_last_entry(block, p) {
                    let mut entry = entry_at(block, p)?;
                    let o = entry.e_value_offs.get() as usize;
                    if p != here && entry.e_value_block.get() == 0 && entry.e_value_size.get() != 0 && o < offs {
                        entry.e_value_offs.set((o + size) as u16);
                        write_entry(block, p, &entry);
                    }
                    p += xattr_len(entry.e_name_len as usize);
                }
            }
            if value.is_none() {
                // remove the old name
                let size = xattr_len(name.len());
                let last = slot.last - size;
                block.copy_within(here + size..slot.last, here);
                block[last..last + size].fill(0);
            }
        }
    }

    if let Some(value) = value {
        let mut entry = entry_at(block, here)?;
        entry.e_value_size.set(value.len() as u32);
        if !value.is_empty() {
            let size = xattr_size(value.len());
            let val = min_offs - size;
            entry.e_value_offs.set(val as u16);
            block[val + size - XATTR_PAD..val + size].fill(0);
            block[val..val + value.len()].copy_from_slice(value);
        }
        write_entry(block, here, &entry);
    }
    Ok(here)
}

/// Hash of one entry: name bytes, then the value as little endian words
pub fn entry_hash(block: &[u8], entry: &EntryRef) -> CodecResult<u32> {
    let mut hash: u32 = 0;
    for c in entry.name(block) {
        hash = hash.rotate_left(NAME_HASH_SHIFT) ^ *c as u32;
    }
    if entry.has_block_value() {
        for word in entry.padded_value(block)?.chunks_exact(4) {
            let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            hash = hash.rotate_left(VALUE_HASH_SHIFT) ^ word;
        }
    }
    Ok(hash)
}

/// Recompute and store the hash of the entry at `offset`
pub fn hash_entry(block: &mut [u8], offset: usize) -> CodecResult<()> {
    let entry = EntryRef { offset, entry: entry_at(block, offset)? };
    if entry.next_offset() >= block.len() {
        return Err(Corruption("entry runs past end of block"));
    }
    let hash = entry_hash(block, &entry)?;
    let mut raw = entry.entry;
    raw.e_hash.set(hash);
    write_entry(block, offset, &raw);
    Ok(())
}

/// Recompute the block hash after the entry at `here` has changed.
///
/// A zero entry hash forces a zero block hash, which means "never share".
pub fn rehash(block: &mut [u8], here: usize) -> CodecResult<()> {
    if !is_last_entry(block, here) {
        hash_entry(block, here)?;
    }
    let mut hash: u32 = 0;
    for entry in entries(block) {
        let entry = entry?;
        if entry.hash() == 0 {
            hash = 0;
            break;
        }
        hash = hash.rotate_left(BLOCK_HASH_SHIFT) ^ entry.hash();
    }
    let mut header = read_header(block)?;
    header.h_hash.set(hash);
    write_header(block, &header);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMatch {
    Equal,
    Differ,
}

/// Compare the attribute sets of two blocks. Headers are not compared.
pub fn compare(a: &[u8], b: &[u8]) -> CodecResult<BlockMatch> {
    let mut ia = entries(a);
    let mut ib = entries(b);
    loop {
        match (ia.next(), ib.next()) {
            (Some(Err(e)), _) | (_, Some(Err(e))) => return Err(e),
            (None, None) => return Ok(BlockMatch::Equal),
            (None, Some(_)) | (Some(_), None) => return Ok(BlockMatch::Differ),
            (Some(Ok(x)), Some(Ok(y))) => {
                if x.hash() != y.hash()
                    || x.name_index() != y.name_index()
                    || x.name_len() != y.name_len()
                    || x.value_size() != y.value_size()
                    || x.name(a) != y.name(b) {
                    return Ok(BlockMatch::Differ);
                }
                if x.value_block() != 0 || y.value_block() != 0 {
                    return Err(Corruption("value stored outside block"));
                }
                if x.value(a)? != y.value(b)? {
                    return Ok(BlockMatch::Differ);
                }
            }
        }
    }
}

/// How the bytes of a block are spent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub count: usize,
    /// Header, descriptors and terminator
    pub entries: usize,
    /// Padded values
    pub values: usize,
    pub free: usize,
}

/// Walk the block and check that descriptors, padded values and the free
/// gap add up to the block size exactly.
pub fn layout(block: &[u8]) -> CodecResult<Layout> {
    let mut count = 0;
    let mut values = 0;
    let mut min_offs = block.len();
    let mut iter = entries(block);
    for entry in iter.by_ref() {
        let entry = entry?;
        count += 1;
        if entry.has_block_value() {
            entry.padded_value(block)?;
            values += xattr_size(entry.value_size());
            min_offs = min(min_offs, entry.value_offs());
        }
    }
    let entries = iter.end() + XATTR_LAST_ENTRY_SIZE;
    if min_offs < entries {
        return Err(Corruption("value region overlaps entries"));
    }
    let free = min_offs - entries;
    if entries + values + free != block.len() {
        return Err(Corruption("value region has gaps or overlaps"));
    }
    Ok(Layout { count, entries, values, free })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    const BS: usize = 1024;

    fn new_block() -> Vec<u8> {
        let mut block = vec![0 as u8; BS];
        init_block(&mut block);
        block
    }

    fn set(block: &mut [u8], index: u8, name: &str, value: Option<&[u8]>) -> Result<()> {
        let slot = locate(block, index, name.as_bytes()).map_err(|e| anyhow!("{:?}", e))?;
        let here = apply(block, &slot, index, name.as_bytes(), value).map_err(|e| anyhow!("{:?}", e))?;
        if !is_empty(block) {
            rehash(block, here).map_err(|e| anyhow!("{:?}", e))?;
        }
        layout(block).map_err(|e| anyhow!("{:?}", e))?;
        Ok(())
    }

    fn get<'a>(block: &'a [u8], index: u8, name: &str) -> Option<&'a [u8]> {
        find(block, index, name.as_bytes()).unwrap().map(|e| e.value(block).unwrap())
    }

    #[test]
    fn insert_and_find() -> Result<()> {
        let mut block = new_block();
        set(&mut block, 1, "foo", Some(b"bar"))?;
        set(&mut block, 1, "a", Some(b"0123456789"))?;
        set(&mut block, 6, "selinux", Some(b""))?;
        assert_eq!(get(&block, 1, "foo"), Some(&b"bar"[..]));
        assert_eq!(get(&block, 1, "a"), Some(&b"0123456789"[..]));
        assert_eq!(get(&block, 6, "selinux"), Some(&b""[..]));
        assert_eq!(get(&block, 4, "foo"), None);
        // sorted by index, then name length, then name
        let names: Vec<(u8, Vec<u8>)> = entries(&block)
            .map(|e| e.map(|e| (e.name_index(), e.name(&block).to_vec())))
            .collect::<CodecResult<_>>().map_err(|e| anyhow!("{:?}", e))?;
        assert_eq!(names, vec![(1, b"a".to_vec()), (1, b"foo".to_vec()), (6, b"selinux".to_vec())]);
        Ok(())
    }

    #[test]
    fn layout_accounting() -> Result<()> {
        let mut block = new_block();
        let empty = layout(&block).map_err(|e| anyhow!("{:?}", e))?;
        assert_eq!(empty, Layout { count: 0, entries: 36, values: 0, free: BS - 36 });
        set(&mut block, 1, "foo", Some(b"bar"))?;
        let l = layout(&block).map_err(|e| anyhow!("{:?}", e))?;
        assert_eq!(l, Layout { count: 1, entries: 36 + 20, values: 4, free: BS - 36 - 20 - 4 });
        Ok(())
    }

    #[test]
    fn replace_and_remove_keep_values_packed() -> Result<()> {
        let mut block = new_block();
        set(&mut block, 1, "one", Some(b"1111"))?;
        set(&mut block, 1, "two", Some(b"22222222"))?;
        set(&mut block, 1, "six", Some(b"333333333333"))?;
        // same padded size
        set(&mut block, 1, "two", Some(b"2222222"))?;
        assert_eq!(get(&block, 1, "two"), Some(&b"2222222"[..]));
        // grows, value moves to the bottom of the value region
        set(&mut block, 1, "one", Some(b"111111111111111111"))?;
        assert_eq!(get(&block, 1, "one"), Some(&b"111111111111111111"[..]));
        assert_eq!(get(&block, 1, "six"), Some(&b"333333333333"[..]));
        set(&mut block, 1, "two", None)?;
        assert_eq!(get(&block, 1, "two"), None);
        assert_eq!(get(&block, 1, "six"), Some(&b"333333333333"[..]));
        assert_eq!(get(&block, 1, "one"), Some(&b"111111111111111111"[..]));
        set(&mut block, 1, "one", None)?;
        set(&mut block, 1, "six", None)?;
        assert!(is_empty(&block));
        // everything past the header is zero again
        assert!(block[XATTR_HEADER_SIZE..].iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn hash_values() -> Result<()> {
        let mut block = new_block();
        set(&mut block, 1, "foo", Some(b"bar"))?;
        let entry = find(&block, 1, b"foo").map_err(|e| anyhow!("{:?}", e))?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(entry.hash(), 0x95FD6163);
        assert_eq!(block_hash(&block).map_err(|e| anyhow!("{:?}", e))?, 0x95FD6163);

        set(&mut block, 1, "a", None)?;
        assert_eq!(get(&block, 1, "a"), None);
        set(&mut block, 1, "a", Some(b""))?;
        let a = find(&block, 1, b"a").map_err(|e| anyhow!("{:?}", e))?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(a.hash(), 0x61);
        assert_eq!(block_hash(&block).map_err(|e| anyhow!("{:?}", e))?, 0x61u32.rotate_left(16) ^ 0x95FD6163);
        Ok(())
    }

    #[test]
    fn zero_entry_hash_disables_sharing() -> Result<()> {
        let mut block = new_block();
        set(&mut block, 1, "x", Some(b"1"))?;
        assert_ne!(block_hash(&block).unwrap(), 0);
        let entry = find(&block, 1, b"x").unwrap().unwrap();
        let mut raw = entry.entry;
        raw.e_hash.set(0);
        write_entry(&mut block, entry.offset, &raw);
        // rehash of the terminator leaves entry hashes alone
        let last = locate(&block, 1, b"zz").unwrap().last;
        rehash(&mut block, last).unwrap();
        assert_eq!(block_hash(&block).unwrap(), 0);
        Ok(())
    }

    #[test]
    fn compare_blocks() -> Result<()> {
        let mut a = new_block();
        let mut b = new_block();
        set(&mut a, 1, "k", Some(b"v"))?;
        set(&mut a, 1, "long", Some(b"value"))?;
        // insertion order does not matter
        set(&mut b, 1, "long", Some(b"value"))?;
        set(&mut b, 1, "k", Some(b"v"))?;
        assert_eq!(compare(&a, &b), Ok(BlockMatch::Equal));
        set(&mut b, 1, "k", Some(b"w"))?;
        assert_eq!(compare(&a, &b), Ok(BlockMatch::Differ));
        set(&mut b, 1, "k", None)?;
        assert_eq!(compare(&a, &b), Ok(BlockMatch::Differ));
        // same name and value in another namespace
        let mut c = new_block();
        let mut d = new_block();
        set(&mut c, 1, "k", Some(b"v"))?;
        set(&mut d, 4, "k", Some(b"v"))?;
        assert_eq!(compare(&c, &d), Ok(BlockMatch::Differ));
        Ok(())
    }

    #[test]
    fn compare_rejects_outside_values() -> Result<()> {
        let mut a = new_block();
        set(&mut a, 1, "k", Some(b"v"))?;
        let b = a.clone();
        let entry = find(&a, 1, b"k").unwrap().unwrap();
        let mut raw = entry.entry;
        raw.e_value_block.set(77);
        write_entry(&mut a, entry.offset, &raw);
        assert_eq!(compare(&a, &b), Err(Corruption("value stored outside block")));
        Ok(())
    }

    #[test]
    fn corrupt_blocks_are_detected() -> Result<()> {
        let mut block = new_block();
        assert!(check_header(&block).is_ok());
        set(&mut block, 1, "foo", Some(b"bar"))?;

        // a name length reaching past the end of a short block
        let mut small = block[..XATTR_HEADER_SIZE + 64].to_vec();
        small[XATTR_HEADER_SIZE] = 0xff;
        assert!(find(&small, 1, b"nope").is_err());
        assert!(locate(&small, 1, b"nope").is_err());
        assert!(layout(&small).is_err());

        let mut bad_value = block.clone();
        let entry = find(&bad_value, 1, b"foo").unwrap().unwrap();
        let mut raw = entry.entry;
        raw.e_value_offs.set((BS - 2) as u16);
        write_entry(&mut bad_value, entry.offset, &raw);
        let entry = find(&bad_value, 1, b"foo").unwrap().unwrap();
        assert!(entry.value(&bad_value).is_err());

        let mut bad_magic = block.clone();
        bad_magic[0] = 0;
        assert_eq!(check_header(&bad_magic).err(), Some(Corruption("bad magic or block count")));
        Ok(())
    }

    #[test]
    fn misaligned_value_is_not_edited() -> Result<()> {
        let mut block = new_block();
        set(&mut block, 1, "k", Some(b"v"))?;
        let slot = locate(&block, 1, b"k").map_err(|e| anyhow!("{:?}", e))?;
        let entry = slot.found.ok_or_else(|| anyhow!("missing"))?;
        // one byte value in the very last byte of the block
        let mut raw = entry.entry;
        raw.e_value_offs.set((BS - 1) as u16);
        write_entry(&mut block, entry.offset, &raw);
        let entry = find(&block, 1, b"k").unwrap().unwrap();
        assert_eq!(entry.value(&block), Err(Corruption("value not aligned")));
        assert!(locate(&block, 1, b"k").is_err());
        assert!(locate(&block, 1, b"other").is_err());

        let before = block.clone();
        let stale = Slot { found: Some(entry), ..slot };
        assert!(apply(&mut block, &stale, 1, b"k", Some(b"w")).is_err());
        assert!(apply(&mut block, &stale, 1, b"k", Some(b"longer")).is_err());
        assert!(apply(&mut block, &stale, 1, b"k", None).is_err());
        assert_eq!(block, before);
        Ok(())
    }

    #[test]
    fn min_offs_tracks_lowest_value() -> Result<()> {
        let mut block = new_block();
        assert_eq!(min_offs(&block), Ok(BS));
        set(&mut block, 1, "a", Some(b"12345"))?;
        assert_eq!(min_offs(&block), Ok(BS - 8));
        set(&mut block, 1, "b", Some(b"1"))?;
        assert_eq!(min_offs(&block), Ok(BS - 12));
        set(&mut block, 1, "b", Some(b""))?;
        assert_eq!(min_offs(&block), Ok(BS - 8));
        Ok(())
    }
}
