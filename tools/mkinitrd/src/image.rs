//! The initrd on-disk format.
//!
//! Layout: a metadata header, `total_nodes` file records, then the data
//! region. A directory's data is its dirent array; a regular file's
//! data is its contents; a symlink's data is its target path. Every
//! data chunk is block-aligned. Names are NUL-padded to 16 bytes and
//! the last entry of each directory carries `DIR_LAST_ENTRY`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};

/// Image magic.
pub const INITRD_MAGIC: u16 = 0xBAE0;

/// Regular file flag.
pub const FILE_REGULAR: u16 = 0x1;
/// Directory flag.
pub const FILE_DIRECTORY: u16 = 0x2;
/// Symbolic link flag.
pub const FILE_SYMLINK: u16 = 0x4;
/// Marks the last entry in a directory.
pub const DIR_LAST_ENTRY: u16 = 0x20;

/// Maximum name length (NUL-padded on disk).
pub const MAX_NAME_LEN: usize = 16;
/// Maximum number of file nodes.
pub const MAX_FILES: usize = 65_535;

/// Packed header size: magic(2) size(4) block_size(4) reserved(2)
/// last_id(2) total_nodes(2) free_nodes(2) free_offset(2)
/// file_offset(4) data_offset(4).
const HEADER_LEN: usize = 28;
/// Packed file record: id(2) flags(2) blocks(2) length(4) offset(4)
/// dirent(4).
const FILE_RECORD_LEN: usize = 18;
/// Packed dirent: node(2) flags(2) name(16) parent(4) offset(4).
const DIRENT_LEN: usize = 28;

fn align_up(v: u32, block: u32) -> u32 {
    v.div_ceil(block) * block
}

// ---------------------------------------------------------------------------
// In-memory tree
// ---------------------------------------------------------------------------

enum NodeData {
    File(Vec<u8>),
    Dir(Vec<usize>),
    Symlink(String),
}

struct Node {
    id: u16,
    name: String,
    data: NodeData,
}

/// An in-memory filesystem tree to be serialized.
pub struct FsTree {
    /// Index 0 is the root directory.
    nodes: Vec<Node>,
}

impl FsTree {
    /// Creates a tree with an empty root.
    pub fn new() -> FsTree {
        FsTree {
            nodes: vec![Node {
                id: 1,
                name: String::from("/"),
                data: NodeData::Dir(Vec::new()),
            }],
        }
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn add_node(&mut self, parent: usize, name: &str, data: NodeData) -> Result<usize> {
        ensure!(self.nodes.len() < MAX_FILES, "too many files");
        ensure!(
            name.len() < MAX_NAME_LEN,
            "name '{name}' exceeds {} bytes",
            MAX_NAME_LEN - 1
        );
        let id = (self.nodes.len() + 1) as u16;
        let index = self.nodes.len();
        self.nodes.push(Node {
            id,
            name: String::from(name),
            data,
        });
        match &mut self.nodes[parent].data {
            NodeData::Dir(children) => children.push(index),
            _ => bail!("parent is not a directory"),
        }
        Ok(index)
    }

    /// Adds a regular file.
    pub fn add_file(&mut self, parent: usize, name: &str, data: Vec<u8>) -> Result<usize> {
        self.add_node(parent, name, NodeData::File(data))
    }

    /// Adds a directory, returning its index.
    pub fn add_dir(&mut self, parent: usize, name: &str) -> Result<usize> {
        self.add_node(parent, name, NodeData::Dir(Vec::new()))
    }

    /// Adds a symlink.
    pub fn add_symlink(&mut self, parent: usize, name: &str, target: &str) -> Result<usize> {
        self.add_node(parent, name, NodeData::Symlink(String::from(target)))
    }

    /// Builds a tree from a host directory.
    pub fn from_directory(dir: &Path) -> Result<FsTree> {
        let mut tree = FsTree::new();
        tree.scan(dir, 0)?;
        Ok(tree)
    }

    fn scan(&mut self, dir: &Path, parent: usize) -> Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path)?;

            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&path)?;
                self.add_symlink(parent, &name, &target.to_string_lossy())?;
            } else if meta.is_dir() {
                let index = self.add_dir(parent, &name)?;
                self.scan(&path, index)?;
            } else {
                let data = std::fs::read(&path)?;
                self.add_file(parent, &name, data)?;
            }
        }
        Ok(())
    }

    // -- serialization --------------------------------------------------

    /// Serializes the tree into an image.
    pub fn write(&self, block_size: u32) -> Result<Vec<u8>> {
        ensure!(block_size.is_power_of_two(), "block size must be a power of two");
        let total_nodes = self.nodes.len() as u32;
        let records_len = total_nodes * FILE_RECORD_LEN as u32;
        let file_offset = HEADER_LEN as u32;
        let data_offset = align_up(file_offset + records_len, block_size);

        // First pass: assign each node's data chunk offset.
        let mut chunk_offsets: Vec<u32> = Vec::with_capacity(self.nodes.len());
        let mut cursor = data_offset;
        for node in &self.nodes {
            chunk_offsets.push(cursor);
            let len = match &node.data {
                NodeData::File(data) => data.len() as u32,
                NodeData::Dir(children) => (children.len() * DIRENT_LEN) as u32,
                NodeData::Symlink(target) => target.len() as u32 + 1,
            };
            cursor += align_up(len.max(1), block_size);
        }
        let total_size = cursor;

        // Dirent offsets: entry j of directory i lives at
        // chunk_offsets[i] + j * DIRENT_LEN; a node's `dirent` field
        // points at the entry referencing it.
        let mut dirent_of: BTreeMap<usize, u32> = BTreeMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if let NodeData::Dir(children) = &node.data {
                for (j, &child) in children.iter().enumerate() {
                    dirent_of.insert(child, chunk_offsets[i] + (j * DIRENT_LEN) as u32);
                }
            }
        }

        let mut out = vec![0u8; total_size as usize];

        // Header.
        let mut w = Writer::new(&mut out, 0);
        w.u16(INITRD_MAGIC);
        w.u32(total_size);
        w.u32(block_size);
        w.u16(0); // reserved
        w.u16(self.nodes.last().map_or(1, |n| n.id)); // last_id
        w.u16(total_nodes as u16);
        w.u16(0); // free_nodes
        w.u16(0); // free_offset
        w.u32(file_offset);
        w.u32(data_offset);

        // File records, in node order.
        for (i, node) in self.nodes.iter().enumerate() {
            let (flags, length) = match &node.data {
                NodeData::File(data) => (FILE_REGULAR, data.len() as u32),
                NodeData::Dir(children) => {
                    (FILE_DIRECTORY, (children.len() * DIRENT_LEN) as u32)
                }
                NodeData::Symlink(target) => (FILE_SYMLINK, target.len() as u32 + 1),
            };
            let mut w = Writer::new(&mut out, file_offset as usize + i * FILE_RECORD_LEN);
            w.u16(node.id);
            w.u16(flags);
            w.u16((align_up(length.max(1), block_size) / block_size) as u16);
            w.u32(length);
            w.u32(chunk_offsets[i]);
            w.u32(dirent_of.get(&i).copied().unwrap_or(0));
        }

        // Data region.
        for (i, node) in self.nodes.iter().enumerate() {
            match &node.data {
                NodeData::File(data) => {
                    let at = chunk_offsets[i] as usize;
                    out[at..at + data.len()].copy_from_slice(data);
                }
                NodeData::Symlink(target) => {
                    let at = chunk_offsets[i] as usize;
                    out[at..at + target.len()].copy_from_slice(target.as_bytes());
                }
                NodeData::Dir(children) => {
                    for (j, &child) in children.iter().enumerate() {
                        let child_node = &self.nodes[child];
                        let mut flags = 0u16;
                        if j == children.len() - 1 {
                            flags |= DIR_LAST_ENTRY;
                        }
                        let mut w = Writer::new(
                            &mut out,
                            chunk_offsets[i] as usize + j * DIRENT_LEN,
                        );
                        w.u16(child_node.id);
                        w.u16(flags);
                        w.name(&child_node.name);
                        w.u32(file_offset + (i * FILE_RECORD_LEN) as u32);
                        w.u32(file_offset + (child * FILE_RECORD_LEN) as u32);
                    }
                }
            }
        }

        Ok(out)
    }
}

impl Default for FsTree {
    fn default() -> Self {
        Self::new()
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8], at: usize) -> Writer<'a> {
        Writer { buf, at }
    }

    fn u16(&mut self, v: u16) {
        self.buf[self.at..self.at + 2].copy_from_slice(&v.to_le_bytes());
        self.at += 2;
    }

    fn u32(&mut self, v: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }

    fn name(&mut self, name: &str) {
        let mut field = [0u8; MAX_NAME_LEN];
        let n = name.len().min(MAX_NAME_LEN - 1);
        field[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.buf[self.at..self.at + MAX_NAME_LEN].copy_from_slice(&field);
        self.at += MAX_NAME_LEN;
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A parsed file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    /// Node id.
    pub id: u16,
    /// Type flags.
    pub flags: u16,
    /// Blocks used.
    pub blocks: u16,
    /// Data length.
    pub length: u32,
    /// Offset to data.
    pub offset: u32,
    /// Offset to the dirent referencing this node.
    pub dirent: u32,
}

/// A parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirentRecord {
    /// Referenced node id.
    pub node: u16,
    /// Entry flags.
    pub flags: u16,
    /// Entry name.
    pub name: String,
    /// Offset to the parent node record.
    pub parent: u32,
    /// Offset to the node record.
    pub offset: u32,
}

/// A parsed image.
pub struct Image<'a> {
    bytes: &'a [u8],
    /// Block size.
    pub block_size: u32,
    /// File records in node order.
    pub records: Vec<FileRecord>,
    /// Offset of the first record.
    pub file_offset: u32,
    /// Offset of the data region.
    pub data_offset: u32,
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.at..self.at + 2].try_into().unwrap());
        self.at += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.at..self.at + 4].try_into().unwrap());
        self.at += 4;
        v
    }

    fn name(&mut self) -> String {
        let raw = &self.buf[self.at..self.at + MAX_NAME_LEN];
        self.at += MAX_NAME_LEN;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

impl<'a> Image<'a> {
    /// Parses an image, validating the magic and bounds.
    pub fn parse(bytes: &'a [u8]) -> Result<Image<'a>> {
        ensure!(bytes.len() >= HEADER_LEN, "image too small");
        let mut r = Reader { buf: bytes, at: 0 };
        let magic = r.u16();
        ensure!(magic == INITRD_MAGIC, "bad magic {magic:#06x}");
        let size = r.u32();
        ensure!(size as usize <= bytes.len(), "truncated image");
        let block_size = r.u32();
        let _reserved = r.u16();
        let _last_id = r.u16();
        let total_nodes = r.u16();
        let _free_nodes = r.u16();
        let _free_offset = r.u16();
        let file_offset = r.u32();
        let data_offset = r.u32();

        let mut records = Vec::with_capacity(total_nodes as usize);
        for i in 0..total_nodes as usize {
            let mut r = Reader {
                buf: bytes,
                at: file_offset as usize + i * FILE_RECORD_LEN,
            };
            records.push(FileRecord {
                id: r.u16(),
                flags: r.u16(),
                blocks: r.u16(),
                length: r.u32(),
                offset: r.u32(),
                dirent: r.u32(),
            });
        }

        Ok(Image {
            bytes,
            block_size,
            records,
            file_offset,
            data_offset,
        })
    }

    /// Returns the dirents of a directory record.
    pub fn dirents(&self, record: &FileRecord) -> Result<Vec<DirentRecord>> {
        ensure!(record.flags & FILE_DIRECTORY != 0, "not a directory");
        let count = record.length as usize / DIRENT_LEN;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let mut r = Reader {
                buf: self.bytes,
                at: record.offset as usize + i * DIRENT_LEN,
            };
            out.push(DirentRecord {
                node: r.u16(),
                flags: r.u16(),
                name: r.name(),
                parent: r.u32(),
                offset: r.u32(),
            });
        }
        Ok(out)
    }

    /// Returns a regular file's contents.
    pub fn file_data(&self, record: &FileRecord) -> &[u8] {
        &self.bytes[record.offset as usize..(record.offset + record.length) as usize]
    }

    /// Finds a record by node id.
    pub fn record_by_id(&self, id: u16) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Prints the tree to stdout.
    pub fn print_tree(&self) {
        println!(
            "initrd: {} nodes, block size {}",
            self.records.len(),
            self.block_size
        );
        if let Some(root) = self.records.first() {
            self.print_dir(root, 0);
        }
    }

    fn print_dir(&self, dir: &FileRecord, depth: usize) {
        let Ok(entries) = self.dirents(dir) else {
            return;
        };
        for entry in entries {
            let record = self.record_by_id(entry.node);
            let kind = match record.map(|r| r.flags) {
                Some(f) if f & FILE_DIRECTORY != 0 => "d",
                Some(f) if f & FILE_SYMLINK != 0 => "l",
                _ => "-",
            };
            println!(
                "{kind} {:indent$}{} ({} bytes)",
                "",
                entry.name,
                record.map_or(0, |r| r.length),
                indent = depth * 2
            );
            if let Some(record) = record {
                if record.flags & FILE_DIRECTORY != 0 {
                    self.print_dir(record, depth + 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> FsTree {
        let mut tree = FsTree::new();
        let bin = tree.add_dir(0, "bin").unwrap();
        tree.add_file(bin, "init", b"#!init".to_vec()).unwrap();
        tree.add_file(0, "hello.txt", b"hello initrd\n".to_vec())
            .unwrap();
        tree.add_symlink(0, "link", "/hello.txt").unwrap();
        tree
    }

    #[test]
    fn roundtrip_preserves_structure() {
        let tree = sample_tree();
        let bytes = tree.write(512).unwrap();
        let image = Image::parse(&bytes).unwrap();

        assert_eq!(image.block_size, 512);
        assert_eq!(image.records.len(), 5);

        let root = &image.records[0];
        assert!(root.flags & FILE_DIRECTORY != 0);
        let entries = image.dirents(root).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["bin", "hello.txt", "link"]);

        // Only the final entry carries the last-entry flag.
        assert_eq!(entries[0].flags & DIR_LAST_ENTRY, 0);
        assert_eq!(entries[1].flags & DIR_LAST_ENTRY, 0);
        assert!(entries[2].flags & DIR_LAST_ENTRY != 0);

        // File contents round-trip.
        let hello = image.record_by_id(entries[1].node).unwrap();
        assert!(hello.flags & FILE_REGULAR != 0);
        assert_eq!(image.file_data(hello), b"hello initrd\n");

        // Nested directory.
        let bin = image.record_by_id(entries[0].node).unwrap();
        let bin_entries = image.dirents(bin).unwrap();
        assert_eq!(bin_entries.len(), 1);
        assert_eq!(bin_entries[0].name, "init");
        assert!(bin_entries[0].flags & DIR_LAST_ENTRY != 0);
    }

    #[test]
    fn data_chunks_are_block_aligned() {
        let tree = sample_tree();
        let bytes = tree.write(512).unwrap();
        let image = Image::parse(&bytes).unwrap();

        assert_eq!(image.data_offset % 512, 0);
        for record in &image.records {
            assert_eq!(record.offset % 512, 0, "unaligned chunk for {}", record.id);
            assert_eq!(
                record.blocks as u32,
                record.length.max(1).div_ceil(512),
                "block count mismatch"
            );
        }
    }

    #[test]
    fn names_are_nul_padded() {
        let tree = sample_tree();
        let bytes = tree.write(512).unwrap();
        let image = Image::parse(&bytes).unwrap();
        let root = &image.records[0];

        // Raw dirent name field: "bin" followed by NULs.
        let at = root.offset as usize + 4;
        assert_eq!(&bytes[at..at + 4], b"bin\0");
        assert!(bytes[at + 3..at + MAX_NAME_LEN].iter().all(|&b| b == 0));
    }

    #[test]
    fn dirent_backreferences_are_consistent() {
        let tree = sample_tree();
        let bytes = tree.write(512).unwrap();
        let image = Image::parse(&bytes).unwrap();

        let root = &image.records[0];
        for entry in image.dirents(root).unwrap() {
            // The dirent's node offset points at the record of its id.
            let idx = (entry.offset - image.file_offset) as usize / FILE_RECORD_LEN;
            assert_eq!(image.records[idx].id, entry.node);
            // The referenced record's dirent field points back at an
            // entry naming it.
            assert!(image.records[idx].dirent != 0);
            // Parent points at the root record.
            assert_eq!(entry.parent, image.file_offset);
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let tree = sample_tree();
        let mut bytes = tree.write(512).unwrap();
        bytes[0] = 0;
        assert!(Image::parse(&bytes).is_err());
    }

    #[test]
    fn long_names_rejected() {
        let mut tree = FsTree::new();
        assert!(tree.add_file(0, "a_name_longer_than_16", Vec::new()).is_err());
    }
}
