//! Serialization of a [`Tree`](super::vfs::Tree) in the cpio "newc" format,
//! the archive format the Linux kernel accepts for initramfs images.
//!
//! Format reference:
//! https://www.kernel.org/doc/Documentation/early-userspace/buffer-format.txt

use std::io::Write;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

use super::vfs::{Node, Tree};

const MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";

/// Archives end on a 512-byte block boundary.
const BLOCK_SIZE: usize = 512;

/// Single-pass newc writer. Inode numbers are assigned monotonically in
/// the order entries are added.
pub struct Writer<W: Write> {
    out: W,
    inode: u32,
    written: usize,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            inode: 0,
            written: 0,
        }
    }

    /// Serialize a whole tree and finish the archive.
    pub fn write_tree(mut self, tree: &Tree) -> Result<()> {
        tree.walk(&mut |path, node| self.write_node(path, node))?;
        self.finish()
    }

    fn write_node(&mut self, path: &str, node: &Node) -> Result<()> {
        match node {
            Node::Dir(_) => {
                self.write_entry(path, 0o040755, 2, &[])?;
            }
            Node::Symlink { target } => {
                self.write_entry(path, 0o120777, 1, target.as_bytes())?;
            }
            Node::File(file) => {
                let mode = 0o100000 | (file.mode & 0o7777);
                self.write_header(path, mode, 1, file.size)?;

                let mut reader =
                    (file.open)().with_context(|| format!("Failed to open {path}"))?;
                let copied = std::io::copy(&mut reader, &mut CountingWrite(self))
                    .with_context(|| format!("Failed to archive {path}"))?;
                if copied != file.size {
                    return Err(eyre!(
                        "{path}: size changed while archiving: header says {} bytes, read {}",
                        file.size,
                        copied
                    ));
                }

                self.pad(4)?;
            }
        }
        Ok(())
    }

    /// Write a complete entry with an inline payload.
    fn write_entry(&mut self, name: &str, mode: u32, nlink: u32, data: &[u8]) -> Result<()> {
        self.write_header(name, mode, nlink, data.len() as u64)?;
        self.write_all(data)?;
        self.pad(4)
    }

    /// Write the 110-byte ASCII header plus the NUL-terminated name, padded
    /// to a 4-byte boundary.
    fn write_header(&mut self, name: &str, mode: u32, nlink: u32, filesize: u64) -> Result<()> {
        self.inode += 1;
        let inode = self.inode;
        self.write_raw_header(name, inode, mode, nlink, filesize)
    }

    fn write_raw_header(
        &mut self,
        name: &str,
        inode: u32,
        mode: u32,
        nlink: u32,
        filesize: u64,
    ) -> Result<()> {
        // namesize includes the terminating NUL.
        let namesize = name.len() + 1;

        let header = format!(
            "{MAGIC}\
             {inode:08X}\
             {mode:08X}\
             {uid:08X}\
             {gid:08X}\
             {nlink:08X}\
             {mtime:08X}\
             {filesize:08X}\
             {devmajor:08X}\
             {devminor:08X}\
             {rdevmajor:08X}\
             {rdevminor:08X}\
             {namesize:08X}\
             {check:08X}",
            uid = 0,
            gid = 0,
            mtime = 0,
            devmajor = 0,
            devminor = 0,
            rdevmajor = 0,
            rdevminor = 0,
            check = 0,
        );
        debug_assert_eq!(header.len(), 110);

        self.write_all(header.as_bytes())?;
        self.write_all(name.as_bytes())?;
        self.write_all(&[0])?;
        self.pad(4)
    }

    /// The trailer entry plus block padding. Consumes the writer; the
    /// stream is flushed before it is dropped.
    fn finish(mut self) -> Result<()> {
        // All-zero header fields, only magic and namesize carry values.
        self.write_raw_header(TRAILER, 0, 0, 0, 0)?;
        self.pad(BLOCK_SIZE)?;
        self.out.flush().context("Failed to flush archive stream")?;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.out
            .write_all(data)
            .context("Failed to write archive stream")?;
        self.written += data.len();
        Ok(())
    }

    fn pad(&mut self, alignment: usize) -> Result<()> {
        static ZEROES: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];
        let rem = self.written % alignment;
        if rem != 0 {
            self.write_all(&ZEROES[..alignment - rem])?;
        }
        Ok(())
    }
}

/// Adapter so [`std::io::copy`] can feed payload bytes through the
/// position-tracking writer.
struct CountingWrite<'a, W: Write>(&'a mut Writer<W>);

impl<W: Write> Write for CountingWrite<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.out.write_all(buf)?;
        self.0.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.out.flush()
    }
}
