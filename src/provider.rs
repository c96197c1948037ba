use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::Context;

/// Source of package bytes. Implementations sit on the far side of a
/// possibly-untrusted transport; nothing they return is believed twice
/// (see `store`).
pub trait BlockProvider {
    fn file_size(&self) -> u64;

    /// Block granularity of the transport. Must be within
    /// [`crate::store::MIN_BLOCK_SIZE`]..=[`crate::store::MAX_BLOCK_SIZE`].
    fn block_size(&self) -> u32;

    /// Fill `dst` with the contents of `block`. `dst` is one block long,
    /// except for the final partial block of the file, where it is exactly
    /// the remaining length. Blocks while the transport round-trips.
    fn read_block(&mut self, dst: &mut [u8], block: u32) -> anyhow::Result<()>;

    /// Called once at teardown, before the filesystem is unmounted.
    fn close(&mut self) {}
}

/// Serves blocks out of a local file. Used by airlockd and as the reference
/// provider in tests; real deployments plug a transport-backed provider in
/// instead.
pub struct FileProvider {
    file: File,
    file_size: u64,
}

const FILE_BLOCK_SIZE: u32 = 64 * 1024;

impl FileProvider {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open package source {}", path.display()))?;
        let file_size = file.metadata()?.len();
        Ok(Self { file, file_size })
    }
}

impl BlockProvider for FileProvider {
    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn block_size(&self) -> u32 {
        FILE_BLOCK_SIZE
    }

    fn read_block(&mut self, dst: &mut [u8], block: u32) -> anyhow::Result<()> {
        let offset = block as u64 * FILE_BLOCK_SIZE as u64;
        self.file
            .read_exact_at(dst, offset)
            .with_context(|| format!("read block {block}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_provider_reads_blocks_and_short_tail() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let mut data = vec![0u8; FILE_BLOCK_SIZE as usize + 100];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let mut provider = FileProvider::open(tmp.path()).unwrap();
        assert_eq!(provider.file_size(), data.len() as u64);

        let mut block = vec![0u8; FILE_BLOCK_SIZE as usize];
        provider.read_block(&mut block, 0).unwrap();
        assert_eq!(&block[..], &data[..FILE_BLOCK_SIZE as usize]);

        let mut tail = vec![0u8; 100];
        provider.read_block(&mut tail, 1).unwrap();
        assert_eq!(&tail[..], &data[FILE_BLOCK_SIZE as usize..]);
    }
}
