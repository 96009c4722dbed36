//! Format a walfs image file and optionally copy host files into its root
//! directory.

use std::fs::{File as HostFile, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::info;
use walfs::{BlockDevice, FileSystem, OpenFlags, BSIZE, LOGSIZE};

/// Image file exposed as a block device.
struct BlockFile(Mutex<HostFile>);

impl BlockDevice for BlockFile {
    fn read_block(&self, blockno: u32, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("mkfs: seek");
        file.read_exact(buf).expect("mkfs: read block");
    }

    fn write_block(&self, blockno: u32, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))
            .expect("mkfs: seek");
        file.write_all(buf).expect("mkfs: write block");
    }
}

#[derive(Parser)]
#[command(about = "Format and populate a walfs filesystem image")]
struct Cli {
    /// Output image file
    #[arg(long, short, default_value = "fs.img")]
    out: PathBuf,

    /// Image size in blocks
    #[arg(long, default_value_t = 1000)]
    size: u32,

    /// Number of on-disk inodes
    #[arg(long, default_value_t = 200)]
    ninodes: u32,

    /// Log region size in blocks
    #[arg(long, default_value_t = LOGSIZE as u32)]
    nlog: u32,

    /// Copy every regular file from this directory into the image root
    #[arg(long, short)]
    source: Option<PathBuf>,
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.out)?;
    fd.set_len(cli.size as u64 * BSIZE as u64)?;
    let device = Arc::new(BlockFile(Mutex::new(fd)));

    let fs = FileSystem::format(device, 1, cli.size, cli.ninodes, cli.nlog);

    if let Some(source) = &cli.source {
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_str().expect("mkfs: file name is not utf-8");

            let mut data = Vec::new();
            HostFile::open(entry.path())?.read_to_end(&mut data)?;

            let path = format!("/{}", name);
            let file = FileSystem::open(&fs, &path, OpenFlags::CREATE | OpenFlags::WRONLY, None)
                .unwrap_or_else(|e| panic!("mkfs: create {}: {}", path, e));
            file.write(&data)
                .unwrap_or_else(|e| panic!("mkfs: write {}: {}", path, e));
            info!("copied {} ({} bytes)", name, data.len());
        }
    }

    println!("{}: {} blocks, {} inodes", cli.out.display(), cli.size, cli.ninodes);
    Ok(())
}
