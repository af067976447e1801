//! Formats an opintos disk image and copies host files into its root
//! directory, going through the kernel's own file system layer so the
//! image is exactly what the kernel would have written.

use std::{
    env,
    fs::File,
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
    process,
};

use kernel::{
    block::BlockDevice,
    fs::{Filesystem, FsNode},
};
use opintos_fs_types::{NAME_MAX, SECTOR_SIZE};

/// A disk image file as a block device. Host I/O errors are fatal, like a
/// hard error from a real disk.
struct FileDisk {
    image: File,
    sectors: u32,
}

impl FileDisk {
    fn create(path: &Path, sectors: u32) -> io::Result<Self> {
        let image = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        image.set_len(u64::from(sectors) * SECTOR_SIZE as u64)?;
        Ok(Self { image, sectors })
    }
}

impl BlockDevice for FileDisk {
    fn read(&mut self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        self.image
            .seek(SeekFrom::Start(u64::from(sector) * SECTOR_SIZE as u64))
            .and_then(|_| self.image.read_exact(buf))
            .expect("image read failed");
    }

    fn write(&mut self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.image
            .seek(SeekFrom::Start(u64::from(sector) * SECTOR_SIZE as u64))
            .and_then(|_| self.image.write_all(buf))
            .expect("image write failed");
    }

    fn sector_count(&self) -> u32 {
        self.sectors
    }
}

fn short_name(path: &str) -> Result<&str, String> {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("{path}: not a usable file name"))?;
    if name.len() > NAME_MAX {
        return Err(format!("{name}: longer than {NAME_MAX} bytes"));
    }
    Ok(name)
}

fn run() -> Result<(), String> {
    let args = env::args().collect::<Vec<String>>();
    if args.len() < 3 {
        return Err(format!("Usage: {} fs.img sectors [files...]", args[0]));
    }
    let image_path = Path::new(&args[1]);
    let sectors: u32 = args[2]
        .parse()
        .map_err(|_| format!("{}: bad sector count", args[2]))?;
    let contents = &args[3..];

    let disk = FileDisk::create(image_path, sectors).map_err(|e| e.to_string())?;
    let mut fs = Filesystem::format(disk).map_err(|e| e.to_string())?;
    let root = fs.open_root().map_err(|e| e.to_string())?;

    for path in contents {
        let name = short_name(path)?;
        let mut data = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| format!("{path}: {e}"))?;

        fs.create_file(&root, name.as_bytes(), 0)
            .map_err(|e| format!("{name}: {e}"))?;
        let FsNode::File(mut file) = fs
            .open_node(&root, name.as_bytes())
            .map_err(|e| format!("{name}: {e}"))?
        else {
            return Err(format!("{name}: not a regular file"));
        };
        let written = fs.file_write(&mut file, &data);
        fs.file_close(file);
        if written != data.len() {
            return Err(format!("{name}: image full after {written} bytes"));
        }
        eprintln!("mkfs: {name}: {} bytes", data.len());
    }

    fs.dir_close(root);
    fs.flush().map_err(|e| e.to_string())?;

    let free = fs.free_sectors();
    eprintln!(
        "mkfs: {}: {} of {} sectors in use",
        image_path.display(),
        sectors - free,
        sectors,
    );
    Ok(())
}

fn main() {
    if let Err(message) = run() {
        eprintln!("{message}");
        process::exit(1);
    }
}
