//! PCAP capture of raw IPv4 frames flowing over a SLIP link.
//!
//! File layout matches `libpcap`'s classic (non-nanosecond) format: a fixed
//! 24-byte global header followed by one 16-byte record header plus payload
//! per packet. Not used for anything the stack reads back; purely a
//! diagnostic trace.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65535;
/// `LINKTYPE_RAW`: raw IPv4/IPv6, no link-layer header. The SLIP frame has
/// already been decoded to an IP packet by the time it reaches the writer.
const NETWORK_RAW_IP: u32 = 228;

const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_AGE: u32 = 10;

/// Appends one capture file, rotating by size and pruning by age.
///
/// Not `Sync`: the design note is explicit that "rotation is not
/// thread-safe and must be called by the single PCAP writer only," so this
/// type is only ever owned and driven by the writer thread.
pub(crate) struct PcapWriter {
    prefix: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_age: u32,
}

impl PcapWriter {
    pub(crate) fn open(prefix: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_limits(prefix, DEFAULT_MAX_SIZE, DEFAULT_MAX_AGE)
    }

    pub(crate) fn with_limits(prefix: impl Into<PathBuf>, max_size: u64, max_age: u32) -> io::Result<Self> {
        let prefix = prefix.into();
        let (file, written) = Self::open_fresh(&prefix)?;
        Ok(Self { prefix, file, written, max_size, max_age })
    }

    fn current_path(prefix: &Path) -> PathBuf {
        prefix.with_extension("pcap")
    }

    fn indexed_path(prefix: &Path, index: u32) -> PathBuf {
        let stem = prefix.file_stem().unwrap_or_default().to_string_lossy();
        let mut name = format!("{stem}_{index:03}");
        name.push_str(".pcap");
        prefix.with_file_name(name)
    }

    fn open_fresh(prefix: &Path) -> io::Result<(File, u64)> {
        let path = Self::current_path(prefix);
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        if written == 0 {
            write_global_header(&mut file)?;
        }
        let written = file.metadata()?.len();
        Ok((file, written))
    }

    /// Appends one captured frame, rotating first if it would push the
    /// current file over `max_size`.
    pub(crate) fn write_packet(&mut self, bytes: &[u8], captured_at: SystemTime) -> io::Result<()> {
        let record_len = 16 + bytes.len() as u64;
        if self.written > 0 && self.written + record_len > self.max_size {
            self.rotate()?;
        }

        let since_epoch = captured_at.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let incl_len = bytes.len().min(SNAPLEN as usize) as u32;

        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&(since_epoch.as_secs() as u32).to_ne_bytes());
        header[4..8].copy_from_slice(&(since_epoch.subsec_micros()).to_ne_bytes());
        header[8..12].copy_from_slice(&incl_len.to_ne_bytes());
        header[12..16].copy_from_slice(&(bytes.len() as u32).to_ne_bytes());

        self.file.write_all(&header)?;
        self.file.write_all(&bytes[..incl_len as usize])?;
        self.written += record_len;
        Ok(())
    }

    /// Closes the current file, shifts `prefix.pcap -> prefix_001.pcap ->
    /// prefix_002.pcap -> ...`, discards anything that would land beyond
    /// `max_age`, and opens a fresh `prefix.pcap`.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_age > 0 {
            let oldest = Self::indexed_path(&self.prefix, self.max_age);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            let mut index = self.max_age;
            while index > 1 {
                let from = Self::indexed_path(&self.prefix, index - 1);
                let to = Self::indexed_path(&self.prefix, index);
                if from.exists() {
                    fs::rename(&from, &to)?;
                }
                index -= 1;
            }
            let current = Self::current_path(&self.prefix);
            let first = Self::indexed_path(&self.prefix, 1);
            if current.exists() {
                fs::rename(&current, &first)?;
            }
        } else {
            fs::remove_file(Self::current_path(&self.prefix)).ok();
        }

        let (file, written) = Self::open_fresh(&self.prefix)?;
        self.file = file;
        self.written = written;
        Ok(())
    }
}

fn write_global_header(file: &mut File) -> io::Result<()> {
    let mut header = [0u8; 24];
    header[0..4].copy_from_slice(&MAGIC.to_ne_bytes());
    header[4..6].copy_from_slice(&VERSION_MAJOR.to_ne_bytes());
    header[6..8].copy_from_slice(&VERSION_MINOR.to_ne_bytes());
    // thiszone, sigfigs both zero.
    header[16..20].copy_from_slice(&SNAPLEN.to_ne_bytes());
    header[20..24].copy_from_slice(&NETWORK_RAW_IP.to_ne_bytes());
    file.write_all(&header)
}
