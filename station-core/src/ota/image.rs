// Firmware image header: a 24 byte image header, one 8 byte segment header,
// then the 256 byte application descriptor

use std::io::{ErrorKind, Read};

use super::OtaError;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;
pub const APP_DESC_OFFSET: usize = 32;
pub const APP_DESC_LEN: usize = 256;
/// Bytes needed before the candidate image can be identified
pub const HEADER_LEN: usize = APP_DESC_OFFSET + APP_DESC_LEN;

const VERSION: (usize, usize) = (16, 32);
const PROJECT_NAME: (usize, usize) = (48, 32);
const TIME: (usize, usize) = (80, 16);
const DATE: (usize, usize) = (96, 16);
const IDF_VER: (usize, usize) = (112, 32);
const ELF_SHA256: (usize, usize) = (144, 32);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppDescriptor {
    pub secure_version: u32,
    pub version: String,
    pub project_name: String,
    pub time: String,
    pub date: String,
    pub idf_version: String,
    pub elf_sha256: [u8; 32],
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn put_c_string(dst: &mut [u8], value: &str) {
    // Always leave room for the terminator
    let n = value.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&value.as_bytes()[..n]);
}

/// Read the first [`HEADER_LEN`] bytes of a stream. Shorter streams return
/// what they had.
pub fn read_header(reader: &mut dyn Read) -> std::io::Result<Vec<u8>> {
    let mut header = vec![0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    header.truncate(filled);
    Ok(header)
}

impl AppDescriptor {
    /// Parse the descriptor out of the first [`HEADER_LEN`] image bytes
    pub fn parse(header: &[u8]) -> Result<Self, OtaError> {
        if header.len() < HEADER_LEN {
            return Err(OtaError::ChecksumFailed);
        }
        if header[0] != IMAGE_MAGIC {
            return Err(OtaError::InvalidMagicByte);
        }
        let desc = &header[APP_DESC_OFFSET..HEADER_LEN];
        let word = |i: usize| u32::from_le_bytes([desc[i], desc[i + 1], desc[i + 2], desc[i + 3]]);
        if word(0) != APP_DESC_MAGIC {
            return Err(OtaError::InvalidMagicByte);
        }
        let field = |(offset, len): (usize, usize)| c_string(&desc[offset..offset + len]);

        let mut elf_sha256 = [0u8; 32];
        elf_sha256.copy_from_slice(&desc[ELF_SHA256.0..ELF_SHA256.0 + ELF_SHA256.1]);

        Ok(Self {
            secure_version: word(4),
            version: field(VERSION),
            project_name: field(PROJECT_NAME),
            time: field(TIME),
            date: field(DATE),
            idf_version: field(IDF_VER),
            elf_sha256,
        })
    }

    /// Build a header carrying this descriptor. Used to produce test and
    /// simulator images.
    pub fn to_header(&self) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_LEN];
        header[0] = IMAGE_MAGIC;
        // Segment count
        header[1] = 1;
        let desc = &mut header[APP_DESC_OFFSET..];
        desc[0..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        desc[4..8].copy_from_slice(&self.secure_version.to_le_bytes());
        for ((offset, len), value) in [
            (VERSION, &self.version),
            (PROJECT_NAME, &self.project_name),
            (TIME, &self.time),
            (DATE, &self.date),
            (IDF_VER, &self.idf_version),
        ] {
            put_c_string(&mut desc[offset..offset + len], value);
        }
        desc[ELF_SHA256.0..ELF_SHA256.0 + ELF_SHA256.1].copy_from_slice(&self.elf_sha256);
        header
    }

    /// Same version and build stamp
    pub fn same_build(&self, other: &AppDescriptor) -> bool {
        self.version == other.version && self.date == other.date && self.time == other.time
    }
}
