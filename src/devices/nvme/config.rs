//! Parser for the controller's `opts=` configuration string:
//! `maxq=N,qsz=N,ioslots=N,sectsz={512,4096,8192},ser=STRING,ram=MEGABYTES`
//! (or a bare path, which the host's backend opener resolves externally).

use super::error::NvmeError;

pub const DEFAULT_MAX_QUEUES: u32 = 16;
pub const DEFAULT_QUEUE_SIZE: u32 = 2048;
pub const DEFAULT_IO_SLOTS: u32 = 8;
pub const DEFAULT_SECTOR_SIZE: u32 = 512;
const SERIAL_MAX_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    /// `ram=N`: an in-memory disk of N megabytes.
    Ram { megabytes: u64 },
    /// Any other positional token: a path resolved by the host's
    /// `BlockBackend` opener, external to this controller.
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeOptions {
    pub max_queues: u32,
    pub queue_size: u32,
    pub io_slots: u32,
    pub sector_size: u32,
    pub serial: [u8; SERIAL_MAX_LEN],
    pub backend: Option<BackendSpec>,
}

impl Default for NvmeOptions {
    fn default() -> Self {
        Self {
            max_queues: DEFAULT_MAX_QUEUES,
            queue_size: DEFAULT_QUEUE_SIZE,
            io_slots: DEFAULT_IO_SLOTS,
            sector_size: DEFAULT_SECTOR_SIZE,
            serial: Self::pad_serial(""),
            backend: None,
        }
    }
}

impl NvmeOptions {
    fn pad_serial(s: &str) -> [u8; SERIAL_MAX_LEN] {
        let mut buf = [0u8; SERIAL_MAX_LEN];
        let bytes = s.as_bytes();
        let n = bytes.len().min(SERIAL_MAX_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        buf
    }

    pub fn serial_str(&self) -> String {
        let n = self.serial.iter().position(|&b| b == 0).unwrap_or(SERIAL_MAX_LEN);
        String::from_utf8_lossy(&self.serial[..n]).into_owned()
    }

    /// Parse a comma-separated option string. Validates sector size against
    /// the {512, 4096, 8192} allow-list; other key=value pairs are accepted
    /// loosely (an unknown key is ignored, matching the permissive style of
    /// the source option parser).
    pub fn parse(input: &str) -> Result<Self, NvmeError> {
        let mut opts = NvmeOptions::default();
        if input.trim().is_empty() {
            return Ok(opts);
        }

        for tok in input.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            match tok.split_once('=') {
                Some(("maxq", v)) => {
                    opts.max_queues = parse_u32(v, "maxq")?;
                }
                Some(("qsz", v)) => {
                    opts.queue_size = parse_u32(v, "qsz")?;
                }
                Some(("ioslots", v)) => {
                    opts.io_slots = parse_u32(v, "ioslots")?;
                }
                Some(("sectsz", v)) => {
                    let sz = parse_u32(v, "sectsz")?;
                    if !matches!(sz, 512 | 4096 | 8192) {
                        return Err(NvmeError::InvalidConfig(format!(
                            "sectsz={sz} must be one of 512, 4096, 8192"
                        )));
                    }
                    opts.sector_size = sz;
                }
                Some(("ser", v)) => {
                    if v.len() > SERIAL_MAX_LEN {
                        return Err(NvmeError::InvalidConfig(format!(
                            "ser must be at most {SERIAL_MAX_LEN} bytes"
                        )));
                    }
                    opts.serial = Self::pad_serial(v);
                }
                Some(("ram", v)) => {
                    let mb = v.parse::<u64>().map_err(|_| {
                        NvmeError::InvalidConfig(format!("ram={v} is not a byte count"))
                    })?;
                    opts.backend = Some(BackendSpec::Ram { megabytes: mb });
                }
                Some((key, _)) => {
                    log::debug!("nvme: ignoring unrecognized option key '{key}'");
                }
                None => {
                    // Positional token with no '=': a backing path, unless
                    // it already looks like `ram=` (handled above).
                    opts.backend = Some(BackendSpec::Path(tok.to_string()));
                }
            }
        }

        Ok(opts)
    }
}

fn parse_u32(v: &str, key: &str) -> Result<u32, NvmeError> {
    v.parse::<u32>()
        .map_err(|_| NvmeError::InvalidConfig(format!("{key}={v} is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let o = NvmeOptions::parse("").unwrap();
        assert_eq!(o, NvmeOptions::default());
    }

    #[test]
    fn parses_all_known_keys() {
        let o = NvmeOptions::parse("maxq=8,qsz=256,ioslots=4,sectsz=4096,ser=ABC123,ram=64")
            .unwrap();
        assert_eq!(o.max_queues, 8);
        assert_eq!(o.queue_size, 256);
        assert_eq!(o.io_slots, 4);
        assert_eq!(o.sector_size, 4096);
        assert_eq!(o.serial_str(), "ABC123");
        assert_eq!(o.backend, Some(BackendSpec::Ram { megabytes: 64 }));
    }

    #[test]
    fn rejects_bad_sector_size() {
        assert!(NvmeOptions::parse("sectsz=1000").is_err());
    }

    #[test]
    fn bare_path_is_backend_path() {
        let o = NvmeOptions::parse("maxq=4,/var/nvme/disk.img").unwrap();
        assert_eq!(o.backend, Some(BackendSpec::Path("/var/nvme/disk.img".into())));
    }

    #[test]
    fn serial_too_long_is_rejected() {
        assert!(NvmeOptions::parse("ser=012345678901234567890").is_err());
    }
}
