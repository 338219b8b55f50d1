//! Identify Controller / Identify Namespace payloads.
//!
//! Built once at controller init and served byte-for-byte on Identify
//! commands. Field values beyond what the guest driver strictly needs
//! (model number, firmware revision, IEEE OUI, power state table, ...)
//! are filled in from the reference controller's defaults so a real NVMe
//! driver sees a plausible, fully-populated device.

pub const IDENTIFY_PAGE_SIZE: usize = 4096;

const MODEL_NUMBER: &str = "nvme-emu Controller";
const FIRMWARE_REVISION: &str = "1.0";
/// Locally-administered IEEE OUI (the same block conventionally used by
/// virtualization software for synthesized device identities).
const IEEE_OUI: [u8; 3] = [0x52, 0x54, 0x00];

fn write_padded_ascii(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = b' ';
    }
}

/// Build the 4096-byte Identify Controller data structure.
pub fn build_controller_data(vid: u16, ssvid: u16, serial: &str, num_namespaces: u32) -> Vec<u8> {
    let mut buf = vec![0u8; IDENTIFY_PAGE_SIZE];

    buf[0..2].copy_from_slice(&vid.to_le_bytes());
    buf[2..4].copy_from_slice(&ssvid.to_le_bytes());
    write_padded_ascii(&mut buf[4..24], serial); // SN
    write_padded_ascii(&mut buf[24..64], MODEL_NUMBER); // MN
    write_padded_ascii(&mut buf[64..72], FIRMWARE_REVISION); // FR
    buf[72] = 4; // RAB (retry/abort limit)
    buf[73..76].copy_from_slice(&IEEE_OUI); // IEEE OUI
    buf[76] = 0; // CMIC: no multi-port/multi-controller

    buf[77] = 9; // MDTS: advertised, not enforced (see design notes)
    buf[78..80].copy_from_slice(&0u16.to_le_bytes()); // CNTLID

    buf[80..84].copy_from_slice(&reg_ver().to_le_bytes()); // VER

    buf[256..258].copy_from_slice(&0u16.to_le_bytes()); // OACS (no format/firmware support)
    buf[256] = 0x01; // OACS.FORMAT supported
    buf[258] = 2; // ACL
    buf[259] = 4; // AERL

    buf[260] = 0x00; // FRMW
    buf[261] = 0x00; // LPA
    buf[262] = 0x00; // ELPE
    buf[263] = 1; // NPSS: one power state supported
    buf[264] = 0x00; // AVSCC

    buf[512..514].copy_from_slice(&0x0157u16.to_le_bytes()); // WCTEMP
    buf[514..516].copy_from_slice(&0x0157u16.to_le_bytes()); // CCTEMP

    // SQES / CQES: min/max log2(entry size), nibble-packed.
    buf[512 + 62] = (6 << 4) | 6; // SQES at offset 574
    buf[512 + 63] = (4 << 4) | 4; // CQES at offset 575

    buf[516] = (num_namespaces & 0xFF) as u8; // NN
    buf[517] = ((num_namespaces >> 8) & 0xFF) as u8;
    buf[518] = ((num_namespaces >> 16) & 0xFF) as u8;
    buf[519] = ((num_namespaces >> 24) & 0xFF) as u8;

    buf[520] = 0x00; // ONCS

    buf[525] = 0x03; // FNA: format applies to all namespaces, erase supported

    // Power State Descriptor 0, at offset 2048, 32 bytes: MP (max power) at
    // offset 0 of the descriptor, in 0.01W units.
    buf[2048..2050].copy_from_slice(&(10u16 * 100).to_le_bytes());

    buf
}

fn reg_ver() -> u32 {
    super::reg::VS_1_3
}

/// Build the 4096-byte Identify Namespace data structure for the single
/// namespace this controller exposes.
pub fn build_namespace_data(size_bytes: u64, sector_size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; IDENTIFY_PAGE_SIZE];
    let nsze = size_bytes / sector_size as u64;

    buf[0..8].copy_from_slice(&nsze.to_le_bytes()); // NSZE
    buf[8..16].copy_from_slice(&nsze.to_le_bytes()); // NCAP
    buf[16..24].copy_from_slice(&nsze.to_le_bytes()); // NUSE

    buf[24] = 0x00; // NSFEATS
    buf[25] = 1; // NLBAF: one format supported (LBAF0)
    buf[26] = 0x00; // FLBAS: format index 0, no metadata
    buf[27] = 0x00; // MC
    buf[28] = 0x00; // DPC
    buf[29] = 0x00; // DPS

    let lbads = (31 - sector_size.leading_zeros()) as u8; // log2(sector_size)
    // LBA Format 0 descriptor at offset 128: MS(u16)=0, LBADS(u8), RP(u8)
    buf[128..130].copy_from_slice(&0u16.to_le_bytes());
    buf[130] = lbads;
    buf[131] = 0;

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_data_places_vid_at_offset_zero() {
        let buf = build_controller_data(0xFB5D, 0xFB5D, "SERIAL0001", 1);
        assert_eq!(u16::from_le_bytes(buf[0..2].try_into().unwrap()), 0xFB5D);
        assert_eq!(
            u32::from_le_bytes(buf[80..84].try_into().unwrap()),
            crate::devices::nvme::reg::VS_1_3
        );
    }

    #[test]
    fn namespace_size_derives_from_backing_and_sector_size() {
        let buf = build_namespace_data(1024 * 1024, 512);
        let nsze = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        assert_eq!(nsze, 2048);
        assert_eq!(buf[130], 9); // log2(512) == 9
    }
}
