//! Firmware ingestion and classification.
//!
//! Vendor firmware arrives in several wrappings: raw images, ZIP containers
//! with a CRC trailer, and XTEA-encrypted payloads. Ingestion normalizes all
//! of them to the raw image bytes; classification then decides which
//! controller family the image targets, from the bytes alone.

mod cipher;
mod container;

use crate::{utils::find_pattern_offsets, FirmwareKind};
use std::{fs, io, path::Path, sync::Arc};

/// Byte pattern marking the signing-table base inside Brightway images.
const DFU_SIGNING_PATTERN: [u8; 2] = [0x63, 0x7C];
/// Second marker, expected just past the signing base.
const DFU_RAND_PATTERN: [u8; 2] = [0x01, 0x02];

const DFU_SIGNATURE: &[u8; 8] = b"DEPRD5C\0";
const DFU_SIGNATURE_OFFSET: usize = 0x800;

/// Images shorter than this are never classifiable.
const MIN_CLASSIFIABLE_LEN: usize = 0x1000;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("firmware file not found: {0}")]
    NotFound(#[source] io::Error),
    #[error("invalid firmware archive: {0}")]
    BadArchive(String),
}

/// Reads and normalizes a firmware file.
pub fn ingest_file(path: &Path) -> Result<Arc<[u8]>, IngestError> {
    let raw = fs::read(path).map_err(IngestError::NotFound)?;
    ingest(raw)
}

/// Normalizes raw firmware bytes: container extraction, optional decryption,
/// trailer trim.
///
/// Decryption failure is not fatal; the payload is kept as-is when the
/// decrypted bytes don't look any more like an image than the original.
/// Ingesting already-ingested bytes is a no-op.
pub fn ingest(raw: Vec<u8>) -> Result<Arc<[u8]>, IngestError> {
    let from_container = container::is_container(&raw);
    let mut fw = if from_container {
        container::extract(&raw)?
    } else {
        raw
    };

    if model_id(&fw).is_none() {
        let decrypted = cipher::decrypt_payload(&fw);
        if model_id(&decrypted).is_some() {
            fw = decrypted;
        }
    }

    // Containers carry a 2-byte CRC trailer after the image proper.
    if from_container && fw.len() > 4096 {
        fw.truncate(fw.len() - 2);
    }

    Ok(fw.into())
}

/// Tries to decode the model identifier stored near the start of plaintext
/// images. Used to decide whether a payload still needs decryption.
fn model_id(fw: &[u8]) -> Option<&str> {
    [0x100..0x10F, 0x400..0x40E]
        .into_iter()
        .find_map(|region| {
            let bytes = fw.get(region)?;
            let text = std::str::from_utf8(bytes).ok()?;
            text.chars().next().filter(char::is_ascii_alphanumeric)?;
            text.is_ascii().then_some(text)
        })
}

/// Identifies the controller family an image targets.
///
/// Pure and idempotent; never returns `Dfu` and `Leqi` for the same bytes,
/// since the checks run in that order.
pub fn classify(fw: &[u8]) -> FirmwareKind {
    if fw.len() < MIN_CLASSIFIABLE_LEN {
        return FirmwareKind::Unknown;
    }

    if is_dfu(fw) {
        FirmwareKind::Dfu
    } else if is_leqi(fw) {
        FirmwareKind::Leqi
    } else if ninebot_version(fw).is_some() {
        FirmwareKind::Ninebot
    } else {
        FirmwareKind::Unknown
    }
}

fn is_dfu(fw: &[u8]) -> bool {
    if fw.len() > DFU_SIGNATURE_OFFSET + 8
        && &fw[DFU_SIGNATURE_OFFSET..DFU_SIGNATURE_OFFSET + 8] == DFU_SIGNATURE
    {
        return true;
    }

    // Fallback: the signing pattern exists exactly once, past the vector
    // table.
    let offsets = find_pattern_offsets(&DFU_SIGNING_PATTERN, fw, 0);
    offsets.len() == 1 && offsets[0] > 0x1000
}

fn is_leqi(fw: &[u8]) -> bool {
    // Leqi images are XOR-0xAA encrypted, so the header region is dense with
    // 0xAA bytes and "AA A2" encrypted-pointer pairs.
    let Some(header) = fw.get(0x80..0x400) else {
        return false;
    };
    let pair_count = find_pattern_offsets(&[0xAA, 0xA2], header, 0).len();
    let aa_count = header.iter().filter(|&&byte| byte == 0xAA).count();
    pair_count > 10 && aa_count > 50
}

/// Recovers the version string embedded in Ninebot images: the run of
/// printable ASCII after the first NUL at or past `0x107`, up to the next
/// NUL.
pub fn ninebot_version(fw: &[u8]) -> Option<String> {
    let nul = 0x107 + fw.get(0x107..)?.iter().position(|&byte| byte == 0)?;
    let start = nul + 1;
    let len = fw
        .get(start..)?
        .iter()
        .position(|&byte| byte == 0)
        .filter(|&len| len > 0)?;
    let version = &fw[start..start + len];
    version
        .iter()
        .all(|byte| byte.is_ascii_graphic() || *byte == b' ')
        .then(|| String::from_utf8_lossy(version).into_owned())
}

/// The two signing offsets discovered inside a Brightway image.
///
/// `base` is the unique offset of the `63 7C` pattern; `rand` is one byte
/// before the unique `01 02` occurrence in the suffix starting at `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigningOffsets {
    pub base: usize,
    pub rand: usize,
}

impl SigningOffsets {
    /// Locates the signing offsets, or `None` when either pattern is missing
    /// or ambiguous (the image is then rejected as invalid).
    pub fn find(fw: &[u8]) -> Option<Self> {
        let base = match find_pattern_offsets(&DFU_SIGNING_PATTERN, fw, 0)[..] {
            [offset] => offset,
            _ => return None,
        };
        let rand = match find_pattern_offsets(&DFU_RAND_PATTERN, fw, base)[..] {
            [offset] => offset - 1,
            _ => return None,
        };
        Some(SigningOffsets { base, rand })
    }
}

/// Human-oriented summary of a classified image, shown by the CLI before
/// flashing.
#[derive(Clone, Debug)]
pub struct FirmwareInfo {
    pub kind: FirmwareKind,
    pub size: usize,
    /// DFU: the ASCII signature at `0x800`, when present.
    pub signature: Option<String>,
    /// DFU: offset of the signing pattern.
    pub signing_offset: Option<usize>,
    /// Ninebot: embedded version string.
    pub version: Option<String>,
}

pub fn info(fw: &[u8]) -> FirmwareInfo {
    let kind = classify(fw);
    let mut info = FirmwareInfo {
        kind,
        size: fw.len(),
        signature: None,
        signing_offset: None,
        version: None,
    };
    match kind {
        FirmwareKind::Dfu => {
            info.signature = fw
                .get(DFU_SIGNATURE_OFFSET..DFU_SIGNATURE_OFFSET + 7)
                .and_then(|sig| std::str::from_utf8(sig).ok())
                .map(str::to_owned);
            info.signing_offset = SigningOffsets::find(fw).map(|offsets| offsets.base);
        }
        FirmwareKind::Ninebot => info.version = ninebot_version(fw),
        FirmwareKind::Leqi | FirmwareKind::Unknown => {}
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dfu_image() -> Vec<u8> {
        let mut fw = vec![0x00; 0x20000];
        fw[DFU_SIGNATURE_OFFSET..DFU_SIGNATURE_OFFSET + 8].copy_from_slice(DFU_SIGNATURE);
        fw[0x17080..0x17082].copy_from_slice(&DFU_SIGNING_PATTERN);
        fw[0x17082..0x17084].copy_from_slice(&DFU_RAND_PATTERN);
        fw
    }

    fn leqi_image() -> Vec<u8> {
        let mut fw = vec![0x00; 0x8000];
        for i in 0..30 {
            fw[0x80 + i * 4] = 0xAA;
            fw[0x80 + i * 4 + 1] = 0xA2;
        }
        fw
    }

    #[test]
    fn classifies_dfu_by_signature() {
        let mut fw = vec![0x00; 0x2000];
        fw[DFU_SIGNATURE_OFFSET..DFU_SIGNATURE_OFFSET + 8].copy_from_slice(DFU_SIGNATURE);
        assert_eq!(classify(&fw), FirmwareKind::Dfu);
    }

    #[test]
    fn classifies_dfu_by_unique_pattern() {
        let mut fw = vec![0x00; 0x20000];
        fw[0x17080..0x17082].copy_from_slice(&DFU_SIGNING_PATTERN);
        assert_eq!(classify(&fw), FirmwareKind::Dfu);
    }

    #[test]
    fn pattern_below_vector_table_is_not_dfu() {
        let mut fw = vec![0x00; 0x20000];
        fw[0x900..0x902].copy_from_slice(&DFU_SIGNING_PATTERN);
        assert_eq!(classify(&fw), FirmwareKind::Unknown);
    }

    #[test]
    fn classifies_leqi() {
        assert_eq!(classify(&leqi_image()), FirmwareKind::Leqi);
    }

    #[test]
    fn classifies_ninebot() {
        let mut fw = vec![0x01; 0x2000];
        fw[0x110] = 0x00;
        fw[0x111..0x117].copy_from_slice(b"V1.2.3");
        fw[0x117] = 0x00;
        assert_eq!(classify(&fw), FirmwareKind::Ninebot);
        assert_eq!(ninebot_version(&fw).as_deref(), Some("V1.2.3"));
    }

    #[test]
    fn short_image_is_unknown() {
        let fw = leqi_image()[..0xFFF].to_vec();
        assert_eq!(classify(&fw), FirmwareKind::Unknown);
        // Exactly 0x1000 bytes may still classify.
        let fw = leqi_image()[..0x1000].to_vec();
        assert_eq!(classify(&fw), FirmwareKind::Leqi);
    }

    #[test]
    fn classification_is_stable() {
        let fw = dfu_image();
        assert_eq!(classify(&fw), classify(&fw));
    }

    #[test]
    fn signing_offsets_found_once() {
        let fw = dfu_image();
        let offsets = SigningOffsets::find(&fw).unwrap();
        assert_eq!(offsets, SigningOffsets { base: 0x17080, rand: 0x17081 });
    }

    #[test]
    fn duplicate_signing_pattern_is_rejected() {
        let mut fw = dfu_image();
        fw[0x18000..0x18002].copy_from_slice(&DFU_SIGNING_PATTERN);
        assert!(SigningOffsets::find(&fw).is_none());
    }

    #[test]
    fn missing_rand_pattern_is_rejected() {
        let mut fw = vec![0x00; 0x20000];
        fw[0x17080..0x17082].copy_from_slice(&DFU_SIGNING_PATTERN);
        assert!(SigningOffsets::find(&fw).is_none());
    }

    #[test]
    fn ingest_raw_bytes_is_idempotent() {
        let fw = dfu_image();
        let once = ingest(fw.clone()).unwrap();
        let twice = ingest(once.to_vec()).unwrap();
        assert_eq!(&once[..], &fw[..]);
        assert_eq!(once, twice);
    }

    #[test]
    fn model_id_regions() {
        let mut fw = vec![0xFF; 0x1000];
        assert!(model_id(&fw).is_none());
        fw[0x100..0x10F].copy_from_slice(b"EC_ESC_Driver10");
        assert_eq!(model_id(&fw), Some("EC_ESC_Driver10"));

        let mut fw = vec![0xFF; 0x1000];
        fw[0x400..0x40E].copy_from_slice(b"4Pro2ndDriver1");
        assert_eq!(model_id(&fw), Some("4Pro2ndDriver1"));
    }

    #[test]
    fn ingest_unwraps_encrypted_container() {
        use std::io::Write;

        let mut image = dfu_image();
        image[0x100..0x10F].copy_from_slice(b"EC_ESC_Driver10");

        // Vendor bundle: ZIP around the encrypted image plus a 2-byte CRC
        // trailer.
        let mut payload = cipher::encrypt_payload(&image);
        payload.extend_from_slice(&[0xBE, 0xEF]);
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file(
                "EC_ESC_Driver_4Pro2nd.bin.enc",
                zip::write::FileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        writer.write_all(&payload).unwrap();
        let bundle = writer.finish().unwrap().into_inner();

        let ingested = ingest(bundle).unwrap();
        assert_eq!(&ingested[..], &image[..]);
        assert_eq!(classify(&ingested), FirmwareKind::Dfu);

        let again = ingest(ingested.to_vec()).unwrap();
        assert_eq!(again, ingested);
    }

    #[test]
    fn info_for_dfu_image() {
        let fw = dfu_image();
        let info = info(&fw);
        assert_eq!(info.kind, FirmwareKind::Dfu);
        assert_eq!(info.signature.as_deref(), Some("DEPRD5C"));
        assert_eq!(info.signing_offset, Some(0x17080));
    }
}
