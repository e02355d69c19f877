//! ZIP container unwrapping for vendor firmware bundles.

use super::IngestError;
use std::io::{Cursor, Read};

/// Magic of a local-file ZIP header.
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

pub fn is_container(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == ZIP_MAGIC
}

/// Extracts the firmware member from a ZIP container.
///
/// Vendor bundles name the image `EC_ESC_Driver…` or give it an `.enc`
/// suffix; the first member is the fallback for unlabeled bundles.
pub fn extract(bytes: &[u8]) -> Result<Vec<u8>, IngestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| IngestError::BadArchive(e.to_string()))?;
    if archive.len() == 0 {
        return Err(IngestError::BadArchive("empty archive".into()));
    }

    let index = (0..archive.len())
        .find(|&i| {
            archive.by_index(i).is_ok_and(|member| {
                member.name().starts_with("EC_ESC_Driver") || member.name().ends_with(".enc")
            })
        })
        .unwrap_or(0);

    let mut member = archive
        .by_index(index)
        .map_err(|e| IngestError::BadArchive(e.to_string()))?;
    let mut payload = Vec::with_capacity(member.size() as usize);
    member
        .read_to_end(&mut payload)
        .map_err(|e| IngestError::BadArchive(e.to_string()))?;
    Ok(payload)
}
