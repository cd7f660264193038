//! QR rendering of the pairing bundle.

use qrcode_generator::QrCodeEcc;

use crate::bundle::PairingBundle;

/// Render the bundle as a PNG, for the broker's `/qr/image` endpoint.
pub fn bundle_to_png(bundle: &PairingBundle, size: usize) -> Result<Vec<u8>, QrError> {
    let json = bundle.to_json().map_err(|e| QrError::Serialize(e.to_string()))?;
    qrcode_generator::to_png_to_vec(json.as_bytes(), QrCodeEcc::Medium, size)
        .map_err(|e| QrError::Render(e.to_string()))
}

/// Render the bundle as a terminal block using half-height cells, for
/// `--qr` console output.
pub fn bundle_to_terminal(bundle: &PairingBundle) -> Result<String, QrError> {
    let json = bundle.to_json().map_err(|e| QrError::Serialize(e.to_string()))?;
    let matrix: Vec<Vec<bool>> =
        qrcode_generator::to_matrix(json.as_bytes(), QrCodeEcc::Medium)
            .map_err(|e| QrError::Render(e.to_string()))?;

    let mut out = String::new();
    // Two module rows per text line: upper half block, lower half block.
    for rows in matrix.chunks(2) {
        for x in 0..rows[0].len() {
            let top = rows[0][x];
            let bottom = rows.get(1).map(|r| r[x]).unwrap_or(false);
            out.push(match (top, bottom) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        out.push('\n');
    }
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("failed to serialize bundle: {0}")]
    Serialize(String),

    #[error("failed to render QR code: {0}")]
    Render(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> PairingBundle {
        PairingBundle {
            host: "10.0.0.5".into(),
            port: 8080,
            tls: false,
            token: "t".into(),
            fingerprint: None,
        }
    }

    #[test]
    fn png_has_magic_bytes() {
        let png = bundle_to_png(&bundle(), 256).unwrap();
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn terminal_render_is_square_ish() {
        let text = bundle_to_terminal(&bundle()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(!lines.is_empty());
        let width = lines[0].chars().count();
        // Half-height rendering: lines ~ width / 2.
        assert!(lines.len() >= width / 2);
    }
}
