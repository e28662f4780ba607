//! Raw capture buffers to packed RGBA: YUYV (BT.601), RGB24 and GREY.

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), ConvertError> {
    if buf.len() < expected {
        return Err(ConvertError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to RGBA using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgba(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut rgba = Vec::with_capacity(pixels * 4);
    for chunk in yuyv[..pixels * 2].chunks_exact(4) {
        let (u, v) = (chunk[1], chunk[3]);
        for y in [chunk[0], chunk[2]] {
            let [r, g, b] = ycbcr_to_rgb(y, u, v);
            rgba.extend_from_slice(&[r, g, b, 255]);
        }
    }
    Ok(rgba)
}

/// Convert packed 24-bit RGB to RGBA.
pub fn rgb24_to_rgba(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = (width * height) as usize;
    check_len("RGB3", rgb, pixels * 3)?;

    let mut rgba = Vec::with_capacity(pixels * 4);
    for px in rgb[..pixels * 3].chunks_exact(3) {
        rgba.extend_from_slice(&[px[0], px[1], px[2], 255]);
    }
    Ok(rgba)
}

/// Replicate 8-bit grayscale into RGBA.
pub fn grey_to_rgba(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = (width * height) as usize;
    check_len("GREY", gray, pixels)?;

    let mut rgba = Vec::with_capacity(pixels * 4);
    for &y in &gray[..pixels] {
        rgba.extend_from_slice(&[y, y, y, 255]);
    }
    Ok(rgba)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(c + 1.596 * e),
        clamp(c - 0.392 * d - 0.813 * e),
        clamp(c + 2.017 * d),
    ]
}
