//! Descriptor file formats.
//!
//! Two formats are supported:
//! - a little-endian binary format (`WSFT` magic) that round-trips
//!   keypoints and float descriptors bitwise;
//! - a text format following the VisualSFM/Lowe convention, with
//!   byte-quantized descriptor components.
//!
//! The text format quantizes with a 512 scale on save but divides by 128 on
//! load, a historical inconsistency kept for compatibility; loaded vectors
//! are re-normalized to unit length, which absorbs the constant factor.

use std::io::{self, BufRead, BufReader, Read, Write};

use ndarray::Array2;

use crate::error::Result;
use crate::{KeyPoint, DESCRIPTOR_QUANT_SCALE, DESCRIPTOR_SIZE};

pub const BINARY_MAGIC: [u8; 4] = *b"WSFT";
pub const BINARY_VERSION: u32 = 1;
/// Bytes per keypoint record: 20 header + 128 f32.
const RECORD_BYTES: usize = 20 + DESCRIPTOR_SIZE * 4;

fn bad_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Writes keypoints and float descriptors in the binary format.
///
/// Layout: magic, version, keypoint count, dim (128), original image width
/// and height, 8 reserved bytes; then per keypoint x, y, sigma and
/// orientation as f32, octave as i32, and the 128 f32 descriptor
/// (532 bytes per record).
pub fn write_binary<W: Write>(
    mut w: W,
    keypoints: &[KeyPoint],
    descriptors: &Array2<f32>,
    image_width: u32,
    image_height: u32,
) -> Result<()> {
    assert_eq!(keypoints.len(), descriptors.nrows());
    assert_eq!(descriptors.ncols(), DESCRIPTOR_SIZE);

    w.write_all(&BINARY_MAGIC)?;
    w.write_all(&BINARY_VERSION.to_le_bytes())?;
    w.write_all(&(keypoints.len() as u32).to_le_bytes())?;
    w.write_all(&(DESCRIPTOR_SIZE as u32).to_le_bytes())?;
    w.write_all(&image_width.to_le_bytes())?;
    w.write_all(&image_height.to_le_bytes())?;
    w.write_all(&[0u8; 8])?;

    for (kp, desc) in keypoints.iter().zip(descriptors.rows()) {
        w.write_all(&kp.x.to_le_bytes())?;
        w.write_all(&kp.y.to_le_bytes())?;
        w.write_all(&kp.sigma.to_le_bytes())?;
        w.write_all(&kp.orientation.to_le_bytes())?;
        w.write_all(&(kp.octave as i32).to_le_bytes())?;
        for v in desc {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Reads the binary format back. Returns keypoints, descriptors and the
/// recorded original image dimensions.
///
/// The scale index is not stored; it is re-derived from sigma assuming the
/// default sigma progression, which is enough to re-run descriptor
/// extraction but is not part of the round-trip guarantee.
pub fn read_binary<R: Read>(mut r: R) -> Result<(Vec<KeyPoint>, Array2<f32>, (u32, u32))> {
    let mut header = [0u8; 32];
    r.read_exact(&mut header)?;
    if header[..4] != BINARY_MAGIC {
        return Err(bad_data("bad magic, not a WSFT file").into());
    }
    let word = |i: usize| u32::from_le_bytes(header[i..i + 4].try_into().expect("4 bytes"));
    let version = word(4);
    if version != BINARY_VERSION {
        return Err(bad_data(format!("unsupported version {version}")).into());
    }
    let count = word(8) as usize;
    let dim = word(12) as usize;
    if dim != DESCRIPTOR_SIZE {
        return Err(bad_data(format!("unsupported descriptor dim {dim}")).into());
    }
    let width = word(16);
    let height = word(20);

    let mut keypoints = Vec::with_capacity(count);
    let mut descriptors = Array2::<f32>::zeros((count, DESCRIPTOR_SIZE));
    let mut record = [0u8; RECORD_BYTES];
    for i in 0..count {
        r.read_exact(&mut record)?;
        let f = |o: usize| f32::from_le_bytes(record[o..o + 4].try_into().expect("4 bytes"));
        let octave = i32::from_le_bytes(record[16..20].try_into().expect("4 bytes")).max(0);
        let sigma = f(8);
        let octave_sigma = sigma / (1u32 << octave.min(31)) as f32;
        let scale = ((octave_sigma / 1.6).log2() * 3.0).round().clamp(1.0, 3.0) as usize;
        keypoints.push(KeyPoint {
            x: f(0),
            y: f(4),
            octave: octave as usize,
            scale,
            sigma,
            orientation: f(12),
        });
        for (k, v) in descriptors.row_mut(i).iter_mut().enumerate() {
            *v = f(20 + k * 4);
        }
    }
    Ok((keypoints, descriptors, (width, height)))
}

/// Writes the text format: a `"<count> 128"` header line, then one row per
/// keypoint with `x y sigma orientation` followed by the descriptor
/// components quantized as `round(clamp(d, 0, 1) * 512)` clipped to 0..255.
pub fn write_text<W: Write>(
    mut w: W,
    keypoints: &[KeyPoint],
    descriptors: &Array2<f32>,
) -> Result<()> {
    assert_eq!(keypoints.len(), descriptors.nrows());
    writeln!(w, "{} {}", keypoints.len(), DESCRIPTOR_SIZE)?;
    for (kp, desc) in keypoints.iter().zip(descriptors.rows()) {
        write!(w, "{} {} {} {}", kp.x, kp.y, kp.sigma, kp.orientation)?;
        for v in desc {
            let q = (v.clamp(0.0, 1.0) * DESCRIPTOR_QUANT_SCALE)
                .round()
                .min(255.0) as u8;
            write!(w, " {q}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Reads the text format. Descriptor bytes are divided by 128 and the
/// vector re-normalized to unit L2 (see the module docs for why the
/// divisor differs from the save scale). Octave and scale are not stored
/// in this format and default to 0 and 1.
pub fn read_text<R: Read>(r: R) -> Result<(Vec<KeyPoint>, Array2<f32>)> {
    let mut lines = BufReader::new(r).lines();
    let header = lines
        .next()
        .ok_or_else(|| bad_data("empty descriptor file"))??;
    let mut parts = header.split_whitespace();
    let count: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad_data("bad header"))?;
    let dim: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad_data("bad header"))?;
    if dim != DESCRIPTOR_SIZE {
        return Err(bad_data(format!("unsupported descriptor dim {dim}")).into());
    }

    let mut keypoints = Vec::with_capacity(count);
    let mut descriptors = Array2::<f32>::zeros((count, DESCRIPTOR_SIZE));
    for i in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| bad_data(format!("expected {count} rows, got {i}")))??;
        let mut fields = line.split_whitespace();
        let mut next_f32 = || -> io::Result<f32> {
            fields
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| bad_data(format!("short row {i}")))
        };
        let x = next_f32()?;
        let y = next_f32()?;
        let sigma = next_f32()?;
        let orientation = next_f32()?;
        keypoints.push(KeyPoint {
            x,
            y,
            octave: 0,
            scale: 1,
            sigma,
            orientation,
        });
        let mut row = descriptors.row_mut(i);
        for v in row.iter_mut() {
            *v = next_f32()? / 128.0;
        }
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-12 {
            row.mapv_inplace(|v| v / norm);
        }
    }
    Ok((keypoints, descriptors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(n: usize) -> (Vec<KeyPoint>, Array2<f32>) {
        let keypoints: Vec<KeyPoint> = (0..n)
            .map(|i| KeyPoint {
                x: 10.5 + i as f32,
                y: 20.25 * (i + 1) as f32,
                octave: i % 4,
                scale: 1 + i % 3,
                sigma: 1.6 * 2f32.powf((1 + i % 3) as f32 / 3.0) * (1 << (i % 4)) as f32,
                orientation: 0.5 * i as f32,
            })
            .collect();
        let mut descriptors = Array2::<f32>::zeros((n, DESCRIPTOR_SIZE));
        for (i, mut row) in descriptors.rows_mut().into_iter().enumerate() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = ((i * 31 + k * 7) % 100) as f32 / 500.0;
            }
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            row.mapv_inplace(|v| v / norm);
        }
        (keypoints, descriptors)
    }

    #[test]
    fn binary_roundtrip_is_bitwise() {
        let (keypoints, descriptors) = sample_data(5);
        let mut buf = Vec::new();
        write_binary(&mut buf, &keypoints, &descriptors, 640, 480).unwrap();
        assert_eq!(buf.len(), 32 + 5 * 532);

        let (kps, desc, (w, h)) = read_binary(buf.as_slice()).unwrap();
        assert_eq!((w, h), (640, 480));
        assert_eq!(desc, descriptors);
        for (a, b) in kps.iter().zip(&keypoints) {
            assert_eq!(a.x.to_bits(), b.x.to_bits());
            assert_eq!(a.y.to_bits(), b.y.to_bits());
            assert_eq!(a.sigma.to_bits(), b.sigma.to_bits());
            assert_eq!(a.orientation.to_bits(), b.orientation.to_bits());
            assert_eq!(a.octave, b.octave);
            assert_eq!(a.scale, b.scale);
        }
    }

    #[test]
    fn binary_rejects_garbage() {
        let err = read_binary(&b"not a wsft file at all..........."[..]);
        assert!(err.is_err());
    }

    #[test]
    fn text_roundtrip_within_quantization_error() {
        let (keypoints, descriptors) = sample_data(3);
        let mut buf = Vec::new();
        write_text(&mut buf, &keypoints, &descriptors).unwrap();

        let (kps, desc) = read_text(buf.as_slice()).unwrap();
        assert_eq!(kps.len(), 3);
        for (loaded, original) in desc.rows().into_iter().zip(descriptors.rows()) {
            // The 512-save / 128-load mismatch cancels in the
            // re-normalization; what's left is quantization noise.
            for (l, o) in loaded.iter().zip(original.iter()) {
                assert!(
                    (l - o).abs() <= 1.5 / 512.0,
                    "component drifted: {l} vs {o}"
                );
            }
        }
    }

    #[test]
    fn text_header_is_count_and_dim() {
        let (keypoints, descriptors) = sample_data(2);
        let mut buf = Vec::new();
        write_text(&mut buf, &keypoints, &descriptors).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("2 128\n"));
    }
}
