//! NPY file I/O for exported features
//!
//! Writes version 1.0 little-endian float32 arrays and reads them back.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Write a float32 array with the given shape
pub fn write_npy_f32<P: AsRef<Path>>(path: P, data: &[f32], shape: &[usize]) -> Result<()> {
    let path = path.as_ref();
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        anyhow::bail!("Shape {:?} does not match {} values", shape, data.len());
    }

    let shape_str = match shape {
        [single] => format!("({},)", single),
        _ => format!(
            "({})",
            shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}",
        shape_str
    );
    // magic (6) + version (2) + header len (2) + header + '\n' is a multiple of 64
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let file = File::create(path).with_context(|| format!("Failed to create NPY file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(b"\x93NUMPY")?;
    writer.write_all(&[1u8, 0u8])?;
    writer.write_all(&(header.len() as u16).to_le_bytes())?;
    writer.write_all(header.as_bytes())?;
    for v in data {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a float32 array written by `write_npy_f32`, with its shape
pub fn load_npy_f32<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, Vec<usize>)> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open NPY file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let mut preamble = [0u8; 8];
    reader.read_exact(&mut preamble)?;
    if &preamble[..6] != b"\x93NUMPY" {
        anyhow::bail!("{:?} is not an NPY file", path);
    }
    let header_len = if preamble[6] == 1 {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        u16::from_le_bytes(len) as usize
    } else {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        u32::from_le_bytes(len) as usize
    };
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    let dtype = parse_dtype(&header)?;
    if dtype != "<f4" {
        anyhow::bail!("Expected little-endian float32 features, got {}", dtype);
    }
    let shape = parse_shape(&header)?;
    let mut bytes = vec![0u8; shape.iter().product::<usize>() * 4];
    reader.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((data, shape))
}

fn parse_dtype(header: &str) -> Result<String> {
    let start = header
        .find("'descr'")
        .or_else(|| header.find("\"descr\""))
        .ok_or_else(|| anyhow::anyhow!("No descr in header"))?;

    let rest = &header[start + 7..];
    let colon = rest.find(':').ok_or_else(|| anyhow::anyhow!("No colon after descr"))?;
    let after_colon = &rest[colon + 1..];

    let quote_start = after_colon
        .find(['\'', '"'])
        .ok_or_else(|| anyhow::anyhow!("No dtype string"))?;
    let quote_char = &after_colon[quote_start..quote_start + 1];
    let dtype_start = quote_start + 1;
    let dtype_end = after_colon[dtype_start..]
        .find(quote_char)
        .ok_or_else(|| anyhow::anyhow!("Unclosed dtype string"))?;

    Ok(after_colon[dtype_start..dtype_start + dtype_end].to_string())
}

fn parse_shape(header: &str) -> Result<Vec<usize>> {
    let start = header
        .find("'shape'")
        .or_else(|| header.find("\"shape\""))
        .ok_or_else(|| anyhow::anyhow!("No shape in header"))?;

    let rest = &header[start..];
    let paren_start = rest.find('(').ok_or_else(|| anyhow::anyhow!("No shape tuple"))?;
    let paren_end = rest.find(')').ok_or_else(|| anyhow::anyhow!("Unclosed shape tuple"))?;

    rest[paren_start + 1..paren_end]
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Invalid shape element: {}", e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shape_1d() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (100,)}";
        assert_eq!(parse_shape(header).unwrap(), vec![100]);
        assert_eq!(parse_dtype(header).unwrap(), "<f4");
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.npy");
        let values: Vec<f32> = (0..6).map(|v| v as f32 * 0.5).collect();
        write_npy_f32(&path, &values, &[2, 3]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!((bytes.len() - 6 * 4) % 64, 0);

        let (data, shape) = load_npy_f32(&path).unwrap();
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(data, values);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_npy_f32(dir.path().join("x.npy"), &[1.0, 2.0], &[3]).is_err());
    }
}
