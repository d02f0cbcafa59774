//! Binary layout of reference engine blobs.
//!
//! ```text
//! magic "EPRF" | version u16 | precision u8 | batch u32
//! input rank u8 | input dims u32..  | output rank u8 | output dims u32..
//! weights f32 x (classes * channels) | bias f32 x classes
//! sha256 of everything above (32 bytes)
//! ```
//! All integers and floats are little-endian. Dims exclude the batch dimension.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use engineport_core::{Precision, SessionError, SessionResult, Shape};
use sha2::{Digest, Sha256};

pub const MAGIC: [u8; 4] = *b"EPRF";
pub const VERSION: u16 = 1;
const DIGEST_LEN: usize = 32;
pub const MAX_RANK: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct ReferencePlan {
    pub precision: Precision,
    pub batch_size: usize,
    pub input_shape: Shape,
    pub output_shape: Shape,
    /// Row-major `classes x channels`.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl ReferencePlan {
    /// Leading input dimension; the remaining dims are pooled.
    pub fn channels(&self) -> usize {
        self.input_shape.dims()[0]
    }

    pub fn classes(&self) -> usize {
        self.output_shape.dims()[0]
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            64 + (self.weights.len() + self.bias.len()) * 4 + DIGEST_LEN,
        );
        buf.put_slice(&MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u8(precision_tag(self.precision));
        buf.put_u32_le(self.batch_size as u32);
        for shape in [&self.input_shape, &self.output_shape] {
            buf.put_u8(shape.rank() as u8);
            for d in shape.dims() {
                buf.put_u32_le(*d as u32);
            }
        }
        for w in self.weights.iter().chain(self.bias.iter()) {
            buf.put_f32_le(*w);
        }
        let digest = Sha256::digest(&buf);
        buf.put_slice(&digest);
        buf.freeze()
    }

    pub fn decode(blob: &[u8]) -> SessionResult<Self> {
        if blob.len() < MAGIC.len() + DIGEST_LEN {
            return Err(corrupt(format!("blob is only {} bytes", blob.len())));
        }
        if blob[..MAGIC.len()] != MAGIC {
            return Err(corrupt("missing EPRF magic".to_string()));
        }

        let (body, digest) = blob.split_at(blob.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(corrupt(
                "checksum mismatch (truncated or corrupted blob)".to_string(),
            ));
        }

        let mut buf = &body[MAGIC.len()..];
        let version = need(&mut buf, 2)?.get_u16_le();
        if version != VERSION {
            return Err(corrupt(format!(
                "unsupported blob version {version} (expected {VERSION})"
            )));
        }
        let precision = match need(&mut buf, 1)?.get_u8() {
            0 => Precision::Full,
            1 => Precision::Reduced,
            tag => return Err(corrupt(format!("unknown precision tag {tag}"))),
        };
        let batch_size = need(&mut buf, 4)?.get_u32_le() as usize;
        if batch_size == 0 {
            return Err(corrupt("batch size is zero".to_string()));
        }
        let input_shape = read_shape(&mut buf, "input")?;
        let output_shape = read_shape(&mut buf, "output")?;
        if output_shape.rank() != 1 {
            return Err(corrupt(format!(
                "output shape {output_shape} must be rank 1"
            )));
        }

        let classes = output_shape.dims()[0];
        let channels = input_shape.dims()[0];
        let weight_count = classes
            .checked_mul(channels)
            .ok_or_else(|| corrupt("weight count overflows".to_string()))?;
        let expected = weight_count
            .checked_add(classes)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| corrupt("parameter size overflows".to_string()))?;
        if buf.remaining() != expected {
            return Err(corrupt(format!(
                "expected {expected} bytes of parameters, found {}",
                buf.remaining()
            )));
        }
        let weights = (0..weight_count).map(|_| buf.get_f32_le()).collect();
        let bias = (0..classes).map(|_| buf.get_f32_le()).collect();

        Ok(Self {
            precision,
            batch_size,
            input_shape,
            output_shape,
            weights,
            bias,
        })
    }
}

/// True when `blob` starts with the reference magic.
pub fn is_reference_blob(blob: &[u8]) -> bool {
    blob.len() >= MAGIC.len() && blob[..MAGIC.len()] == MAGIC
}

fn precision_tag(precision: Precision) -> u8 {
    match precision {
        Precision::Full => 0,
        Precision::Reduced => 1,
    }
}

fn read_shape(buf: &mut &[u8], what: &str) -> SessionResult<Shape> {
    let rank = need(buf, 1)?.get_u8() as usize;
    if rank == 0 || rank > MAX_RANK {
        return Err(corrupt(format!("{what} rank {rank} out of range")));
    }
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        let d = need(buf, 4)?.get_u32_le() as usize;
        if d == 0 {
            return Err(corrupt(format!("{what} has a zero dimension")));
        }
        dims.push(d);
    }
    let shape = Shape::from_slice(&dims);
    dims.iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| corrupt(format!("{what} shape {shape} overflows")))?;
    Ok(shape)
}

fn need<'a, 'b>(buf: &'a mut &'b [u8], n: usize) -> SessionResult<&'a mut &'b [u8]> {
    if buf.remaining() < n {
        return Err(corrupt("unexpected end of header".to_string()));
    }
    Ok(buf)
}

fn corrupt(message: String) -> SessionError {
    SessionError::Deserialize(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ReferencePlan {
        ReferencePlan {
            precision: Precision::Reduced,
            batch_size: 2,
            input_shape: Shape::from_slice(&[2, 3, 3]),
            output_shape: Shape::from_slice(&[3]),
            weights: vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            bias: vec![-1.0, 0.0, 1.0],
        }
    }

    #[test]
    fn decodes_what_it_encodes() {
        let plan = plan();
        assert_eq!(ReferencePlan::decode(&plan.encode()).unwrap(), plan);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = plan().encode();
        for cut in [1, 10, blob.len() / 2, blob.len() - 1] {
            let err = ReferencePlan::decode(&blob[..cut]).unwrap_err();
            assert!(matches!(err, SessionError::Deserialize(_)), "cut at {cut}");
        }
    }

    #[test]
    fn flipped_byte_is_rejected() {
        let mut blob = plan().encode().to_vec();
        blob[20] ^= 0xff;
        let err = ReferencePlan::decode(&blob).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn other_version_is_rejected_even_with_valid_digest() {
        let blob = plan().encode();
        let mut body = blob[..blob.len() - DIGEST_LEN].to_vec();
        body[4] = 9;
        let digest = Sha256::digest(&body);
        body.extend_from_slice(&digest);
        let err = ReferencePlan::decode(&body).unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    fn with_digest(mut body: Vec<u8>) -> Vec<u8> {
        let digest = Sha256::digest(&body);
        body.extend_from_slice(&digest);
        body
    }

    #[test]
    fn oversized_parameter_block_is_rejected() {
        let mut body = MAGIC.to_vec();
        body.extend_from_slice(&VERSION.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(1);
        body.extend_from_slice(&0x8000_0000u32.to_le_bytes());
        body.push(1);
        body.extend_from_slice(&u32::MAX.to_le_bytes());

        let err = ReferencePlan::decode(&with_digest(body)).unwrap_err();
        assert!(matches!(err, SessionError::Deserialize(_)));
    }

    #[test]
    fn foreign_bytes_are_not_reference_blobs() {
        assert!(!is_reference_blob(b"\x00\x01onnx"));
        assert!(is_reference_blob(&plan().encode()));
    }
}
