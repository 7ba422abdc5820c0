//! NEF container encoding.
//!
//! Layout: magic (4) | compiler name (64, null-padded) | source hash
//! (32, SHA-256 of the source text) | reserved (2) | method-token count
//! (varint, always 0 here) | script length (varint) | script bytes |
//! checksum (4, first bytes of double SHA-256 over everything before
//! the checksum).

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"NEF3";
const COMPILER_FIELD_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum NefError {
    #[error("compiler name longer than {COMPILER_FIELD_LEN} bytes")]
    CompilerNameTooLong,

    #[error("container too short or malformed")]
    Truncated,

    #[error("bad magic")]
    BadMagic,

    #[error("checksum mismatch")]
    BadChecksum,
}

/// Encodes a script into a NEF container.
pub fn encode(script: &[u8], compiler: &str, source: &str) -> Result<Vec<u8>, NefError> {
    if compiler.len() > COMPILER_FIELD_LEN {
        return Err(NefError::CompilerNameTooLong);
    }

    let mut out = Vec::with_capacity(COMPILER_FIELD_LEN + script.len() + 64);
    out.extend_from_slice(&MAGIC);

    let mut name = [0u8; COMPILER_FIELD_LEN];
    name[..compiler.len()].copy_from_slice(compiler.as_bytes());
    out.extend_from_slice(&name);

    out.extend_from_slice(&Sha256::digest(source.as_bytes()));
    out.extend_from_slice(&[0u8, 0u8]);

    write_varint(&mut out, 0); // method tokens
    write_varint(&mut out, script.len() as u64);
    out.extend_from_slice(script);

    let checksum = checksum(&out);
    out.extend_from_slice(&checksum);
    Ok(out)
}

/// Extracts the script from a container, verifying magic and checksum.
pub fn decode_script(container: &[u8]) -> Result<Vec<u8>, NefError> {
    if container.len() < 4 + COMPILER_FIELD_LEN + 32 + 2 + 2 + 4 {
        return Err(NefError::Truncated);
    }
    if container[..4] != MAGIC {
        return Err(NefError::BadMagic);
    }
    let body = &container[..container.len() - 4];
    let stored = &container[container.len() - 4..];
    if checksum(body)[..] != *stored {
        return Err(NefError::BadChecksum);
    }

    let mut cursor = 4 + COMPILER_FIELD_LEN + 32 + 2;
    let (_tokens, read) = read_varint(&container[cursor..]).ok_or(NefError::Truncated)?;
    cursor += read;
    let (script_len, read) = read_varint(&container[cursor..]).ok_or(NefError::Truncated)?;
    cursor += read;
    let end = cursor
        .checked_add(script_len as usize)
        .ok_or(NefError::Truncated)?;
    if end > body.len() {
        return Err(NefError::Truncated);
    }
    Ok(container[cursor..end].to_vec())
}

/// First four bytes of SHA-256(SHA-256(data)).
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    [second[0], second[1], second[2], second[3]]
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        prefix @ 0..=0xFC => Some((prefix as u64, 1)),
        0xFD => Some((u16::from_le_bytes(data.get(1..3)?.try_into().ok()?) as u64, 3)),
        0xFE => Some((u32::from_le_bytes(data.get(1..5)?.try_into().ok()?) as u64, 5)),
        0xFF => Some((u64::from_le_bytes(data.get(1..9)?.try_into().ok()?), 9)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip() {
        let script = vec![0x10, 0x40];
        let container = encode(&script, "neo-yul-test", "object \"C\" {}").unwrap();
        assert_eq!(&container[..4], b"NEF3");
        assert_eq!(decode_script(&container).unwrap(), script);
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut container = encode(&[0x40], "neo-yul-test", "src").unwrap();
        let at = container.len() / 2;
        container[at] ^= 0xFF;
        assert!(matches!(
            decode_script(&container),
            Err(NefError::BadChecksum)
        ));
    }

    #[test]
    fn compiler_field_is_fixed_width() {
        let a = encode(&[0x40], "a", "src").unwrap();
        let b = encode(&[0x40], "a-much-longer-compiler-name", "src").unwrap();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn source_hash_is_embedded() {
        let container = encode(&[0x40], "c", "some source").unwrap();
        let expected = Sha256::digest("some source".as_bytes());
        assert_eq!(&container[68..100], expected.as_slice());
    }

    #[test]
    fn oversized_compiler_name_rejected() {
        let long = "x".repeat(65);
        assert!(matches!(
            encode(&[0x40], &long, "src"),
            Err(NefError::CompilerNameTooLong)
        ));
    }

    #[test]
    fn varint_boundaries() {
        let mut buffer = Vec::new();
        for value in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, u32::MAX as u64 + 1] {
            buffer.clear();
            write_varint(&mut buffer, value);
            let (decoded, read) = read_varint(&buffer).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(read, buffer.len());
        }
    }
}
