//! Little-endian helpers shared by the packet builders and parsers

use crate::error::ProtocolError;

pub(crate) fn ensure_len(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_u16(data: &[u8], at: usize) -> Result<u16, ProtocolError> {
    ensure_len(data, at + 2)?;
    Ok(u16::from_le_bytes([data[at], data[at + 1]]))
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> Result<u32, ProtocolError> {
    ensure_len(data, at + 4)?;
    Ok(u32::from_le_bytes([
        data[at],
        data[at + 1],
        data[at + 2],
        data[at + 3],
    ]))
}

/// Returns the bytes from `at` up to (not including) the next NUL, or to the end
pub(crate) fn extract_cstring(data: &[u8], at: usize) -> &[u8] {
    if at >= data.len() {
        return &[];
    }
    let tail = &data[at..];
    match tail.iter().position(|&b| b == 0) {
        Some(end) => &tail[..end],
        None => tail,
    }
}

pub(crate) fn push_cstring(packet: &mut Vec<u8>, text: &[u8]) {
    packet.extend_from_slice(text);
    packet.push(0);
}

/// Writes the final packet size into bytes 2..4
pub(crate) fn assign_length(packet: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let size = packet.len();
    if size > u16::MAX as usize {
        return Err(ProtocolError::Oversized(size));
    }
    let [lo, hi] = (size as u16).to_le_bytes();
    packet[2] = lo;
    packet[3] = hi;
    Ok(())
}

/// Checks the 4-byte header of an inbound packet against its buffer
pub(crate) fn validate_length(data: &[u8], header: u8) -> Result<(), ProtocolError> {
    ensure_len(data, 4)?;
    if data[0] != header {
        return Err(ProtocolError::BadHeader(data[0]));
    }
    let declared = u16::from_le_bytes([data[2], data[3]]) as usize;
    if declared != data.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_integers() {
        let data = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        assert_eq!(read_u16(&data, 0).unwrap(), 0x1234);
        assert_eq!(read_u32(&data, 2).unwrap(), 0x12345678);
        assert!(read_u32(&data, 4).is_err());
    }

    #[test]
    fn test_extract_cstring_stops_at_nul() {
        let data = b"xxname\0rest";
        assert_eq!(extract_cstring(data, 2), b"name");
        assert_eq!(extract_cstring(data, 7), b"rest");
        assert!(extract_cstring(data, 20).is_empty());
    }

    #[test]
    fn test_validate_length() {
        let ok = [0xF7, 0x01, 0x05, 0x00, 0xAA];
        assert!(validate_length(&ok, 0xF7).is_ok());

        let wrong_header = [0xF8, 0x01, 0x04, 0x00];
        assert_eq!(
            validate_length(&wrong_header, 0xF7),
            Err(ProtocolError::BadHeader(0xF8))
        );

        let short = [0xF7, 0x01, 0x09, 0x00];
        assert!(matches!(
            validate_length(&short, 0xF7),
            Err(ProtocolError::LengthMismatch { declared: 9, .. })
        ));
    }
}
