use crate::protocol::constants::{HEADER_LEN, MAX_FILE_SIZE, MAX_JSON_LEN, MAX_MEDIA_TYPE_LEN};
use crate::protocol::error::ProtocolError;

/// Fixed 8-byte application header shared by requests and responses:
/// `json_length:u16 ‖ media_type_length:u8 ‖ file_size:u40`, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub json_length: u16,
    pub media_type_length: u8,
    pub file_size: u64,
}

impl PacketHeader {
    pub const SIZE: usize = HEADER_LEN;

    /// Build a header from raw lengths, checking each fits its field.
    pub fn new(
        json_length: usize,
        media_type_length: usize,
        file_size: u64,
    ) -> Result<Self, ProtocolError> {
        if json_length > MAX_JSON_LEN {
            return Err(ProtocolError::InvalidHeader(format!(
                "metadata JSON is {} bytes, limit {}",
                json_length, MAX_JSON_LEN
            )));
        }
        if media_type_length > MAX_MEDIA_TYPE_LEN {
            return Err(ProtocolError::InvalidHeader(format!(
                "media type is {} bytes, limit {}",
                media_type_length, MAX_MEDIA_TYPE_LEN
            )));
        }
        if file_size > MAX_FILE_SIZE {
            return Err(ProtocolError::InvalidHeader(format!(
                "file size {} does not fit 40 bits",
                file_size
            )));
        }
        Ok(Self {
            json_length: json_length as u16,
            media_type_length: media_type_length as u8,
            file_size,
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.json_length.to_be_bytes());
        buf[2] = self.media_type_length;
        // Low five bytes of the big-endian u64
        buf[3..8].copy_from_slice(&self.file_size.to_be_bytes()[3..8]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != Self::SIZE {
            return Err(ProtocolError::InvalidHeader(format!(
                "header must be {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }
        let mut size = [0u8; 8];
        size[3..8].copy_from_slice(&buf[3..8]);
        Ok(Self {
            json_length: u16::from_be_bytes([buf[0], buf[1]]),
            media_type_length: buf[2],
            file_size: u64::from_be_bytes(size),
        })
    }

    /// Length of the second message: `json ‖ media_type`
    pub fn body_len(&self) -> usize {
        self.json_length as usize + self.media_type_length as usize
    }

    /// Split the second message into its JSON and media type parts.
    pub fn split_body<'a>(&self, body: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), ProtocolError> {
        if body.len() != self.body_len() {
            return Err(ProtocolError::InvalidHeader(format!(
                "body is {} bytes, header declares {}",
                body.len(),
                self.body_len()
            )));
        }
        Ok(body.split_at(self.json_length as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            json_length in 0usize..=65535,
            media_type_length in 0usize..=255,
            file_size in 0u64..=MAX_FILE_SIZE,
        ) {
            let header = PacketHeader::new(json_length, media_type_length, file_size).unwrap();
            prop_assert_eq!(PacketHeader::decode(&header.encode()).unwrap(), header);
        }
    }

    #[test]
    fn test_wire_layout() {
        let header = PacketHeader::new(0x0102, 4, 0x03_0405_0607).unwrap();
        assert_eq!(header.encode(), [0x01, 0x02, 0x04, 0x03, 0x04, 0x05, 0x06, 0x07]);
    }

    #[test]
    fn test_limits_enforced() {
        assert!(PacketHeader::new(65536, 0, 0).is_err());
        assert!(PacketHeader::new(0, 256, 0).is_err());
        assert!(PacketHeader::new(0, 0, MAX_FILE_SIZE + 1).is_err());
        assert_eq!(PacketHeader::new(65535, 255, MAX_FILE_SIZE).unwrap().encode(), [0xFF; 8]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(PacketHeader::decode(&[0u8; 7]), Err(ProtocolError::InvalidHeader(_))));
        assert!(matches!(PacketHeader::decode(&[0u8; 9]), Err(ProtocolError::InvalidHeader(_))));
    }

    #[test]
    fn test_split_body() {
        let header = PacketHeader::new(4, 4, 10).unwrap();
        let (json, media) = header.split_body(b"{}  .mp4").unwrap();
        assert_eq!(json, b"{}  ");
        assert_eq!(media, b".mp4");
        assert!(header.split_body(b"{}.mp4").is_err());
    }
}
