//! Wire protocol constants
//!
//! Header layout (all integers big-endian):
//!
//! ```text
//! offset  size  field
//!      0     4  magic
//!      4     4  type id
//!      8     8  recipient id
//!     16     8  sender id
//!     24     4  payload length
//!     28     n  payload
//! ```

/// Default magic tag at the start of every frame
pub const DEFAULT_MAGIC: [u8; 4] = *b"EMSG";

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 28;

pub const MAGIC_OFFSET: usize = 0;
pub const TYPE_OFFSET: usize = 4;
pub const RECIPIENT_OFFSET: usize = 8;
pub const SENDER_OFFSET: usize = 16;
pub const PAYLOAD_LEN_OFFSET: usize = 24;

/// Largest payload a reader will accept (16MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Recipient id of the master peer
pub const RECIPIENT_MASTER: u64 = 0;

/// Recipient id addressing every data connection
pub const RECIPIENT_ALL: u64 = u64::MAX;

/// Internal message types have the top bit set
pub const INTERNAL_TYPE_FLAG: u32 = 0x8000_0000;

/// Locally generated status events have bit 30 set
pub const STATUS_TYPE_FLAG: u32 = 0x4000_0000;

/// True if the type id is reserved for the peer/reactor layer
#[inline]
pub const fn is_internal(type_id: u32) -> bool {
    type_id & INTERNAL_TYPE_FLAG != 0
}

/// True if the type id is a local status event
#[inline]
pub const fn is_status(type_id: u32) -> bool {
    !is_internal(type_id) && type_id & STATUS_TYPE_FLAG != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_contiguous() {
        assert_eq!(TYPE_OFFSET, MAGIC_OFFSET + 4);
        assert_eq!(RECIPIENT_OFFSET, TYPE_OFFSET + 4);
        assert_eq!(SENDER_OFFSET, RECIPIENT_OFFSET + 8);
        assert_eq!(PAYLOAD_LEN_OFFSET, SENDER_OFFSET + 8);
        assert_eq!(HEADER_SIZE, PAYLOAD_LEN_OFFSET + 4);
    }

    #[test]
    fn test_type_ranges() {
        assert!(is_internal(0x8000_0001));
        assert!(!is_internal(0x0000_0001));
        assert!(is_status(0x4000_0001));
        assert!(!is_status(0xC000_0001));
        assert!(!is_status(0x0000_0002));
    }
}
