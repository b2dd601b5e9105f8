use std::fmt;

/// Initial salt for QUIC v1 (RFC 9001 section 5.2)
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

/// QUIC versions recognized on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuicVersion {
    V1,
    V2,
    Draft27,
    Draft29,
}

impl QuicVersion {
    pub fn from_wire(version: u32) -> Option<Self> {
        match version {
            0x0000_0001 => Some(Self::V1),
            0x6b33_43cf => Some(Self::V2),
            0xff00_001b => Some(Self::Draft27),
            0xff00_001d => Some(Self::Draft29),
            _ => None,
        }
    }

    pub fn wire(self) -> u32 {
        match self {
            Self::V1 => 0x0000_0001,
            Self::V2 => 0x6b33_43cf,
            Self::Draft27 => 0xff00_001b,
            Self::Draft29 => 0xff00_001d,
        }
    }

    /// Long-header packet type that denotes an Initial packet
    pub fn initial_type(self) -> u8 {
        match self {
            Self::V2 => 0x01,
            _ => 0x00,
        }
    }

    /// Salt for the Initial key schedule; `None` for versions that are
    /// recognized but not decrypted.
    pub fn initial_salt(self) -> Option<&'static [u8]> {
        match self {
            Self::V1 => Some(&INITIAL_SALT_V1),
            _ => None,
        }
    }

    #[inline]
    pub fn is_decryptable(self) -> bool {
        self.initial_salt().is_some()
    }
}

impl fmt::Display for QuicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
            Self::Draft27 => write!(f, "draft-27"),
            Self::Draft29 => write!(f, "draft-29"),
        }
    }
}
