//! Shared protocol constants for the vfsio socket protocol and control socket

// Control socket frame header constants
pub const MAGIC: &[u8; 4] = b"VFSD";
pub const VERSION: u16 = 1;

// Maximum control frame payload size (64KB) - control frames only ever carry a path or an error
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Size of an outbound request record: command | seq_nr | arg1 | arg2, big-endian u32 each
pub const REQUEST_SIZE: usize = 16;

/// Size of an inbound reply header: type | seq_nr | arg1 | arg2, big-endian u32 each
pub const REPLY_SIZE: usize = 16;

// Limit for sanity and to keep the byte count inside a 32-bit argument word
pub const MAX_READ_SIZE: usize = 4 * 1024 * 1024;

// Error trailers larger than this cannot be a domain plus a message; treat as corrupt framing
pub const MAX_ERROR_SIZE: usize = 64 * 1024;

// Request command codes (numeric values are part of the wire format)
pub mod request {
    pub const READ: u32 = 0;
    pub const CLOSE: u32 = 1;
    pub const CANCEL: u32 = 2;
    pub const SEEK_CUR: u32 = 3;
    pub const SEEK_SET: u32 = 4;
    pub const SEEK_END: u32 = 5;
}

// Reply type codes
//
// DATA:     arg1 = block length, arg2 = seek generation, block bytes follow
// ERROR:    arg1 = domain error code, arg2 = trailer length, trailer = domain\0message\0
// SEEK_POS: arg1 = low 32 bits of offset, arg2 = high 32 bits
// CLOSED:   no arguments
pub mod reply {
    pub const DATA: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const SEEK_POS: u32 = 2;
    pub const CLOSED: u32 = 3;
}

// Control socket frame type IDs
//
// Client sends: OPEN_FOR_READ (path bytes)
// Server responds: OPENED (can_seek u8, transport fd in SCM_RIGHTS) or ERROR (code u32 | domain\0 | message\0)
pub mod frame {
    pub const OPEN_FOR_READ: u8 = 1;
    pub const OPENED: u8 = 2;
    pub const ERROR: u8 = 3;
}

/// Error domains understood on both ends of the wire
pub mod domain {
    /// Generic I/O failures (codes in [`super::code`])
    pub const IO: &str = "vfs-io-error";
}

/// Codes in the [`domain::IO`] domain
pub mod code {
    pub const FAILED: u32 = 0;
    pub const NOT_FOUND: u32 = 1;
    pub const PERMISSION_DENIED: u32 = 2;
    pub const IS_DIRECTORY: u32 = 3;
    pub const INVALID_ARGUMENT: u32 = 4;
    pub const NOT_SUPPORTED: u32 = 5;
    pub const CANCELLED: u32 = 6;
    pub const CLOSED: u32 = 7;
}

// Centralized timeout constants for the control socket handshake
pub mod timeouts {
    // Time allowed for a client to send its OPEN_FOR_READ frame (ms)
    pub const CONTROL_REQUEST_MS: u64 = 2000;
}
