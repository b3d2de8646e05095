//! Buffer set for state machine operations.

/// Buffers shared between the framing layer and the state machines.
///
/// The framing layer fills `type_byte` and `read_buffer` with one backend
/// message; state machines append outgoing messages to `write_buffer`.
pub struct BufferSet {
    /// Payload of the last message read (without type byte and length)
    pub read_buffer: Vec<u8>,
    /// Outgoing messages waiting to be handed to the transport
    pub write_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            type_byte: 0,
        }
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
