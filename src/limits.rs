/// Largest key accepted by the client and the store adapter.
pub const MAX_KEY_SIZE: usize = 4 * 1024 * 1024;

/// Largest value accepted by the client and the store adapter.
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound for both the warmup request padding and the payload size a
/// warmup call may ask the server to send back.
pub const MAX_WARMUP_SIZE: usize = 4 * 1024 * 1024;

/// Largest single frame a reader will allocate for. A put carrying a key and a
/// value at their limits still fits with room for the envelope.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
