pub mod bytes;
pub mod commands;
pub mod cryptography;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod networking;
pub mod protocol;
pub mod relay_utils;
pub mod session;
pub mod transfer;
pub mod utils;

pub use error::{Result, TransferError};

pub const RSA_KEY_BITS: usize = 2048;
/// Largest (possibly passphrase-wrapped) payload sealed directly under RSA-OAEP,
/// whatever the recipient's modulus size.
pub const RSA_DIRECT_LIMIT: usize = 190;
pub const AES_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const SALT_SIZE: usize = 16;
pub const PBKDF2_ROUNDS: u32 = 100_000;
pub const ENCRYPTION_OVERHEAD: usize = 16;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
/// Largest file that still fits in one frame once sealed: base64 grows it by a
/// third, and the rest covers the envelope fields and file metadata.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE / 4 * 3 - 64 * 1024;
pub const MAX_PASSPHRASE_ATTEMPTS: u32 = 3;

pub const DEFAULT_RELAY_PORT: u16 = 8080;
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8080";
