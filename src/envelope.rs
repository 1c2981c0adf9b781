//! The self-describing ciphertext container that travels through the relay.
//!
//! On the wire an envelope is a JSON object tagged by `type`; every binary field is
//! standard base64 text so the whole envelope can ride inside a text message.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};
use crate::{NONCE_SIZE, SALT_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EncryptionEnvelope {
    /// Payload small enough to go straight under RSA-OAEP.
    #[serde(rename_all = "camelCase")]
    Rsa {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
        salt: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
        passphrase_iv: Option<Vec<u8>>,
    },
    /// Payload under a one-time AES-256-GCM key, which is itself under RSA-OAEP.
    #[serde(rename_all = "camelCase")]
    Hybrid {
        #[serde(with = "base64_bytes")]
        encrypted_data: Vec<u8>,
        #[serde(with = "base64_bytes")]
        encrypted_key: Vec<u8>,
        #[serde(with = "base64_bytes")]
        iv: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
        salt: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
        passphrase_iv: Option<Vec<u8>>,
    },
}

/// Salt and nonce of the optional passphrase-derived inner layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassphraseLayer {
    pub salt: [u8; SALT_SIZE],
    pub iv: [u8; NONCE_SIZE],
}

impl EncryptionEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            EncryptionEnvelope::Rsa { .. } => "rsa",
            EncryptionEnvelope::Hybrid { .. } => "hybrid",
        }
    }

    /// The passphrase layer parameters, if the sender applied one.
    ///
    /// A half-present or wrongly sized layer is reported as the generic decryption
    /// failure, same as any other corruption.
    pub fn passphrase_layer(&self) -> Result<Option<PassphraseLayer>> {
        let (salt, iv) = match self {
            EncryptionEnvelope::Rsa { salt, passphrase_iv, .. } => (salt, passphrase_iv),
            EncryptionEnvelope::Hybrid { salt, passphrase_iv, .. } => (salt, passphrase_iv),
        };

        match (salt, iv) {
            (None, None) => Ok(None),
            (Some(salt), Some(iv)) => {
                let salt: [u8; SALT_SIZE] =
                    salt.as_slice().try_into().map_err(|_| TransferError::Decryption)?;
                let iv: [u8; NONCE_SIZE] =
                    iv.as_slice().try_into().map_err(|_| TransferError::Decryption)?;
                Ok(Some(PassphraseLayer { salt, iv }))
            }
            _ => Err(TransferError::Decryption),
        }
    }

    pub fn has_passphrase_layer(&self) -> bool {
        matches!(
            self,
            EncryptionEnvelope::Rsa { salt: Some(_), .. }
                | EncryptionEnvelope::Hybrid { salt: Some(_), .. }
        )
    }

    /// Serialized text form carried in the `encryptedData` message field.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
