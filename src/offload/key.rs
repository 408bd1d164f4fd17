use base64ct::{Base64, Encoding};
use secrecy::{ExposeSecret, SecretSlice};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key protocol name is empty")]
    EmptyProtocol,
    #[error("key protocol {0} carries no key data")]
    MissingData(String),
    #[error("key data is not valid base64")]
    Base64,
    #[error("key data is empty")]
    EmptyKey,
}

/// Pre-shared session key handed over with a request.
///
/// The key bytes are zeroized when the value is dropped. Ownership moves
/// through exactly one completion path, so the key is released exactly once.
pub struct KeyMaterial {
    protocol: String,
    key: SecretSlice<u8>,
}

impl KeyMaterial {
    #[must_use]
    pub fn new(protocol: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            protocol: protocol.into(),
            key: SecretSlice::from(key),
        }
    }

    /// Materialize a key from the request's `KeyInfoProtocol`/`KeyInfoData`.
    /// # Errors
    /// Returns an error if the protocol is empty or the data is missing or not base64.
    pub fn from_record(protocol: &str, data: Option<&str>) -> Result<Self, KeyError> {
        let protocol = protocol.trim();
        if protocol.is_empty() {
            return Err(KeyError::EmptyProtocol);
        }
        let data = data.ok_or_else(|| KeyError::MissingData(protocol.to_string()))?;
        let key = Base64::decode_vec(data.trim()).map_err(|_| KeyError::Base64)?;
        if key.is_empty() {
            return Err(KeyError::EmptyKey);
        }
        Ok(Self::new(protocol, key))
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.key.expose_secret()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("protocol", &self.protocol)
            .field("key", &"***")
            .finish()
    }
}
