//! CBOR codec for RRC envelopes.
//!
//! Decoding enforces [`MAX_ENVELOPE_BYTES`](crate::MAX_ENVELOPE_BYTES) before
//! any parsing is attempted; encoding has no soft limit of its own — an
//! oversize result is caught later by the Client's MTU pre-check.

use ciborium::value::Value;

use crate::envelope::Envelope;
use crate::{ProtocolError, Result, MAX_ENVELOPE_BYTES};

/// Serialize an envelope to CBOR bytes.
pub fn encode(env: &Envelope) -> Result<Vec<u8>> {
    let value = env.to_value();
    let mut buf = Vec::new();
    ciborium::into_writer(&value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize and validate an envelope from CBOR bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::TooLarge`] if `data` exceeds
/// [`MAX_ENVELOPE_BYTES`]. Returns [`ProtocolError::Decode`] if `data` is not
/// valid CBOR. Returns [`ProtocolError::Malformed`], [`ProtocolError::BadVersion`],
/// or [`ProtocolError::BadField`] if the decoded value does not satisfy the
/// envelope schema.
pub fn decode(data: &[u8]) -> Result<Envelope> {
    if data.len() > MAX_ENVELOPE_BYTES {
        return Err(ProtocolError::TooLarge(data.len()));
    }
    let value: Value = ciborium::from_reader(data).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Envelope::from_value(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{make_envelope, MessageType};

    #[test]
    fn oversize_input_is_rejected_before_parsing() {
        let data = vec![0u8; MAX_ENVELOPE_BYTES + 1];
        let err = decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge(_)));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let env = make_envelope(MessageType::Ping, vec![1; 16], None, None, None, None, None);
        let bytes = encode(&env).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded, env);
    }
}
