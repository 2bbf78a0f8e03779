use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of digits in the signaling PIN.
pub const PIN_LENGTH: usize = 4;

/// The JSON messages exchanged over the WebSocket while setting a session up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Host → client: the session descriptor. `certificate` is the base64
    /// encoding of the DER certificate the QUIC endpoint presents.
    Offer { certificate: String },
    /// Host → client: one address the QUIC endpoint may be reachable at.
    Candidate { address: SocketAddr },
    /// Client → host: the candidate that produced the connection.
    Answer { address: SocketAddr },
}

/// Generates a random numeric PIN for gating the signaling server.
pub fn generate_pin() -> String {
    let mut rng = rand::thread_rng();
    (0..PIN_LENGTH).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_through_json() {
        let messages = [
            SignalMessage::Offer {
                certificate: "c29tZSBjZXJ0".to_string(),
            },
            SignalMessage::Candidate {
                address: "192.168.1.10:5000".parse().unwrap(),
            },
            SignalMessage::Answer {
                address: "127.0.0.1:5000".parse().unwrap(),
            },
        ];

        for msg in messages {
            let text = serde_json::to_string(&msg).expect("encode");
            let parsed: SignalMessage = serde_json::from_str(&text).expect("decode");
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn message_type_is_tagged() {
        let text = serde_json::to_string(&SignalMessage::Offer {
            certificate: String::new(),
        })
        .expect("encode");
        assert!(text.contains("\"type\":\"offer\""));
    }

    #[test]
    fn pin_is_numeric_and_fixed_length() {
        for _ in 0..100 {
            let pin = generate_pin();
            assert_eq!(pin.len(), PIN_LENGTH);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
