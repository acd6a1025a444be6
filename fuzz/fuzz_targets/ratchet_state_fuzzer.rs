//! Fuzz target for Double Ratchet state restore and decryption
//!
//! Persisted ratchet state is read back from storage the process does not
//! fully control, and message headers come straight off the network.
//!
//! # Strategy
//!
//! - Arbitrary state: random bytes into `DoubleRatchet::deserialize`
//! - Arbitrary messages: structured headers (huge message numbers, unknown
//!   DH keys, zero keys) and raw wire bytes against any state that loads
//!
//! # Invariants
//!
//! - Deserialization and decryption never panic
//! - A state that loads serializes again
//! - Forged messages never decrypt
//! - A failed decryption leaves the serialized state unchanged

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use palisade_crypto::{DoubleRatchet, MessageHeader, RatchetMessage};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

#[derive(Debug, Clone, Arbitrary)]
enum ForgedMessage {
    Structured {
        dh_public_key: [u8; 32],
        previous_chain_length: u32,
        message_number: u32,
        nonce: [u8; 24],
        ciphertext: Vec<u8>,
    },
    Wire {
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, Arbitrary)]
struct RatchetInput {
    state: Vec<u8>,
    messages: Vec<ForgedMessage>,
}

fuzz_target!(|input: RatchetInput| {
    let Ok(mut ratchet) = DoubleRatchet::deserialize(&input.state) else {
        return;
    };

    let Ok(snapshot) = ratchet.serialize() else {
        panic!("loaded state must serialize again");
    };

    let mut rng = ChaCha20Rng::seed_from_u64(0);
    for forged in input.messages.into_iter().take(16) {
        let message = match forged {
            ForgedMessage::Structured {
                dh_public_key,
                previous_chain_length,
                message_number,
                nonce,
                ciphertext,
            } => RatchetMessage {
                header: MessageHeader { dh_public_key, previous_chain_length, message_number },
                nonce,
                ciphertext,
            },
            ForgedMessage::Wire { bytes } => match RatchetMessage::from_bytes(&bytes) {
                Ok(message) => message,
                Err(_) => continue,
            },
        };

        assert!(ratchet.decrypt_message(&message, &mut rng).is_err());
        assert_eq!(ratchet.serialize().ok().as_deref(), Some(snapshot.as_slice()));
    }
});
