use super::WalletError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

/// Encoded size of a token: value, interval, receipt, signature
pub const TOKEN_LEN: usize = 4 + 4 + 32 + 64;

/// A bank-signed bearer token, spendable during its interval and the next
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token {
    pub value: u32,
    pub interval: u32,

    /// Random serial chosen at issue time
    pub receipt: [u8; 32],

    pub signature: [u8; 64],
}

impl Token {
    /// Sign a fresh token. Used by the bank side and by tests.
    pub fn issue(key: &SigningKey, interval: u32, value: u32) -> Self {
        let mut receipt = [0u8; 32];
        OsRng.fill_bytes(&mut receipt);
        let signature = key.sign(&signing_digest(&receipt, interval));
        Self {
            value,
            interval,
            receipt,
            signature: signature.to_bytes(),
        }
    }

    pub fn verify(&self, key: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&signing_digest(&self.receipt, self.interval), &signature)
            .is_ok()
    }

    /// Whether the token may still be spent in `current` interval
    pub fn is_fresh(&self, current: u32) -> bool {
        self.interval == current || self.interval.checked_add(1) == Some(current)
    }

    pub fn to_bytes(&self) -> [u8; TOKEN_LEN] {
        let mut out = [0u8; TOKEN_LEN];
        out[0..4].copy_from_slice(&self.value.to_be_bytes());
        out[4..8].copy_from_slice(&self.interval.to_be_bytes());
        out[8..40].copy_from_slice(&self.receipt);
        out[40..].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        if bytes.len() != TOKEN_LEN {
            return Err(WalletError::Corrupt(format!(
                "token is {} bytes, expected {}",
                bytes.len(),
                TOKEN_LEN
            )));
        }
        let mut receipt = [0u8; 32];
        receipt.copy_from_slice(&bytes[8..40]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[40..]);
        Ok(Self {
            value: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            interval: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            receipt,
            signature,
        })
    }

    pub fn short_id(&self) -> String {
        hex::encode(&self.receipt[..6])
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &self.value)
            .field("interval", &self.interval)
            .field("receipt", &self.short_id())
            .finish()
    }
}

fn signing_digest(receipt: &[u8; 32], interval: u32) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(receipt);
    hasher.update(&interval.to_be_bytes());
    *hasher.finalize().as_bytes()
}

/// Generate a bank key. Test and tooling helper.
pub fn generate_bank_key() -> SigningKey {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    SigningKey::from_bytes(&secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let key = generate_bank_key();
        let token = Token::issue(&key, 7, 1);
        assert!(token.verify(&key.verifying_key()));

        let mut forged = token.clone();
        forged.interval = 8;
        assert!(!forged.verify(&key.verifying_key()));

        let other = generate_bank_key();
        assert!(!token.verify(&other.verifying_key()));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let token = Token::issue(&generate_bank_key(), 3, 1);
        let decoded = Token::from_bytes(&token.to_bytes()).unwrap();
        assert_eq!(decoded, token);
        assert!(Token::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_freshness() {
        let token = Token::issue(&generate_bank_key(), 5, 1);
        assert!(token.is_fresh(5));
        assert!(token.is_fresh(6));
        assert!(!token.is_fresh(7));
        assert!(!token.is_fresh(4));
    }
}
