use std::fmt::{self, Display};

#[cfg(feature = "aws-lc-rs")]
use aws_lc_rs::{
    self as crypto_provider,
    signature::{Ed25519KeyPair, KeyPair as _},
};
use data_encoding::{BASE32_NOPAD, BASE64URL_NOPAD};
#[cfg(all(not(feature = "aws-lc-rs"), feature = "ring"))]
use ring::{
    self as crypto_provider,
    signature::{Ed25519KeyPair, KeyPair as _},
};

#[cfg(not(any(feature = "aws-lc-rs", feature = "ring")))]
compile_error!("Please enable the `aws-lc-rs` or the `ring` feature");

// 'S' in the crockford base32 alphabet, shifted into the prefix slot
const SEED_PREFIX: u8 = 18 << 3;
const ENCODED_SEED_LEN: usize = 58;
const DECODED_SEED_LEN: usize = 36;

/// An Ed25519 key pair decoded from an nkey seed
///
/// Used to answer the broker's authentication nonce: the `CONNECT`
/// document carries the public key and the base64-url signature of the
/// nonce.
#[derive(Debug)]
pub struct SeedKey {
    kind: u8,
    key: Ed25519KeyPair,
}

/// The public half of a [`SeedKey`], displayed in nkey encoding
#[derive(Debug)]
pub struct PublicKey<'a>(&'a SeedKey);

/// A detached signature, displayed in base64-url
pub struct Signature(crypto_provider::signature::Signature);

impl SeedKey {
    /// Decode a key pair from the string representation of a seed.
    ///
    /// # Errors
    ///
    /// It returns an error if `seed` is not a well-formed nkey seed.
    pub fn from_encoded_seed(seed: &str) -> Result<Self, SeedDecodeError> {
        if seed.len() != ENCODED_SEED_LEN {
            return Err(SeedDecodeError::BadLength);
        }

        let mut decoded = [0; DECODED_SEED_LEN];
        let len = BASE32_NOPAD
            .decode_mut(seed.as_bytes(), &mut decoded)
            .map_err(|_| SeedDecodeError::BadBase32)?;
        if len != decoded.len() {
            return Err(SeedDecodeError::BadLength);
        }

        let (raw, checksum) = decoded.split_at(decoded.len() - 2);
        let expected = u16::from_le_bytes(checksum.try_into().expect("two checksum bytes"));
        if crc16(raw) != expected {
            return Err(SeedDecodeError::BadChecksum);
        }

        if raw[0] & 0xf8 != SEED_PREFIX {
            return Err(SeedDecodeError::BadPrefix);
        }

        let key = Ed25519KeyPair::from_seed_unchecked(&raw[2..])
            .map_err(|_| SeedDecodeError::BadKeyMaterial)?;
        Ok(Self { kind: raw[1], key })
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey<'_> {
        PublicKey(self)
    }

    /// Sign `buf` with the private half of the key
    #[must_use]
    pub fn sign(&self, buf: &[u8]) -> Signature {
        Signature(self.key.sign(buf))
    }
}

fn crc16(buf: &[u8]) -> u16 {
    crc::Crc::<u16>::new(&crc::CRC_16_XMODEM).checksum(buf)
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&BASE64URL_NOPAD.encode_display(self.0.as_ref()), f)
    }
}

impl Display for PublicKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // prefix byte + 32 key bytes + crc16
        let mut raw = [0; 35];
        raw[0] = self.0.kind;
        raw[1..33].copy_from_slice(self.0.key.public_key().as_ref());
        let checksum = crc16(&raw[..33]).to_le_bytes();
        raw[33..].copy_from_slice(&checksum);
        Display::fmt(&BASE32_NOPAD.encode_display(&raw), f)
    }
}

/// An error encountered while decoding an nkey seed
#[derive(Debug, thiserror::Error)]
pub enum SeedDecodeError {
    #[error("the seed has an unexpected length")]
    BadLength,
    #[error("the seed contains non-base32 characters")]
    BadBase32,
    #[error("the seed checksum does not match")]
    BadChecksum,
    #[error("the seed carries an unknown prefix")]
    BadPrefix,
    #[error("the seed key material was rejected by the crypto backend")]
    BadKeyMaterial,
}

#[cfg(test)]
mod tests {
    use data_encoding::BASE32_NOPAD;

    use claims::{assert_err, assert_matches, assert_ok};

    use super::{crc16, SeedDecodeError, SeedKey, DECODED_SEED_LEN, SEED_PREFIX};

    // byte 20 << 3 renders as 'U' in base32, the user key class
    const USER_KIND: u8 = 20 << 3;

    fn encoded_seed(key_material: [u8; 32]) -> String {
        let mut raw = [0; DECODED_SEED_LEN];
        raw[0] = SEED_PREFIX;
        raw[1] = USER_KIND;
        raw[2..34].copy_from_slice(&key_material);
        let checksum = crc16(&raw[..34]).to_le_bytes();
        raw[34..].copy_from_slice(&checksum);
        BASE32_NOPAD.encode(&raw)
    }

    #[test]
    fn decode_and_sign() {
        let key = assert_ok!(SeedKey::from_encoded_seed(&encoded_seed([7; 32])));
        let public = key.public_key().to_string();
        assert!(public.starts_with('U'), "user public key, got {public}");

        let signature = key.sign(b"nonce").to_string();
        assert!(!signature.is_empty());
        // base64-url alphabet only
        assert!(signature
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_')));
    }

    #[test]
    fn signing_is_deterministic() {
        let seed = encoded_seed([42; 32]);
        let a = SeedKey::from_encoded_seed(&seed).unwrap();
        let b = SeedKey::from_encoded_seed(&seed).unwrap();
        assert_eq!(a.sign(b"nonce").to_string(), b.sign(b"nonce").to_string());
    }

    #[test]
    fn reject_malformed_seeds() {
        assert_err!(SeedKey::from_encoded_seed(""));
        assert_err!(SeedKey::from_encoded_seed("SUAJ3I2YOAY2"));

        let seed = encoded_seed([7; 32]);
        let mut corrupted = seed.clone();
        let tweak = if &seed[10..11] == "A" { "B" } else { "A" };
        corrupted.replace_range(10..11, tweak);
        assert_matches!(
            SeedKey::from_encoded_seed(&corrupted),
            Err(SeedDecodeError::BadChecksum | SeedDecodeError::BadBase32)
        );

        let mut bad_prefix = [0; DECODED_SEED_LEN];
        bad_prefix[0] = 0xff;
        bad_prefix[1] = USER_KIND;
        let checksum = crc16(&bad_prefix[..34]).to_le_bytes();
        bad_prefix[34..].copy_from_slice(&checksum);
        assert_matches!(
            SeedKey::from_encoded_seed(&BASE32_NOPAD.encode(&bad_prefix)),
            Err(SeedDecodeError::BadPrefix)
        );
    }
}
