use hkdf::Hkdf;
use sha2::Sha256;

use super::CryptoError;

/// Expands a key using HKDF-SHA256.
///
/// * `key`: the input keying material.
/// * `salt`: an optional salt.
/// * `info`: context label binding the output to its use.
/// * `length`: the desired length of the output key.
pub fn sha256(
    key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, key);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm).map_err(|_| CryptoError::Kdf)?;
    Ok(okm)
}

/// Same as [`sha256`] but for a fixed output size.
pub fn sha256_array<const N: usize>(
    key: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<[u8; N], CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, key);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm).map_err(|_| CryptoError::Kdf)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc5869_case_1() {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();
        let okm = sha256(&ikm, Some(&salt), &info, 42).unwrap();
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_array_matches_vec() {
        let a: [u8; 16] = sha256_array(b"ikm", None, b"label").unwrap();
        assert_eq!(a.to_vec(), sha256(b"ikm", None, b"label", 16).unwrap());
    }

    #[test]
    fn test_oversized_output_is_rejected() {
        assert_eq!(sha256(b"k", None, b"", 255 * 32 + 1), Err(CryptoError::Kdf));
    }
}
