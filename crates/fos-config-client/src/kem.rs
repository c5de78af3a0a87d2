//! Key encapsulation for the post-quantum preshared key.
//!
//! The relay encapsulates one secret per KEM. The PSK is their XOR, so it
//! stays secret as long as either KEM holds.

use crate::ConfigClientError;
use crate::proto::KemPubkeyV1;
use classic_mceliece_rust::{CRYPTO_CIPHERTEXTBYTES, Ciphertext};
use fos_tunnel_types::PreSharedKey;
use pqc_kyber::{KYBER_CIPHERTEXTBYTES, KYBER_SECRETKEYBYTES};
use rand::rngs::OsRng;
use zeroize::{Zeroize, Zeroizing};

pub const MCELIECE_ALGORITHM: &str = "Classic-McEliece-460896f-round3";
pub const KYBER_ALGORITHM: &str = "Kyber1024";

/// Secret halves of the key pairs sent to the relay
pub struct KemSecrets {
    mceliece: classic_mceliece_rust::SecretKey<'static>,
    kyber: Zeroizing<[u8; KYBER_SECRETKEYBYTES]>,
}

/// Generate one key pair per KEM, public keys in the order the relay answers in.
pub async fn generate_keys() -> Result<(Vec<KemPubkeyV1>, KemSecrets), ConfigClientError> {
    // McEliece key generation takes long enough to stall the runtime.
    let (mceliece_public, mceliece_secret) =
        tokio::task::spawn_blocking(|| classic_mceliece_rust::keypair_boxed(&mut OsRng))
            .await
            .map_err(|_| ConfigClientError::KeyGeneration(MCELIECE_ALGORITHM))?;
    let kyber = pqc_kyber::keypair(&mut OsRng)
        .map_err(|_| ConfigClientError::KeyGeneration(KYBER_ALGORITHM))?;

    let public_keys = vec![
        KemPubkeyV1 {
            algorithm_name: MCELIECE_ALGORITHM.to_owned(),
            key_data: mceliece_public.as_array().to_vec(),
        },
        KemPubkeyV1 {
            algorithm_name: KYBER_ALGORITHM.to_owned(),
            key_data: kyber.public.to_vec(),
        },
    ];
    let secrets = KemSecrets {
        mceliece: mceliece_secret,
        kyber: Zeroizing::new(kyber.secret),
    };
    Ok((public_keys, secrets))
}

/// Derive the PSK from the relay's ciphertexts, McEliece first.
pub fn decapsulate(
    secrets: &KemSecrets,
    ciphertexts: &[Vec<u8>],
) -> Result<PreSharedKey, ConfigClientError> {
    let (mceliece_ciphertext, kyber_ciphertext) = split_ciphertexts(ciphertexts)?;
    let mut psk = Zeroizing::new([0u8; 32]);

    let mut shared =
        classic_mceliece_rust::decapsulate_boxed(&mceliece_ciphertext, &secrets.mceliece);
    xor_assign(&mut psk, shared.as_array());
    shared.zeroize();

    let mut shared = pqc_kyber::decapsulate(kyber_ciphertext, secrets.kyber.as_slice())
        .map_err(|_| ConfigClientError::Decapsulate(KYBER_ALGORITHM))?;
    xor_assign(&mut psk, &shared);
    shared.zeroize();

    Ok(PreSharedKey::from_bytes(*psk))
}

fn split_ciphertexts(
    ciphertexts: &[Vec<u8>],
) -> Result<(Ciphertext, &[u8]), ConfigClientError> {
    let [mceliece, kyber] = ciphertexts else {
        return Err(ConfigClientError::InvalidCiphertextCount(ciphertexts.len()));
    };
    let mceliece: [u8; CRYPTO_CIPHERTEXTBYTES] =
        mceliece
            .as_slice()
            .try_into()
            .map_err(|_| ConfigClientError::InvalidCiphertextLength {
                algorithm: MCELIECE_ALGORITHM,
                expected: CRYPTO_CIPHERTEXTBYTES,
                actual: mceliece.len(),
            })?;
    if kyber.len() != KYBER_CIPHERTEXTBYTES {
        return Err(ConfigClientError::InvalidCiphertextLength {
            algorithm: KYBER_ALGORITHM,
            expected: KYBER_CIPHERTEXTBYTES,
            actual: kyber.len(),
        });
    }
    Ok((Ciphertext::from(mceliece), kyber.as_slice()))
}

fn xor_assign(dst: &mut [u8; 32], src: &[u8; 32]) {
    for (dst, src) in dst.iter_mut().zip(src) {
        *dst ^= src;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_assign() {
        let mut psk = [0b1010_1010; 32];
        xor_assign(&mut psk, &[0b1111_0000; 32]);
        assert_eq!(psk, [0b0101_1010; 32]);
        xor_assign(&mut psk, &[0b1111_0000; 32]);
        assert_eq!(psk, [0b1010_1010; 32]);
    }

    #[test]
    fn test_ciphertext_count_is_checked() {
        let one = vec![vec![0u8; CRYPTO_CIPHERTEXTBYTES]];
        assert!(matches!(
            split_ciphertexts(&one),
            Err(ConfigClientError::InvalidCiphertextCount(1))
        ));

        let three = vec![vec![0u8; 8]; 3];
        assert!(matches!(
            split_ciphertexts(&three),
            Err(ConfigClientError::InvalidCiphertextCount(3))
        ));
    }

    #[test]
    fn test_ciphertext_lengths_are_checked() {
        let short_mceliece = vec![
            vec![0u8; CRYPTO_CIPHERTEXTBYTES - 1],
            vec![0u8; KYBER_CIPHERTEXTBYTES],
        ];
        assert!(matches!(
            split_ciphertexts(&short_mceliece),
            Err(ConfigClientError::InvalidCiphertextLength {
                algorithm: MCELIECE_ALGORITHM,
                ..
            })
        ));

        let long_kyber = vec![
            vec![0u8; CRYPTO_CIPHERTEXTBYTES],
            vec![0u8; KYBER_CIPHERTEXTBYTES + 1],
        ];
        assert!(matches!(
            split_ciphertexts(&long_kyber),
            Err(ConfigClientError::InvalidCiphertextLength {
                algorithm: KYBER_ALGORITHM,
                expected: KYBER_CIPHERTEXTBYTES,
                ..
            })
        ));

        let valid = vec![
            vec![7u8; CRYPTO_CIPHERTEXTBYTES],
            vec![9u8; KYBER_CIPHERTEXTBYTES],
        ];
        let (mceliece, kyber) = split_ciphertexts(&valid).unwrap();
        assert_eq!(mceliece.as_array(), &[7u8; CRYPTO_CIPHERTEXTBYTES]);
        assert_eq!(kyber, &[9u8; KYBER_CIPHERTEXTBYTES][..]);
    }

    #[test]
    fn test_psk_mixes_both_shared_secrets() {
        let (mceliece_public, mceliece_secret) = classic_mceliece_rust::keypair_boxed(&mut OsRng);
        let kyber = pqc_kyber::keypair(&mut OsRng).unwrap();
        let secrets = KemSecrets {
            mceliece: mceliece_secret,
            kyber: Zeroizing::new(kyber.secret),
        };

        // Relay side
        let (mceliece_ciphertext, mceliece_shared) =
            classic_mceliece_rust::encapsulate_boxed(&mceliece_public, &mut OsRng);
        let (kyber_ciphertext, kyber_shared) =
            pqc_kyber::encapsulate(&kyber.public, &mut OsRng).unwrap();

        let ciphertexts = vec![
            mceliece_ciphertext.as_array().to_vec(),
            kyber_ciphertext.to_vec(),
        ];
        let psk = decapsulate(&secrets, &ciphertexts).unwrap();

        let mut expected = *mceliece_shared.as_array();
        xor_assign(&mut expected, &kyber_shared);
        assert_eq!(psk.as_bytes(), &expected);

        // Swapped order fails the length check instead of yielding a bogus key.
        let swapped = vec![ciphertexts[1].clone(), ciphertexts[0].clone()];
        assert!(matches!(
            decapsulate(&secrets, &swapped),
            Err(ConfigClientError::InvalidCiphertextLength { .. })
        ));
    }
}
