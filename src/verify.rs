//! C5 — Signature Verifier.
//!
//! Extracts the contents and signatures entries from a ZIP-style archive,
//! hashes the contents blob, and checks that at least one embedded
//! signature verifies against the source's allowed public keys. The
//! ECDSA/SHA-256 machinery is grounded on the signing primitives used
//! elsewhere in this crate's crypto layer (see [`crate::token`]); the
//! `p256` DER-signature round trip and SEC1 point encoding mirror that
//! same usage.

use std::io::{Cursor, Read};

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature as P256Signature, VerifyingKey as P256VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::{ArchiveContents, PublicKey, SignatureAlgorithm, SignatureInfo};

const CONTENTS_ENTRY_NAME: &str = "export.bin";
const SIGNATURES_ENTRY_NAME: &str = "export.sig";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed archive: {0}")]
    Malformed(String),
    #[error("no embedded signature verified")]
    Unauthentic,
}

/// The outcome of a successful verification pass: the parsed contents plus
/// a marker that at least one signature checked out.
pub struct VerifiedArchive {
    pub contents: ArchiveContents,
    pub verified: bool,
}

fn read_zip_entry(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>, VerifyError> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| VerifyError::Malformed(format!("missing entry {name}")))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| VerifyError::Malformed(e.to_string()))?;
    Ok(buf)
}

/// Parses the two mandatory ZIP entries out of an archive byte stream.
pub fn parse_archive(bytes: &[u8]) -> Result<(ArchiveContents, Vec<SignatureInfo>), VerifyError> {
    let cursor = Cursor::new(bytes);
    let mut zip = zip::ZipArchive::new(cursor)
        .map_err(|e| VerifyError::Malformed(e.to_string()))?;

    let contents_bytes = read_zip_entry(&mut zip, CONTENTS_ENTRY_NAME)?;
    let signatures_bytes = read_zip_entry(&mut zip, SIGNATURES_ENTRY_NAME)?;

    let contents: ArchiveContents = serde_json::from_slice(&contents_bytes)
        .map_err(|e| VerifyError::Malformed(format!("contents blob: {e}")))?;
    let signatures: Vec<SignatureInfo> = serde_json::from_slice(&signatures_bytes)
        .map_err(|e| VerifyError::Malformed(format!("signatures blob: {e}")))?;

    Ok((contents, signatures))
}

/// Computes the SHA-256 content digest the signatures were produced over.
pub fn content_digest(contents_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(contents_bytes);
    hasher.finalize().into()
}

fn parse_public_key_pem(pem: &str) -> Option<P256VerifyingKey> {
    P256VerifyingKey::from_public_key_pem(pem).ok()
}

/// Verifies `digest` against every signature whose `(key_id, key_version)`
/// matches an allowed public key. Declares the archive authentic if ANY
/// signature verifies; signatures without a matching public key are
/// skipped, not fatal.
pub fn verify_signatures(
    digest: &[u8],
    signatures: &[SignatureInfo],
    allowed_keys: &[PublicKey],
) -> Result<(), VerifyError> {
    for signature_info in signatures {
        if signature_info.algorithm != SignatureAlgorithm::EcdsaSha256 {
            continue;
        }

        let matching_key = allowed_keys.iter().find(|pk| {
            pk.key_id == signature_info.verification_key_id
                && pk.key_version == signature_info.verification_key_version
        });

        let Some(matching_key) = matching_key else {
            tracing::debug!(
                key_id = %signature_info.verification_key_id,
                key_version = %signature_info.verification_key_version,
                "signature has no matching allowed public key, skipping"
            );
            continue;
        };

        let Some(verifying_key) = parse_public_key_pem(&matching_key.pem) else {
            tracing::warn!(key_id = %matching_key.key_id, "unparseable public key pem");
            continue;
        };

        let Ok(signature) = P256Signature::from_der(&signature_info.signature_bytes) else {
            continue;
        };

        if verifying_key.verify(digest, &signature).is_ok() {
            return Ok(());
        }
    }

    Err(VerifyError::Unauthentic)
}

/// Full C5 protocol: parse the archive, hash its contents, and check the
/// embedded signatures against `allowed_keys`.
pub fn verify_archive(bytes: &[u8], allowed_keys: &[PublicKey]) -> Result<VerifiedArchive, VerifyError> {
    let cursor = Cursor::new(bytes);
    let mut zip = zip::ZipArchive::new(cursor)
        .map_err(|e| VerifyError::Malformed(e.to_string()))?;

    let contents_bytes = read_zip_entry(&mut zip, CONTENTS_ENTRY_NAME)?;
    let signatures_bytes = read_zip_entry(&mut zip, SIGNATURES_ENTRY_NAME)?;

    let contents: ArchiveContents = serde_json::from_slice(&contents_bytes)
        .map_err(|e| VerifyError::Malformed(format!("contents blob: {e}")))?;
    let signatures: Vec<SignatureInfo> = serde_json::from_slice(&signatures_bytes)
        .map_err(|e| VerifyError::Malformed(format!("signatures blob: {e}")))?;

    let digest = content_digest(&contents_bytes);
    verify_signatures(&digest, &signatures, allowed_keys)?;

    Ok(VerifiedArchive { contents, verified: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;
    use rand::rngs::OsRng;
    use std::io::Write;

    fn build_archive(contents: &ArchiveContents, signatures: &[SignatureInfo]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::FileOptions::default();

            writer.start_file(CONTENTS_ENTRY_NAME, options).unwrap();
            writer.write_all(&serde_json::to_vec(contents).unwrap()).unwrap();

            writer.start_file(SIGNATURES_ENTRY_NAME, options).unwrap();
            writer.write_all(&serde_json::to_vec(signatures).unwrap()).unwrap();

            writer.finish().unwrap();
        }
        buf
    }

    fn sample_contents() -> ArchiveContents {
        ArchiveContents {
            start_timestamp: Utc::now(),
            end_timestamp: Utc::now(),
            region: "US".to_string(),
            keys: vec![],
            revised_keys: vec![],
        }
    }

    #[test]
    fn verifies_when_signature_matches_allowed_key() {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let pem = verifying_key.to_public_key_pem(Default::default()).unwrap();

        let contents = sample_contents();
        let contents_bytes = serde_json::to_vec(&contents).unwrap();
        let digest = content_digest(&contents_bytes);
        let signature: P256Signature = signing_key.sign(&digest);

        let signatures = vec![SignatureInfo {
            verification_key_id: "key-1".to_string(),
            verification_key_version: "v1".to_string(),
            algorithm: SignatureAlgorithm::EcdsaSha256,
            signature_bytes: signature.to_der().as_bytes().to_vec(),
        }];

        let archive_bytes = build_archive(&contents, &signatures);

        let allowed_keys = vec![PublicKey {
            source_id: uuid::Uuid::new_v4(),
            key_id: "key-1".to_string(),
            key_version: "v1".to_string(),
            pem,
            from_ts: Utc::now(),
            thru_ts: None,
        }];

        let result = verify_archive(&archive_bytes, &allowed_keys);
        assert!(result.is_ok());
    }

    #[test]
    fn fails_unauthentic_when_no_key_matches() {
        let signing_key = SigningKey::random(&mut OsRng);
        let other_signing_key = SigningKey::random(&mut OsRng);
        let other_verifying_key = other_signing_key.verifying_key();
        let pem = other_verifying_key.to_public_key_pem(Default::default()).unwrap();

        let contents = sample_contents();
        let contents_bytes = serde_json::to_vec(&contents).unwrap();
        let digest = content_digest(&contents_bytes);
        let signature: P256Signature = signing_key.sign(&digest);

        let signatures = vec![SignatureInfo {
            verification_key_id: "key-1".to_string(),
            verification_key_version: "v1".to_string(),
            algorithm: SignatureAlgorithm::EcdsaSha256,
            signature_bytes: signature.to_der().as_bytes().to_vec(),
        }];

        let archive_bytes = build_archive(&contents, &signatures);

        let allowed_keys = vec![PublicKey {
            source_id: uuid::Uuid::new_v4(),
            key_id: "key-1".to_string(),
            key_version: "v1".to_string(),
            pem,
            from_ts: Utc::now(),
            thru_ts: None,
        }];

        let result = verify_archive(&archive_bytes, &allowed_keys);
        assert!(matches!(result, Err(VerifyError::Unauthentic)));
    }

    #[test]
    fn malformed_archive_missing_entry() {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let writer = zip::ZipWriter::new(cursor);
            writer.finish().unwrap();
        }
        let result = parse_archive(&buf);
        assert!(matches!(result, Err(VerifyError::Malformed(_))));
    }
}
