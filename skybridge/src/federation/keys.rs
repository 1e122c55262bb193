//! Per-actor signing keys: generation, JWK import/export and signatures.
//!
//! Keys are persisted as JWK JSON in the store and materialized in memory
//! only for the duration of one signature.

use anyhow::Context as _;
use base64::Engine as _;
use bridge_store::{BridgeStore, KeyPair, KeyType, NewKeyPair};
use ed25519_dalek::SigningKey as Ed25519SigningKey;
use rsa::pkcs8::{EncodePublicKey as _, LineEnding};
use rsa::traits::{PrivateKeyParts as _, PublicKeyParts as _};
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const RSA_BITS: usize = 2048;

/// Multicodec prefix for an Ed25519 public key.
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// JSON Web Key with the subset of fields the bridge reads and writes.
///
/// CRT parameters are omitted on export; importers recompute them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
}

/// Both key pairs of an actor, as persisted.
#[derive(Clone, Debug)]
pub struct ActorKeys {
    pub rsa: KeyPair,
    pub ed25519: KeyPair,
}

/// Loads the actor's key pairs, generating and persisting any missing one.
///
/// Generation is atomic per `(user_did, type)`: on a race the store hands
/// every caller the winner's row.
pub async fn ensure_key_pairs(store: &dyn BridgeStore, user_did: &str) -> anyhow::Result<ActorKeys> {
    let mut rsa = None;
    let mut ed25519 = None;

    for key_type in KeyType::ALL {
        let pair = match store.get_key_pair(user_did, key_type).await? {
            Some(pair) => pair,
            None => {
                debug!(%user_did, %key_type, "Generating key pair");

                let (public_jwk, private_jwk) = generate(key_type)?;
                store
                    .create_key_pair(NewKeyPair {
                        user_did: user_did.to_owned(),
                        key_type,
                        public_jwk,
                        private_jwk,
                    })
                    .await?
            }
        };

        match key_type {
            KeyType::Rsa => rsa = Some(pair),
            KeyType::Ed25519 => ed25519 = Some(pair),
        }
    }

    Ok(ActorKeys {
        rsa: rsa.context("RSA key pair missing")?,
        ed25519: ed25519.context("Ed25519 key pair missing")?,
    })
}

/// Generates a fresh key pair, returning `(public_jwk, private_jwk)` JSON.
pub fn generate(key_type: KeyType) -> anyhow::Result<(String, String)> {
    match key_type {
        KeyType::Rsa => generate_rsa(),
        KeyType::Ed25519 => generate_ed25519(),
    }
}

fn generate_rsa() -> anyhow::Result<(String, String)> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS).context("RSA key generation failed")?;

    let n = b64(&private_key.n().to_bytes_be());
    let e = b64(&private_key.e().to_bytes_be());

    let public_jwk = Jwk {
        kty: "RSA".to_owned(),
        n: Some(n.clone()),
        e: Some(e.clone()),
        ..Jwk::default()
    };

    let primes = private_key.primes();
    let private_jwk = Jwk {
        kty: "RSA".to_owned(),
        n: Some(n),
        e: Some(e),
        d: Some(b64(&private_key.d().to_bytes_be())),
        p: primes.first().map(|p| b64(&p.to_bytes_be())),
        q: primes.get(1).map(|q| b64(&q.to_bytes_be())),
        ..Jwk::default()
    };

    Ok((to_json(&public_jwk)?, to_json(&private_jwk)?))
}

fn generate_ed25519() -> anyhow::Result<(String, String)> {
    let signing_key = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);

    let x = b64(signing_key.verifying_key().as_bytes());

    let public_jwk = Jwk {
        kty: "OKP".to_owned(),
        crv: Some("Ed25519".to_owned()),
        x: Some(x.clone()),
        ..Jwk::default()
    };

    let private_jwk = Jwk {
        kty: "OKP".to_owned(),
        crv: Some("Ed25519".to_owned()),
        x: Some(x),
        d: Some(b64(signing_key.as_bytes())),
        ..Jwk::default()
    };

    Ok((to_json(&public_jwk)?, to_json(&private_jwk)?))
}

/// Materializes the RSA private key from its JWK JSON.
pub fn import_rsa_private(private_jwk: &str) -> anyhow::Result<RsaPrivateKey> {
    let jwk: Jwk = serde_json::from_str(private_jwk).context("invalid JWK JSON")?;
    anyhow::ensure!(jwk.kty == "RSA", "not an RSA JWK");

    let n = biguint(jwk.n.as_deref().context("JWK is missing n")?)?;
    let e = biguint(jwk.e.as_deref().context("JWK is missing e")?)?;
    let d = biguint(jwk.d.as_deref().context("JWK is missing d")?)?;
    let p = biguint(jwk.p.as_deref().context("JWK is missing p")?)?;
    let q = biguint(jwk.q.as_deref().context("JWK is missing q")?)?;

    RsaPrivateKey::from_components(n, e, d, vec![p, q]).context("invalid RSA private key components")
}

/// Renders the RSA public key as the SPKI PEM string actor documents carry.
pub fn rsa_public_pem(public_jwk: &str) -> anyhow::Result<String> {
    let jwk: Jwk = serde_json::from_str(public_jwk).context("invalid JWK JSON")?;
    anyhow::ensure!(jwk.kty == "RSA", "not an RSA JWK");

    let n = biguint(jwk.n.as_deref().context("JWK is missing n")?)?;
    let e = biguint(jwk.e.as_deref().context("JWK is missing e")?)?;

    let public_key = RsaPublicKey::new(n, e).context("invalid RSA public key components")?;

    public_key
        .to_public_key_pem(LineEnding::LF)
        .context("failed to encode public key PEM")
}

/// Multibase (base58btc) Multikey rendering of an Ed25519 public JWK.
pub fn ed25519_multibase(public_jwk: &str) -> anyhow::Result<String> {
    let jwk: Jwk = serde_json::from_str(public_jwk).context("invalid JWK JSON")?;
    anyhow::ensure!(jwk.kty == "OKP", "not an OKP JWK");

    let x = jwk.x.as_deref().context("JWK is missing x")?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(x)
        .context("invalid base64url in JWK")?;

    let mut prefixed = Vec::with_capacity(ED25519_MULTICODEC.len() + raw.len());
    prefixed.extend_from_slice(&ED25519_MULTICODEC);
    prefixed.extend_from_slice(&raw);

    Ok(multibase::encode(multibase::Base::Base58Btc, prefixed))
}

/// RSASSA-PKCS1-v1_5 signature over the SHA-256 digest of `message`.
pub fn sign_rsa_sha256(private_key: &RsaPrivateKey, message: &[u8]) -> anyhow::Result<Vec<u8>> {
    let digest = Sha256::digest(message);

    private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .context("RSA signing failed")
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn biguint(encoded: &str) -> anyhow::Result<BigUint> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .context("invalid base64url in JWK")?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn to_json(jwk: &Jwk) -> anyhow::Result<String> {
    serde_json::to_string(jwk).context("failed to serialize JWK")
}

#[cfg(test)]
mod tests {
    use rsa::Pkcs1v15Sign;

    use super::*;

    #[test]
    fn rsa_jwk_roundtrip_signs_and_verifies() {
        let (public_jwk, private_jwk) = generate(KeyType::Rsa).unwrap();

        let private_key = import_rsa_private(&private_jwk).unwrap();
        let signature = sign_rsa_sha256(&private_key, b"signed string").unwrap();

        // Rebuild the public key from the public JWK and verify.
        let jwk: Jwk = serde_json::from_str(&public_jwk).unwrap();
        let n = biguint(jwk.n.as_deref().unwrap()).unwrap();
        let e = biguint(jwk.e.as_deref().unwrap()).unwrap();
        let public_key = RsaPublicKey::new(n, e).unwrap();

        let digest = Sha256::digest(b"signed string");
        public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .expect("signature verifies");

        let pem = rsa_public_pem(&public_jwk).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn ed25519_multibase_has_multikey_prefix() {
        let (public_jwk, private_jwk) = generate(KeyType::Ed25519).unwrap();

        let multibase_key = ed25519_multibase(&public_jwk).unwrap();
        // base58btc multibase of 0xed01-prefixed Ed25519 keys.
        assert!(multibase_key.starts_with("z6Mk"));

        // Private JWK carries both halves.
        let jwk: Jwk = serde_json::from_str(&private_jwk).unwrap();
        assert_eq!(jwk.kty, "OKP");
        assert!(jwk.d.is_some());
        assert!(jwk.x.is_some());
    }
}
