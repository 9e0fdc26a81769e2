use crate::error::{AccordError, AuthReason, Result};
use crate::storage::StorageAdapter;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SECRET_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// Signing header set carried on every authenticated request.
pub const HEADER_AGENT_ID: &str = "x-agent-id";
pub const HEADER_SIGNATURE: &str = "x-agent-signature";
pub const HEADER_TIMESTAMP: &str = "x-agent-timestamp";

const SECRET_KEY_SUFFIX: &str = "secret_key";
const PUBLIC_KEY_SUFFIX: &str = "public_key";

/// Ephemeral per-request signing material. Built on both sides of a call
/// and combined into a canonical newline-joined string; never persisted.
#[derive(Debug, Clone)]
pub struct SigningContext {
    pub method: String,
    pub path: String,
    pub timestamp_ms: i64,
    pub body_digest: String,
}

impl SigningContext {
    /// Builds the context for a request. PATH excludes the query string;
    /// BODY_DIGEST is the base64 SHA-256 of the raw body bytes (the empty
    /// byte string when there is no body).
    pub fn for_request(method: &str, path: &str, timestamp_ms: i64, body: &[u8]) -> Self {
        let path = path.split('?').next().unwrap_or(path).to_string();
        Self {
            method: method.to_ascii_uppercase(),
            path,
            timestamp_ms,
            body_digest: BASE64.encode(Sha256::digest(body)),
        }
    }

    /// `METHOD\nPATH\nTIMESTAMP_MS\nBODY_DIGEST` - bit-exact reproduction
    /// is required for interoperability between independent agents and
    /// brokers.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}",
            self.method, self.path, self.timestamp_ms, self.body_digest
        )
    }
}

/// The header triple an agent attaches to an authenticated request.
#[derive(Debug, Clone)]
pub struct RequestSignature {
    pub agent_id: crate::AgentId,
    pub signature: String,
    pub timestamp_ms: i64,
}

impl RequestSignature {
    pub fn as_headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_AGENT_ID, self.agent_id.to_string()),
            (HEADER_SIGNATURE, self.signature.clone()),
            (HEADER_TIMESTAMP, self.timestamp_ms.to_string()),
        ]
    }
}

/// An agent's self-generated Ed25519 identity. Generated once, persisted
/// through a [`StorageAdapter`] under a namespace prefix, and reused across
/// restarts.
pub struct KeyIdentity {
    signing_key: SigningKey,
    key_id: String,
}

impl KeyIdentity {
    /// Loads a persisted key pair from `storage` under `namespace`, or
    /// generates and persists a fresh one.
    pub fn load_or_generate<S: StorageAdapter + ?Sized>(storage: &S, namespace: &str) -> Result<Self> {
        let secret_key = format!("{}:{}", namespace, SECRET_KEY_SUFFIX);
        if let Some(encoded) = storage.get(&secret_key)? {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| AccordError::Storage(format!("corrupt stored key: {}", e)))?;
            let seed: [u8; SECRET_KEY_LENGTH] = bytes
                .try_into()
                .map_err(|_| AccordError::Storage("stored key has wrong length".to_string()))?;
            return Ok(Self::from_seed(seed));
        }

        let identity = Self::generate();
        identity.persist(storage, namespace)?;
        Ok(identity)
    }

    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    pub fn from_seed(seed: [u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let key_id = derive_key_id(signing_key.verifying_key().as_bytes());
        Self { signing_key, key_id }
    }

    fn persist<S: StorageAdapter + ?Sized>(&self, storage: &S, namespace: &str) -> Result<()> {
        storage.set(
            &format!("{}:{}", namespace, SECRET_KEY_SUFFIX),
            &BASE64.encode(self.signing_key.to_bytes()),
        )?;
        storage.set(
            &format!("{}:{}", namespace, PUBLIC_KEY_SUFFIX),
            &self.public_key_base64(),
        )?;
        Ok(())
    }

    /// Replaces the pair with a freshly generated one and persists it. The
    /// old pair's server-side record is not revoked here; revocation is an
    /// explicit broker operation.
    pub fn rotate<S: StorageAdapter + ?Sized>(&mut self, storage: &S, namespace: &str) -> Result<()> {
        let fresh = Self::generate();
        fresh.persist(storage, namespace)?;
        *self = fresh;
        Ok(())
    }

    /// Base64 of the raw 32-byte public key. Raw bytes rather than a DER
    /// wrapper so browser, mobile, and server runtimes interoperate without
    /// a shared ASN.1 library at the call site.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// SHA-256 hex of the raw public key. A logging and comparison aid,
    /// never a security boundary by itself.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.signing_key.verifying_key().as_bytes()))
    }

    /// Short stable identifier derived from the fingerprint.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signs arbitrary bytes, returning the base64 64-byte signature. Used
    /// both for registration proof-of-possession (over the exact body
    /// bytes) and for canonical request strings.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }

    /// Produces the signed header triple for one request.
    pub fn sign_request(
        &self,
        agent_id: crate::AgentId,
        method: &str,
        path: &str,
        body: &[u8],
        now_ms: i64,
    ) -> RequestSignature {
        let context = SigningContext::for_request(method, path, now_ms, body);
        RequestSignature {
            agent_id,
            signature: self.sign(context.canonical_string().as_bytes()),
            timestamp_ms: now_ms,
        }
    }
}

pub fn derive_key_id(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))[..16].to_string()
}

/// Decodes a base64 raw 32-byte public key. Length and encoding problems
/// are reported as malformed input, distinct from verification failure.
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = BASE64.decode(encoded).map_err(|e| {
        AccordError::Auth(AuthReason::MalformedInput(format!("public key base64: {}", e)))
    })?;
    let raw: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
        AccordError::Auth(AuthReason::MalformedInput(
            "public key must be 32 raw bytes".to_string(),
        ))
    })?;
    VerifyingKey::from_bytes(&raw).map_err(|e| {
        AccordError::Auth(AuthReason::MalformedInput(format!("public key: {}", e)))
    })
}

/// Decodes a base64 signature, rejecting anything that is not exactly 64
/// bytes once decoded.
pub fn decode_signature(encoded: &str) -> Result<Signature> {
    let bytes = BASE64.decode(encoded).map_err(|e| {
        AccordError::Auth(AuthReason::MalformedInput(format!("signature base64: {}", e)))
    })?;
    let raw: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
        AccordError::Auth(AuthReason::MalformedInput(
            "signature must be 64 bytes".to_string(),
        ))
    })?;
    Ok(Signature::from_bytes(&raw))
}
