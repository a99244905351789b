// Per-request secret envelope. Requests may carry `x-action-context`
// headers (chunked as -1, -2, ... when large) holding base64 JSON; when the
// server is configured with decryption keys the JSON is an AES-GCM envelope
// `{cipher, iv, auth-tag}` and the first key that authenticates wins.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map, Value};

use runway_types::{Result, ServerError};

pub const ACTION_CONTEXT_HEADER: &str = "x-action-context";

#[derive(Clone, Default)]
pub struct DecryptConfig {
    keys: Vec<[u8; 32]>,
    decrypt_information: Vec<String>,
}

impl DecryptConfig {
    /// Read `ACTION_SERVER_DECRYPT_KEYS` (JSON array of base64 32-byte keys)
    /// and `ACTION_SERVER_DECRYPT_INFORMATION` (JSON array of locations).
    pub fn from_env() -> Self {
        let keys = std::env::var("ACTION_SERVER_DECRYPT_KEYS")
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|encoded| {
                let bytes = BASE64.decode(encoded.trim()).ok()?;
                let key: [u8; 32] = bytes.try_into().ok()?;
                Some(key)
            })
            .collect();
        let decrypt_information = std::env::var("ACTION_SERVER_DECRYPT_INFORMATION")
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .unwrap_or_default();
        Self {
            keys,
            decrypt_information,
        }
    }

    pub fn with_keys(keys: Vec<[u8; 32]>, decrypt_information: Vec<String>) -> Self {
        Self {
            keys,
            decrypt_information,
        }
    }

    fn header_must_decrypt(&self) -> bool {
        self.decrypt_information
            .iter()
            .any(|loc| loc == "header:x-action-context" || loc == ACTION_CONTEXT_HEADER)
    }
}

/// The decrypted context tree a request carries: `secrets`,
/// `invocation_context` and `data_context` sub-trees.
#[derive(Debug, Clone)]
pub struct ActionContext {
    tree: Value,
}

impl ActionContext {
    /// Assemble the (possibly chunked) header value and decode it. Returns
    /// None when the request carries no context at all.
    pub fn from_headers(
        headers: &HashMap<String, String>,
        config: &DecryptConfig,
    ) -> Result<Option<Self>> {
        let Some(joined) = collect_chunks(headers) else {
            return Ok(None);
        };
        let decoded = BASE64
            .decode(joined.as_bytes())
            .map_err(|e| ServerError::Validation(format!("bad action context encoding: {e}")))?;
        let envelope: Value = serde_json::from_slice(&decoded)
            .map_err(|e| ServerError::Validation(format!("bad action context payload: {e}")))?;

        let tree = if envelope.get("cipher").is_some() {
            decrypt_envelope(&envelope, config)?
        } else if config.header_must_decrypt() {
            return Err(ServerError::Auth(
                "action context must be encrypted but no cipher was found".to_string(),
            ));
        } else {
            envelope
        };
        Ok(Some(Self { tree }))
    }

    pub fn secrets(&self) -> Option<&Value> {
        self.tree.get("secrets")
    }

    pub fn invocation_context(&self) -> Option<&Value> {
        self.tree.get("invocation_context")
    }

    pub fn data_context(&self) -> Option<&Value> {
        self.tree.get("data_context")
    }

    /// Resolve the values injected for an action's managed parameters.
    /// Secrets never leave this map: the engine passes it straight to the
    /// worker and never writes it to artifacts or logs.
    pub fn managed_param_values(
        context: Option<&Self>,
        managed_params_json: Option<&str>,
        request_headers: &HashMap<String, String>,
    ) -> Map<String, Value> {
        let mut values = Map::new();
        let Some(raw) = managed_params_json else {
            return values;
        };
        let Ok(declared) = serde_json::from_str::<HashMap<String, String>>(raw) else {
            return values;
        };

        for (name, kind) in declared {
            let value = match kind.as_str() {
                "secret" | "oauth2_secret" => context
                    .and_then(|ctx| ctx.secrets())
                    .and_then(|secrets| secrets.get(&name))
                    .cloned(),
                "data_source" => context.and_then(|ctx| {
                    ctx.data_context()
                        .and_then(|data| data.get(&name).cloned().or_else(|| Some(data.clone())))
                }),
                "request" => Some(json!({ "headers": request_headers })),
                _ => None,
            };
            if let Some(value) = value {
                values.insert(name, value);
            }
        }
        values
    }
}

fn collect_chunks(headers: &HashMap<String, String>) -> Option<String> {
    if let Some(whole) = headers.get(ACTION_CONTEXT_HEADER) {
        return Some(whole.clone());
    }
    let mut chunks: Vec<(u32, &str)> = headers
        .iter()
        .filter_map(|(key, value)| {
            let suffix = key.strip_prefix("x-action-context-")?;
            Some((suffix.parse::<u32>().ok()?, value.as_str()))
        })
        .collect();
    if chunks.is_empty() {
        return None;
    }
    chunks.sort_by_key(|(n, _)| *n);
    Some(chunks.into_iter().map(|(_, v)| v).collect::<String>())
}

fn decrypt_envelope(envelope: &Value, config: &DecryptConfig) -> Result<Value> {
    let cipher_b64 = envelope
        .get("cipher")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServerError::Validation("envelope is missing cipher".to_string()))?;
    let iv_b64 = envelope
        .get("iv")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServerError::Validation("envelope is missing iv".to_string()))?;
    let tag_b64 = envelope
        .get("auth-tag")
        .or_else(|| envelope.get("auth_tag"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ServerError::Validation("envelope is missing auth-tag".to_string()))?;

    let ciphertext = BASE64
        .decode(cipher_b64)
        .map_err(|e| ServerError::Validation(format!("bad cipher encoding: {e}")))?;
    let iv = BASE64
        .decode(iv_b64)
        .map_err(|e| ServerError::Validation(format!("bad iv encoding: {e}")))?;
    let tag = BASE64
        .decode(tag_b64)
        .map_err(|e| ServerError::Validation(format!("bad auth-tag encoding: {e}")))?;

    if config.keys.is_empty() {
        return Err(ServerError::Auth(
            "encrypted action context received but no decryption keys are configured".to_string(),
        ));
    }

    // AES-GCM wants ciphertext||tag.
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    for key in &config.keys {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ServerError::Infrastructure(format!("bad decryption key: {e}")))?;
        if let Ok(plain) = cipher.decrypt(Nonce::from_slice(&iv), sealed.as_slice()) {
            return serde_json::from_slice(&plain)
                .map_err(|e| ServerError::Validation(format!("decrypted context is not JSON: {e}")));
        }
    }
    Err(ServerError::Auth(
        "no configured key authenticates the action context".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::AeadCore;
    use aes_gcm::aead::OsRng;

    fn encrypt_with(key: &[u8; 32], tree: &Value) -> String {
        let cipher = Aes256Gcm::new_from_slice(key).expect("key");
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, serde_json::to_vec(tree).expect("json").as_slice())
            .expect("encrypt");
        let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);
        let envelope = json!({
            "cipher": BASE64.encode(ciphertext),
            "iv": BASE64.encode(nonce),
            "auth-tag": BASE64.encode(tag),
        });
        BASE64.encode(envelope.to_string())
    }

    fn tree() -> Value {
        json!({
            "secrets": {"api_key": "shhh"},
            "invocation_context": {"agent_id": "a1"},
            "data_context": {"source": {"engine": "sqlite"}}
        })
    }

    #[test]
    fn plain_context_decodes_without_keys() {
        let mut headers = HashMap::new();
        headers.insert(
            ACTION_CONTEXT_HEADER.to_string(),
            BASE64.encode(tree().to_string()),
        );
        let ctx = ActionContext::from_headers(&headers, &DecryptConfig::default())
            .expect("decode")
            .expect("present");
        assert_eq!(ctx.secrets().unwrap()["api_key"], "shhh");
    }

    #[test]
    fn encrypted_context_uses_first_authenticating_key() {
        let wrong = [1u8; 32];
        let right = [2u8; 32];
        let mut headers = HashMap::new();
        headers.insert(
            ACTION_CONTEXT_HEADER.to_string(),
            encrypt_with(&right, &tree()),
        );

        let config = DecryptConfig::with_keys(vec![wrong, right], vec![]);
        let ctx = ActionContext::from_headers(&headers, &config)
            .expect("decode")
            .expect("present");
        assert_eq!(ctx.invocation_context().unwrap()["agent_id"], "a1");
    }

    #[test]
    fn no_authenticating_key_fails_closed() {
        let mut headers = HashMap::new();
        headers.insert(
            ACTION_CONTEXT_HEADER.to_string(),
            encrypt_with(&[3u8; 32], &tree()),
        );
        let config = DecryptConfig::with_keys(vec![[4u8; 32]], vec![]);
        let err = ActionContext::from_headers(&headers, &config).expect_err("must fail");
        assert!(matches!(err, ServerError::Auth(_)));
    }

    #[test]
    fn chunked_headers_reassemble_in_suffix_order() {
        let whole = BASE64.encode(tree().to_string());
        let (a, b) = whole.split_at(whole.len() / 2);
        let mut headers = HashMap::new();
        headers.insert("x-action-context-2".to_string(), b.to_string());
        headers.insert("x-action-context-1".to_string(), a.to_string());

        let ctx = ActionContext::from_headers(&headers, &DecryptConfig::default())
            .expect("decode")
            .expect("present");
        assert_eq!(ctx.secrets().unwrap()["api_key"], "shhh");
    }

    #[test]
    fn managed_params_route_by_kind() {
        let mut headers = HashMap::new();
        headers.insert(
            ACTION_CONTEXT_HEADER.to_string(),
            BASE64.encode(tree().to_string()),
        );
        let ctx = ActionContext::from_headers(&headers, &DecryptConfig::default())
            .expect("decode")
            .expect("present");

        let managed = r#"{"api_key":"secret","source":"data_source","request":"request"}"#;
        let request_headers: HashMap<String, String> =
            [("user-agent".to_string(), "test".to_string())].into();
        let values =
            ActionContext::managed_param_values(Some(&ctx), Some(managed), &request_headers);
        assert_eq!(values["api_key"], "shhh");
        assert_eq!(values["source"]["engine"], "sqlite");
        assert_eq!(values["request"]["headers"]["user-agent"], "test");
    }
}
