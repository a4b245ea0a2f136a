//! Cache key codec.
//!
//! Keys have the shape `data_type:endpoint:p1=v1&p2=v2`. Parameters equal
//! to their declared default are dropped, names are sorted, values are
//! rendered canonically (so `20` and `"20"` agree) and the parameter part
//! is replaced by a digest once it grows past the configured length.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Request parameters as handed over by a route handler.
pub type Params = HashMap<String, Value>;

/// Hex characters kept from the parameter digest.
const DIGEST_HEX_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{field} contains reserved character {ch:?}")]
    ReservedChar { field: String, ch: char },

    #[error("parameter {0} is not a scalar value")]
    NonScalar(String),
}

/// A derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic key derivation.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    /// `data_type:endpoint` -> parameter -> canonical default value
    defaults: HashMap<String, HashMap<String, String>>,
    max_param_len: usize,
}

impl KeyCodec {
    /// `defaults` declares, per `data_type:endpoint` route, the parameter
    /// values that are equivalent to leaving the parameter out.
    pub fn new(
        defaults: &HashMap<String, BTreeMap<String, Value>>,
        max_param_len: usize,
    ) -> Self {
        let defaults = defaults
            .iter()
            .map(|(route, params)| {
                let canon = params
                    .iter()
                    .filter_map(|(name, value)| {
                        canonical_value(value).ok().flatten().map(|v| (name.clone(), v))
                    })
                    .collect();
                (route.clone(), canon)
            })
            .collect();
        Self {
            defaults,
            max_param_len,
        }
    }

    pub fn encode(
        &self,
        data_type: &str,
        endpoint: &str,
        params: &Params,
    ) -> Result<CacheKey, KeyError> {
        check_segment("data_type", data_type)?;
        check_segment("endpoint", endpoint)?;

        let defaults = self.defaults.get(&format!("{data_type}:{endpoint}"));
        let mut pairs = Vec::with_capacity(params.len());
        for (name, value) in params {
            if name.is_empty() {
                return Err(KeyError::Empty("parameter name"));
            }
            if let Some(ch) = name.chars().find(|c| matches!(c, '=' | '&' | ':')) {
                return Err(KeyError::ReservedChar {
                    field: name.clone(),
                    ch,
                });
            }
            let Some(canon) =
                canonical_value(value).map_err(|_| KeyError::NonScalar(name.clone()))?
            else {
                continue;
            };
            let is_default = defaults
                .and_then(|d| d.get(name))
                .is_some_and(|default| *default == canon);
            if !is_default {
                pairs.push((name.as_str(), canon));
            }
        }
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let joined = pairs
            .iter()
            .map(|(name, value)| format!("{name}={}", escape_value(value)))
            .collect::<Vec<_>>()
            .join("&");

        let key = if joined.is_empty() {
            format!("{data_type}:{endpoint}")
        } else if joined.len() > self.max_param_len {
            format!("{data_type}:{endpoint}:#{}", digest(&joined))
        } else {
            format!("{data_type}:{endpoint}:{joined}")
        };
        Ok(CacheKey(key))
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(&HashMap::new(), 128)
    }
}

fn check_segment(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty(field));
    }
    if let Some(ch) = value.chars().find(|c| *c == ':' || c.is_whitespace()) {
        return Err(KeyError::ReservedChar {
            field: field.to_string(),
            ch,
        });
    }
    Ok(())
}

/// Canonical string form of a scalar. `Ok(None)` means "unset".
fn canonical_value(value: &Value) -> Result<Option<String>, ()> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(()),
    }
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(ch),
        }
    }
    out
}

fn digest(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    let mut hex = hex::encode(hash);
    hex.truncate(DIGEST_HEX_LEN);
    hex
}
