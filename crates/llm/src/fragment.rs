use serde_json::{Map, Value};

/// Reason attached when a generator's channel closes without a terminal marker.
pub const UNTERMINATED_STREAM_REASON: &str = "generator ended before a terminal marker";

/// One element of a generation sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Done,
    Error(String),
}

impl Fragment {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

/// Caller-supplied prompt-shaping parameters, passed through opaquely.
///
/// Generators pick out the keys they understand and ignore the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams(Map<String, Value>);

impl GenerationParams {
    pub fn new(raw: Map<String, Value>) -> Self {
        Self(raw)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.get("temperature").and_then(Value::as_f64)
    }

    pub fn max_tokens(&self) -> Option<u64> {
        self.get("max_tokens")
            .or_else(|| self.get("maxTokens"))
            .and_then(Value::as_u64)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Option<Map<String, Value>>> for GenerationParams {
    fn from(raw: Option<Map<String, Value>>) -> Self {
        Self(raw.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_known_keys_and_keeps_the_rest() {
        let raw = json!({"temperature": 0.3, "maxTokens": 128, "top_k": 4});
        let params = GenerationParams::new(raw.as_object().cloned().unwrap());

        assert_eq!(params.temperature(), Some(0.3));
        assert_eq!(params.max_tokens(), Some(128));
        assert_eq!(params.get("top_k"), Some(&json!(4)));
        assert!(GenerationParams::from(None).temperature().is_none());
    }
}
