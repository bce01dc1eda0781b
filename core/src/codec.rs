use serde_json::Value;

/// Interface to the external schema runtime.
///
/// The validator owns a schema registry keyed by schema id (see
/// [ServiceMap](crate::ServiceMap) for how ids are derived from service
/// names). Implementations are immutable; if internal state must change,
/// use inner mutability.
pub trait Validator: Send + Sync + 'static {
    /// Serialize `body` against the named schema into payload bytes.
    fn encode_body(&self, body: &Value, schema_id: &str) -> Result<Vec<u8>, String>;

    /// Parse payload bytes against the named schema.
    fn decode_body(&self, buf: &[u8], schema_id: &str) -> Result<Value, String>;

    /// Check `body` against the named schema without re-encoding.
    fn validate(&self, body: &Value, schema_id: &str) -> Result<(), String>;
}

/// Schema-less passthrough validator.
///
/// Payload bytes are plain JSON and every body validates. Useful for tests
/// and deployments that rely on a text wire format only.
#[derive(Default)]
pub struct JsonValidator();

impl Validator for JsonValidator {
    #[inline]
    fn encode_body(&self, body: &Value, _schema_id: &str) -> Result<Vec<u8>, String> {
        serde_json::to_vec(body).map_err(|e| e.to_string())
    }

    #[inline]
    fn decode_body(&self, buf: &[u8], _schema_id: &str) -> Result<Value, String> {
        serde_json::from_slice(buf).map_err(|e| e.to_string())
    }

    #[inline]
    fn validate(&self, _body: &Value, _schema_id: &str) -> Result<(), String> {
        Ok(())
    }
}
