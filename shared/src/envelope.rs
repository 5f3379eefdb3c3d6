//! Pub/sub envelope handling.
//!
//! Messages may arrive either as the raw payload or wrapped by a fan-out
//! topic as `{"Message": "<inner JSON string>"}`.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::CheckoutError;

#[derive(Debug, Deserialize)]
struct Wrapped {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Envelope<'a> {
    Wrapped(String),
    Raw(&'a str),
}

impl<'a> Envelope<'a> {
    pub fn detect(payload: &'a str) -> Self {
        match serde_json::from_str::<Wrapped>(payload) {
            Ok(wrapped) => Envelope::Wrapped(wrapped.message),
            Err(_) => Envelope::Raw(payload),
        }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, CheckoutError> {
        let parsed = match &self {
            Envelope::Wrapped(inner) => serde_json::from_str(inner),
            Envelope::Raw(raw) => serde_json::from_str(raw),
        };
        parsed.map_err(|e| CheckoutError::Validation(format!("malformed payload: {}", e)))
    }
}

pub fn parse_message<T: DeserializeOwned>(payload: &str) -> Result<T, CheckoutError> {
    Envelope::detect(payload).decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PaymentRequest;

    const RAW: &str = r#"{"order_id":"0b7e2c1a-5d43-4a0e-8d8e-6f2f7e0b9a01","user_id":"0b7e2c1a-5d43-4a0e-8d8e-6f2f7e0b9a02","amount":500}"#;

    #[test]
    fn raw_payload_is_parsed_directly() {
        assert_eq!(Envelope::detect(RAW), Envelope::Raw(RAW));
        let request: PaymentRequest = parse_message(RAW).unwrap();
        assert_eq!(request.amount, 500);
        assert_eq!(request.currency, "usd");
    }

    #[test]
    fn wrapped_payload_is_unwrapped_first() {
        let wrapped = serde_json::json!({
            "Type": "Notification",
            "MessageId": "abc",
            "Message": RAW,
        })
        .to_string();
        assert!(matches!(Envelope::detect(&wrapped), Envelope::Wrapped(_)));
        let request: PaymentRequest = parse_message(&wrapped).unwrap();
        assert_eq!(request.amount, 500);
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let err = parse_message::<PaymentRequest>("{not json").unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));

        let wrapped_garbage = r#"{"Message":"[1,2,3]"}"#;
        let err = parse_message::<PaymentRequest>(wrapped_garbage).unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));
    }
}
