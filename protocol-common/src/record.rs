//! # ProtocolRecord
//!
//! The identity-enrollment document carried over the queue and stored in `Protocolos`.
//! Property and column names keep the casing the producers already use on the wire.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Absent and `null` properties decode to the default value, so the ingestion rules can
/// reject them as missing instead of the whole payload being unreadable.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A protocol record as published, delivered and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProtocolRecord {
    /// External identifier, e.g. "00001". Unique across the store.
    #[serde(rename = "NumeroProtocolo", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "NumeroProtocolo")]
    pub protocol_number: String,
    /// Which physical copy ("via") of the document this record is. Starts at 1.
    #[serde(rename = "NumeroVia", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "NumeroVia")]
    pub copy_number: i32,
    /// CPF. Unique together with `copy_number`.
    #[serde(rename = "Cpf", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "Cpf")]
    pub tax_id: String,
    /// RG. Unique together with `copy_number`.
    #[serde(rename = "Rg", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "Rg")]
    pub national_id: String,
    #[serde(rename = "Nome", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "Nome")]
    pub full_name: String,
    #[serde(rename = "NomeMae", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "NomeMae")]
    pub mother_name: String,
    #[serde(rename = "NomePai", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "NomePai")]
    pub father_name: String,
    /// Path or name of the photo file, must be a .jpg or .png.
    #[serde(rename = "Foto", default, deserialize_with = "null_as_default")]
    #[sqlx(rename = "Foto")]
    pub photo_ref: String,
}

impl ProtocolRecord {
    /// Encode as the UTF-8 JSON payload published on the queue.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a payload received from the queue.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A persisted record with its surrogate id, as returned by read queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StoredRecord {
    #[serde(rename = "Id")]
    #[sqlx(rename = "Id")]
    pub id: i32,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub record: ProtocolRecord,
}

/// An append-only entry in `LogErros`, written whenever a record is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ErrorLogEntry {
    #[serde(rename = "NumeroProtocolo")]
    #[sqlx(rename = "NumeroProtocolo")]
    pub protocol_number: String,
    #[serde(rename = "MotivoErro")]
    #[sqlx(rename = "MotivoErro")]
    pub reason: String,
    #[serde(rename = "DataHora")]
    #[sqlx(rename = "DataHora")]
    pub logged_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(protocol_number: &str, reason: impl Into<String>) -> Self {
        Self {
            protocol_number: protocol_number.to_owned(),
            reason: reason.into(),
            logged_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProtocolRecord {
        ProtocolRecord {
            protocol_number: "00001".to_owned(),
            copy_number: 1,
            tax_id: "12345678901".to_owned(),
            national_id: "SP100001".to_owned(),
            full_name: "Lucas Silva Costa".to_owned(),
            mother_name: "Maria Costa".to_owned(),
            father_name: "Pedro Silva".to_owned(),
            photo_ref: "foto1.jpg".to_owned(),
        }
    }

    #[test]
    fn test_payload_uses_wire_property_names() {
        let payload = record().to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["NumeroProtocolo"], "00001");
        assert_eq!(value["NumeroVia"], 1);
        assert_eq!(value["Cpf"], "12345678901");
        assert_eq!(value["Rg"], "SP100001");
        assert_eq!(value["Nome"], "Lucas Silva Costa");
        assert_eq!(value["NomeMae"], "Maria Costa");
        assert_eq!(value["NomePai"], "Pedro Silva");
        assert_eq!(value["Foto"], "foto1.jpg");
        assert_eq!(value.as_object().unwrap().len(), 8);
    }

    #[test]
    fn test_payload_round_trip_preserves_every_field() {
        let original = record();
        let decoded = ProtocolRecord::from_payload(&original.to_payload().unwrap()).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decoding_ignores_property_order() {
        let payload = br#"{"Foto":"a.png","NomePai":"P","NomeMae":"M","Nome":"N","Rg":"RJ1","Cpf":"1","NumeroVia":2,"NumeroProtocolo":"00002"}"#;
        let decoded = ProtocolRecord::from_payload(payload).unwrap();

        assert_eq!(decoded.protocol_number, "00002");
        assert_eq!(decoded.copy_number, 2);
        assert_eq!(decoded.photo_ref, "a.png");
    }

    #[test]
    fn test_missing_and_null_properties_decode_as_empty() {
        let decoded = ProtocolRecord::from_payload(
            br#"{"NumeroProtocolo":"00007","NumeroVia":null,"Cpf":null,"Rg":"SP100007"}"#,
        )
        .unwrap();

        assert_eq!(decoded.protocol_number, "00007");
        assert_eq!(decoded.copy_number, 0);
        assert_eq!(decoded.tax_id, "");
        assert_eq!(decoded.national_id, "SP100007");
        assert_eq!(decoded.full_name, "");
        assert_eq!(decoded.photo_ref, "");
    }

    #[test]
    fn test_decoding_rejects_malformed_payloads() {
        assert!(ProtocolRecord::from_payload(b"not json").is_err());
        assert!(ProtocolRecord::from_payload(b"").is_err());
        assert!(ProtocolRecord::from_payload(br#""00001""#).is_err());
        assert!(ProtocolRecord::from_payload(br#"{"NumeroProtocolo":1}"#).is_err());
        assert!(ProtocolRecord::from_payload(
            br#"{"NumeroProtocolo":"1","NumeroVia":"one","Cpf":"","Rg":"","Nome":"","NomeMae":"","NomePai":"","Foto":""}"#
        )
        .is_err());
    }
}
