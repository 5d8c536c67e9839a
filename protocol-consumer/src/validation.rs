//! Ingestion rules for protocol records.
//!
//! Rules run in a fixed order and the first failing one is the only one reported.
use std::fmt;

use protocol_common::record::ProtocolRecord;
use protocol_common::store::{StoreResult, StoreTransaction, UniqueKey};

const ACCEPTED_PHOTO_EXTENSIONS: [&str; 2] = [".jpg", ".png"];

/// The first rule a record failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingProtocolNumber,
    DuplicateProtocolNumber { protocol_number: String },
    InvalidCopyNumber { copy_number: i32 },
    MissingTaxId,
    DuplicateTaxIdCopy { tax_id: String, copy_number: i32 },
    MissingNationalId,
    DuplicateNationalIdCopy { national_id: String, copy_number: i32 },
    MissingFullName,
    MissingMotherName,
    MissingFatherName,
    UnsupportedPhoto { photo_ref: String },
}

impl Rejection {
    /// Short rule name, used as a metrics label.
    pub fn rule(&self) -> &'static str {
        match self {
            Rejection::MissingProtocolNumber => "missing_protocol_number",
            Rejection::DuplicateProtocolNumber { .. } => "duplicate_protocol_number",
            Rejection::InvalidCopyNumber { .. } => "invalid_copy_number",
            Rejection::MissingTaxId => "missing_tax_id",
            Rejection::DuplicateTaxIdCopy { .. } => "duplicate_tax_id_copy",
            Rejection::MissingNationalId => "missing_national_id",
            Rejection::DuplicateNationalIdCopy { .. } => "duplicate_national_id_copy",
            Rejection::MissingFullName => "missing_full_name",
            Rejection::MissingMotherName => "missing_mother_name",
            Rejection::MissingFatherName => "missing_father_name",
            Rejection::UnsupportedPhoto { .. } => "unsupported_photo",
        }
    }

    /// The rejection matching a unique constraint the store refused `record` for.
    pub fn from_violation(key: UniqueKey, record: &ProtocolRecord) -> Self {
        match key {
            UniqueKey::ProtocolNumber => Rejection::DuplicateProtocolNumber {
                protocol_number: record.protocol_number.clone(),
            },
            UniqueKey::TaxIdAndCopy => Rejection::DuplicateTaxIdCopy {
                tax_id: record.tax_id.clone(),
                copy_number: record.copy_number,
            },
            UniqueKey::NationalIdAndCopy => Rejection::DuplicateNationalIdCopy {
                national_id: record.national_id.clone(),
                copy_number: record.copy_number,
            },
        }
    }
}

/// Written to the error log as the rejection reason.
impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingProtocolNumber => write!(f, "protocol number is required"),
            Rejection::DuplicateProtocolNumber { protocol_number } => {
                write!(f, "protocol number already exists: {}", protocol_number)
            }
            Rejection::InvalidCopyNumber { copy_number } => write!(
                f,
                "copy number is required and must be greater than zero: {}",
                copy_number
            ),
            Rejection::MissingTaxId => write!(f, "CPF is required"),
            Rejection::DuplicateTaxIdCopy {
                tax_id,
                copy_number,
            } => write!(
                f,
                "a copy with the same number already exists for CPF {} and copy {}",
                tax_id, copy_number
            ),
            Rejection::MissingNationalId => write!(f, "RG is required"),
            Rejection::DuplicateNationalIdCopy {
                national_id,
                copy_number,
            } => write!(
                f,
                "a copy with the same number already exists for RG {} and copy {}",
                national_id, copy_number
            ),
            Rejection::MissingFullName => write!(f, "name is required"),
            Rejection::MissingMotherName => write!(f, "mother's name is required"),
            Rejection::MissingFatherName => write!(f, "father's name is required"),
            Rejection::UnsupportedPhoto { photo_ref } => write!(
                f,
                "photo is required and must be a jpg or png file: {}",
                photo_ref
            ),
        }
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Whether `photo_ref` names a .jpg or .png file, ignoring case.
pub fn has_accepted_photo_extension(photo_ref: &str) -> bool {
    let photo_ref = photo_ref.to_lowercase();

    ACCEPTED_PHOTO_EXTENSIONS
        .iter()
        .any(|extension| photo_ref.ends_with(extension))
}

/// Check `record` against every ingestion rule, reading existing records through `tx`.
/// Returns the first rule the record fails, or `None` if it can be inserted.
pub async fn validate(
    record: &ProtocolRecord,
    tx: &mut dyn StoreTransaction,
) -> StoreResult<Option<Rejection>> {
    if is_blank(&record.protocol_number) {
        return Ok(Some(Rejection::MissingProtocolNumber));
    }
    if tx.exists_by_protocol_number(&record.protocol_number).await? {
        return Ok(Some(Rejection::DuplicateProtocolNumber {
            protocol_number: record.protocol_number.clone(),
        }));
    }

    if record.copy_number <= 0 {
        return Ok(Some(Rejection::InvalidCopyNumber {
            copy_number: record.copy_number,
        }));
    }

    if is_blank(&record.tax_id) {
        return Ok(Some(Rejection::MissingTaxId));
    }
    if tx
        .exists_by_tax_id_and_copy(&record.tax_id, record.copy_number)
        .await?
    {
        return Ok(Some(Rejection::DuplicateTaxIdCopy {
            tax_id: record.tax_id.clone(),
            copy_number: record.copy_number,
        }));
    }

    if is_blank(&record.national_id) {
        return Ok(Some(Rejection::MissingNationalId));
    }
    if tx
        .exists_by_national_id_and_copy(&record.national_id, record.copy_number)
        .await?
    {
        return Ok(Some(Rejection::DuplicateNationalIdCopy {
            national_id: record.national_id.clone(),
            copy_number: record.copy_number,
        }));
    }

    if is_blank(&record.full_name) {
        return Ok(Some(Rejection::MissingFullName));
    }
    if is_blank(&record.mother_name) {
        return Ok(Some(Rejection::MissingMotherName));
    }
    if is_blank(&record.father_name) {
        return Ok(Some(Rejection::MissingFatherName));
    }

    if !has_accepted_photo_extension(&record.photo_ref) {
        return Ok(Some(Rejection::UnsupportedPhoto {
            photo_ref: record.photo_ref.clone(),
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use protocol_common::store::{MemoryStore, RecordStore};

    use super::*;

    fn record() -> ProtocolRecord {
        ProtocolRecord {
            protocol_number: "00042".to_owned(),
            copy_number: 1,
            tax_id: "45678912345".to_owned(),
            national_id: "RJ100003".to_owned(),
            full_name: "Miguel Costa Lima".to_owned(),
            mother_name: "Bruna Lima".to_owned(),
            father_name: "Pedro Costa".to_owned(),
            photo_ref: "wwwroot/fotos/foto3.jpg".to_owned(),
        }
    }

    async fn store_with(existing: ProtocolRecord) -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&existing).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    async fn rejection(store: &MemoryStore, candidate: &ProtocolRecord) -> Option<Rejection> {
        let mut tx = store.begin().await.unwrap();
        validate(candidate, tx.as_mut()).await.unwrap()
    }

    #[test]
    fn test_photo_extensions() {
        assert!(has_accepted_photo_extension("foto1.jpg"));
        assert!(has_accepted_photo_extension("wwwroot/fotos/foto6.PNG"));
        assert!(has_accepted_photo_extension("Foto.Jpg"));
        assert!(!has_accepted_photo_extension("foto11.bmp"));
        assert!(!has_accepted_photo_extension("foto.webp"));
        assert!(!has_accepted_photo_extension("foto.jpeg"));
        assert!(!has_accepted_photo_extension("foto.jpg "));
        assert!(!has_accepted_photo_extension("foto.png\n"));
        assert!(!has_accepted_photo_extension("jpg"));
        assert!(!has_accepted_photo_extension(""));
    }

    #[tokio::test]
    async fn test_valid_record_passes() {
        let store = MemoryStore::new();
        assert_eq!(rejection(&store, &record()).await, None);
    }

    #[tokio::test]
    async fn test_required_fields() {
        let store = MemoryStore::new();
        let cases: [(fn(&mut ProtocolRecord), Rejection); 8] = [
            (|r| r.protocol_number = " ".to_owned(), Rejection::MissingProtocolNumber),
            (|r| r.tax_id = String::new(), Rejection::MissingTaxId),
            (|r| r.national_id = "\t".to_owned(), Rejection::MissingNationalId),
            (|r| r.full_name = String::new(), Rejection::MissingFullName),
            (|r| r.mother_name = String::new(), Rejection::MissingMotherName),
            (|r| r.father_name = String::new(), Rejection::MissingFatherName),
            (
                |r| r.copy_number = 0,
                Rejection::InvalidCopyNumber { copy_number: 0 },
            ),
            (
                |r| r.photo_ref = "foto11.bmp".to_owned(),
                Rejection::UnsupportedPhoto {
                    photo_ref: "foto11.bmp".to_owned(),
                },
            ),
        ];

        for (mutate, expected) in cases {
            let mut candidate = record();
            mutate(&mut candidate);
            assert_eq!(rejection(&store, &candidate).await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_uniqueness_rules() {
        let store = store_with(record()).await;

        let mut same_number = record();
        same_number.copy_number = 2;
        same_number.tax_id = "98765432100".to_owned();
        same_number.national_id = "MG100002".to_owned();
        assert_eq!(
            rejection(&store, &same_number).await,
            Some(Rejection::DuplicateProtocolNumber {
                protocol_number: "00042".to_owned()
            })
        );

        let mut same_tax_id = record();
        same_tax_id.protocol_number = "00043".to_owned();
        same_tax_id.national_id = "MG100002".to_owned();
        assert_eq!(
            rejection(&store, &same_tax_id).await,
            Some(Rejection::DuplicateTaxIdCopy {
                tax_id: "45678912345".to_owned(),
                copy_number: 1
            })
        );

        let mut same_national_id = record();
        same_national_id.protocol_number = "00044".to_owned();
        same_national_id.tax_id = "98765432100".to_owned();
        assert_eq!(
            rejection(&store, &same_national_id).await,
            Some(Rejection::DuplicateNationalIdCopy {
                national_id: "RJ100003".to_owned(),
                copy_number: 1
            })
        );

        let mut next_copy = record();
        next_copy.protocol_number = "00045".to_owned();
        next_copy.copy_number = 2;
        assert_eq!(rejection(&store, &next_copy).await, None);
    }

    #[tokio::test]
    async fn test_first_failing_rule_wins() {
        let store = store_with(record()).await;

        let mut candidate = record();
        candidate.photo_ref = "foto12.bmp".to_owned();
        candidate.full_name = String::new();
        assert!(matches!(
            rejection(&store, &candidate).await,
            Some(Rejection::DuplicateProtocolNumber { .. })
        ));

        candidate.protocol_number = "00050".to_owned();
        candidate.copy_number = -1;
        assert!(matches!(
            rejection(&store, &candidate).await,
            Some(Rejection::InvalidCopyNumber { copy_number: -1 })
        ));
    }

    #[test]
    fn test_reasons_name_the_offending_value() {
        let rejection = Rejection::from_violation(UniqueKey::TaxIdAndCopy, &record());
        assert_eq!(rejection.rule(), "duplicate_tax_id_copy");
        assert_eq!(
            rejection.to_string(),
            "a copy with the same number already exists for CPF 45678912345 and copy 1"
        );
    }
}
