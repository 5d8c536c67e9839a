//! # MockGenerator
//!
//! Builds a batch of protocol records that exercises every ingestion path: valid records,
//! repeated protocol numbers, repeated (CPF, via) and (RG, via) pairs, and unsupported photos.
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use protocol_common::record::ProtocolRecord;

const MALE_NAMES: &[&str] = &[
    "Lucas", "Gabriel", "João", "Miguel", "Arthur", "Pedro", "Mateus", "Henrique", "Eduardo",
    "Gustavo",
];

const FEMALE_NAMES: &[&str] = &[
    "Maria", "Ana", "Isabela", "Fernanda", "Carolina", "Juliana", "Larissa", "Bruna", "Patrícia",
    "Gabriela",
];

const SURNAMES: &[&str] = &[
    "Silva",
    "Oliveira",
    "Santos",
    "Souza",
    "Pereira",
    "Costa",
    "Almeida",
    "Ferreira",
    "Rodrigues",
    "Lima",
];

pub const FIXED_TAX_IDS: [&str; 10] = [
    "12345678901",
    "98765432100",
    "45678912345",
    "65432109876",
    "56789023456",
    "78901234567",
    "89012345678",
    "90123456789",
    "01234567890",
    "23456789012",
];

pub const FIXED_NATIONAL_IDS: [&str; 10] = [
    "SP100001", "MG100002", "RJ100003", "ES100004", "DF100005", "BA100006", "SC100007", "GO100008",
    "PR100009", "CE100010",
];

const STATES: &[&str] = &[
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB", "PR",
    "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

const VALID_PHOTOS: &[&str] = &[
    "foto1.jpg",
    "foto2.jpg",
    "foto3.jpg",
    "foto4.jpg",
    "foto5.jpg",
    "foto6.png",
    "foto7.png",
    "foto8.png",
    "foto9.png",
    "foto10.png",
];

const INVALID_PHOTOS: &[&str] = &[
    "foto11.bmp",
    "foto12.bmp",
    "foto13.bmp",
    "foto14.bmp",
    "foto15.bmp",
];

/// Chance that a record meant to collide actually reuses an earlier CPF or RG.
const DUPLICATE_PROBABILITY: f64 = 0.3;

/// The protocol number every record of the duplicate-number group repeats.
pub const DUPLICATED_PROTOCOL_NUMBER: &str = "00001";

struct Names {
    full: String,
    mother: String,
    father: String,
}

pub struct MockGenerator {
    rng: StdRng,
    photo_base_path: PathBuf,
    generated_tax_ids: Vec<String>,
    generated_national_ids: Vec<String>,
}

impl MockGenerator {
    pub fn new(photo_base_path: impl Into<PathBuf>) -> Self {
        Self::with_rng(photo_base_path.into(), StdRng::from_entropy())
    }

    /// A generator that produces the same batches for the same `seed`.
    pub fn seeded(photo_base_path: impl Into<PathBuf>, seed: u64) -> Self {
        Self::with_rng(photo_base_path.into(), StdRng::seed_from_u64(seed))
    }

    fn with_rng(photo_base_path: PathBuf, rng: StdRng) -> Self {
        Self {
            rng,
            photo_base_path,
            generated_tax_ids: FIXED_TAX_IDS.iter().map(|id| id.to_string()).collect(),
            generated_national_ids: FIXED_NATIONAL_IDS.iter().map(|id| id.to_string()).collect(),
        }
    }

    /// Generate the full mock batch, 126 records, in publication order.
    pub fn generate_batch(&mut self) -> Vec<ProtocolRecord> {
        let mut records = Vec::with_capacity(126);

        // Fixed CPF and RG, each in vias 1, 2 and 3.
        for (i, (tax_id, national_id)) in (1..=10).zip(FIXED_TAX_IDS.iter().zip(FIXED_NATIONAL_IDS))
        {
            let names = self.names();
            let photo = self.valid_photo(i);

            for (copy_number, number) in [(1, i), (2, 105 + i), (3, 115 + i)] {
                records.push(ProtocolRecord {
                    protocol_number: protocol_number(number),
                    copy_number,
                    tax_id: tax_id.to_string(),
                    national_id: national_id.to_string(),
                    full_name: names.full.clone(),
                    mother_name: names.mother.clone(),
                    father_name: names.father.clone(),
                    photo_ref: photo.clone(),
                });
            }
        }

        for i in 11..=90 {
            let tax_id = self.tax_id(false);
            let national_id = self.national_id(i, false);
            let photo = self.valid_photo(i);
            records.push(self.record(protocol_number(i), 1, tax_id, national_id, photo));
        }

        for i in 91..=95 {
            let tax_id = self.tax_id(false);
            let national_id = self.national_id(i, false);
            let photo = self.valid_photo(i);
            records.push(self.record(
                DUPLICATED_PROTOCOL_NUMBER.to_owned(),
                1,
                tax_id,
                national_id,
                photo,
            ));
        }

        for i in 96..=98 {
            let tax_id = self.tax_id(true);
            let national_id = self.national_id(i, false);
            let photo = self.valid_photo(i);
            records.push(self.record(protocol_number(i), 1, tax_id, national_id, photo));
        }

        for i in 99..=103 {
            let tax_id = self.tax_id(false);
            let national_id = self.national_id(i, false);
            let photo = self.invalid_photo(i);
            let copy_number = (i % 5) + 1;
            records.push(self.record(protocol_number(i), copy_number, tax_id, national_id, photo));
        }

        // Numbered after the via 3 group so only the RG can collide.
        for i in 126..=128 {
            let tax_id = self.tax_id(false);
            let national_id = self.national_id(i, true);
            let photo = self.valid_photo(i);
            records.push(self.record(protocol_number(i), 1, tax_id, national_id, photo));
        }

        records
    }

    fn record(
        &mut self,
        protocol_number: String,
        copy_number: i32,
        tax_id: String,
        national_id: String,
        photo_ref: String,
    ) -> ProtocolRecord {
        let names = self.names();

        ProtocolRecord {
            protocol_number,
            copy_number,
            tax_id,
            national_id,
            full_name: names.full,
            mother_name: names.mother,
            father_name: names.father,
            photo_ref,
        }
    }

    /// The child takes a male first name, the father's surname and the mother's surname.
    fn names(&mut self) -> Names {
        let father_surname = self.pick(SURNAMES);
        let father = format!("{} {}", self.pick(MALE_NAMES), father_surname);
        let mother_surname = self.pick(SURNAMES);
        let mother = format!("{} {}", self.pick(FEMALE_NAMES), mother_surname);
        let full = format!(
            "{} {} {}",
            self.pick(MALE_NAMES),
            father_surname,
            mother_surname
        );

        Names {
            full,
            mother,
            father,
        }
    }

    /// An 11 digit CPF. With `allow_duplicate`, sometimes one generated earlier.
    fn tax_id(&mut self, allow_duplicate: bool) -> String {
        if allow_duplicate && self.rng.gen_bool(DUPLICATE_PROBABILITY) {
            let index = self.rng.gen_range(0..self.generated_tax_ids.len());
            return self.generated_tax_ids[index].clone();
        }

        let tax_id = format!(
            "{}{}",
            self.rng.gen_range(100_000_000..999_999_999),
            self.rng.gen_range(10..99)
        );
        self.generated_tax_ids.push(tax_id.clone());

        tax_id
    }

    /// A state code followed by `100000 + index`. With `allow_duplicate`, sometimes one
    /// generated earlier.
    fn national_id(&mut self, index: i32, allow_duplicate: bool) -> String {
        if allow_duplicate && self.rng.gen_bool(DUPLICATE_PROBABILITY) {
            let index = self.rng.gen_range(0..self.generated_national_ids.len());
            return self.generated_national_ids[index].clone();
        }

        let national_id = format!("{}{}", self.pick(STATES), 100_000 + index);
        self.generated_national_ids.push(national_id.clone());

        national_id
    }

    fn valid_photo(&self, index: i32) -> String {
        self.photo(VALID_PHOTOS, index)
    }

    fn invalid_photo(&self, index: i32) -> String {
        self.photo(INVALID_PHOTOS, index)
    }

    fn photo(&self, photos: &[&str], index: i32) -> String {
        let name = photos[index.unsigned_abs() as usize % photos.len()];
        self.photo_base_path.join(name).to_string_lossy().into_owned()
    }

    fn pick(&mut self, values: &[&'static str]) -> &'static str {
        values[self.rng.gen_range(0..values.len())]
    }
}

fn protocol_number(number: i32) -> String {
    format!("{:05}", number)
}
