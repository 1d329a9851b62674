//! Deterministic offline source producing daily OHLCV-style bars.
//!
//! Every value for `(seed, entity, date)` is derived from its own BLAKE3
//! sub-seed, so a row does not depend on the range it was requested in:
//! fetching a month and fetching each of its days yields identical rows.

use super::{FetchError, Fetcher, WorkUnit};
use crate::record::{FieldKind, FieldSpec, FieldValue, Record, RecordSchema, Table};
use chrono::{Datelike, NaiveDate, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Entities that exist but have no rows (e.g. not yet listed).
    #[serde(default)]
    pub empty_entities: Vec<String>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            empty_entities: Vec::new(),
        }
    }
}

pub struct SyntheticFetcher {
    config: SyntheticConfig,
    schema: RecordSchema,
}

impl SyntheticFetcher {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            schema: Self::schema(),
        }
    }

    /// The fields every synthetic row carries.
    pub fn schema() -> RecordSchema {
        RecordSchema {
            fields: vec![
                FieldSpec::new("open", FieldKind::Float).required(),
                FieldSpec::new("high", FieldKind::Float).required(),
                FieldSpec::new("low", FieldKind::Float).required(),
                FieldSpec::new("close", FieldKind::Float).required(),
                FieldSpec::new("vol", FieldKind::Int),
                FieldSpec::new("amount", FieldKind::Float),
            ],
        }
    }

    fn sub_seed(&self, entity_id: &str, salt: &[u8]) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.config.seed.to_le_bytes());
        hasher.update(entity_id.as_bytes());
        hasher.update(salt);
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    fn bar(&self, entity_id: &str, base: f64, date: NaiveDate) -> Record {
        let day = date.format("%Y%m%d").to_string();
        let mut rng = StdRng::seed_from_u64(self.sub_seed(entity_id, day.as_bytes()));

        // Slow drift keyed on the day number keeps consecutive closes close.
        let drift = (date.num_days_from_ce() as f64 / 90.0).sin() * 0.15;
        let close = base * (1.0 + drift + rng.gen_range(-0.02..0.02));
        let open = close * (1.0 + rng.gen_range(-0.01..0.01));
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
        let vol: i64 = rng.gen_range(1_000..100_000);
        let vwap = (high + low + close) / 3.0;

        let revision = date
            .and_hms_opt(18, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_default();

        Record::new(entity_id, day, revision)
            .with("open", FieldValue::Float(round2(open)))
            .with("high", FieldValue::Float(round2(high)))
            .with("low", FieldValue::Float(round2(low)))
            .with("close", FieldValue::Float(round2(close)))
            .with("vol", FieldValue::Int(vol))
            .with("amount", FieldValue::Float(round2(vol as f64 * vwap)))
    }
}

impl Fetcher for SyntheticFetcher {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch(&self, unit: &WorkUnit) -> Result<Table, FetchError> {
        let mut table = Table::new(self.schema.clone());
        if self.config.empty_entities.contains(&unit.entity_id) {
            return Ok(table);
        }

        let mut rng = StdRng::seed_from_u64(self.sub_seed(&unit.entity_id, b"base"));
        let base: f64 = rng.gen_range(5.0..200.0);

        for date in unit.range.days() {
            if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                continue;
            }
            table.push(self.bar(&unit.entity_id, base, date));
        }
        Ok(table)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
