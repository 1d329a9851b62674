//! Calendar rule: period keys and date fields must parse, and (optionally)
//! daily periods must fall on trading days.

use super::{RuleKind, Severity, ValidationError, ValidationRule};
use crate::record::{FieldKind, Table};
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

fn default_date_format() -> String {
    "%Y%m%d".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// `chrono` format used for `period_key` and for `date` fields.
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Parse `period_key` as a date. Turn off for non-daily keys like `2020Q1`.
    #[serde(default = "default_true")]
    pub check_period_key: bool,
    /// Flag periods on weekends and holidays.
    #[serde(default)]
    pub check_trading_days: bool,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            date_format: default_date_format(),
            check_period_key: true,
            check_trading_days: false,
            holidays: Vec::new(),
        }
    }
}

/// Weekdays minus a fixed holiday list.
#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }
}

pub struct CalendarRule {
    config: CalendarConfig,
    calendar: TradingCalendar,
}

impl CalendarRule {
    pub fn new(config: CalendarConfig) -> Self {
        let calendar = TradingCalendar::new(config.holidays.iter().copied());
        Self { config, calendar }
    }

    fn parse(&self, text: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(text, &self.config.date_format).ok()
    }
}

impl ValidationRule for CalendarRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Calendar
    }

    fn check(&self, table: &Table) -> Vec<ValidationError> {
        let date_fields: Vec<&str> = table
            .schema
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Date)
            .map(|f| f.name.as_str())
            .collect();

        let mut findings = Vec::new();
        for record in &table.records {
            if self.config.check_period_key {
                match self.parse(&record.period_key) {
                    None => findings.push(
                        ValidationError::new(
                            RuleKind::Calendar,
                            Severity::Error,
                            format!(
                                "period key '{}' does not match {}",
                                record.period_key, self.config.date_format
                            ),
                        )
                        .for_key(record.key())
                        .with_context("format", &self.config.date_format),
                    ),
                    Some(date) if self.config.check_trading_days && !self.calendar.is_trading_day(date) => {
                        findings.push(
                            ValidationError::new(
                                RuleKind::Calendar,
                                Severity::Warning,
                                format!("{date} ({}) is not a trading day", date.weekday()),
                            )
                            .for_key(record.key()),
                        )
                    }
                    Some(_) => {}
                }
            }

            for field in &date_fields {
                let Some(text) = record.text(field) else {
                    continue;
                };
                if self.parse(text).is_none() {
                    findings.push(
                        ValidationError::new(
                            RuleKind::Calendar,
                            Severity::Error,
                            format!("{field} = '{text}' does not match {}", self.config.date_format),
                        )
                        .for_key(record.key())
                        .with_context("field", field)
                        .with_context("format", &self.config.date_format),
                    );
                }
            }
        }

        findings
    }
}
