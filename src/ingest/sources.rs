//! Source rows and their text renderings.
//!
//! Lab observations follow the Synthea `observations` export columns; image
//! labels follow the NIH chest X-ray `Data_Entry` columns. Both arrive as
//! JSONL, one object per line.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::BufRead;

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedInput;

/// One Synthea lab observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    /// Patient identifier.
    #[serde(rename = "PATIENT", alias = "patient")]
    pub patient: String,
    /// LOINC code.
    #[serde(rename = "CODE", alias = "code", default, deserialize_with = "lenient_string")]
    pub code: String,
    /// Observation name, e.g. "Glucose".
    #[serde(rename = "DESCRIPTION", alias = "description")]
    pub description: String,
    /// Observed value; numbers and strings are both accepted.
    #[serde(rename = "VALUE", alias = "value", default, deserialize_with = "lenient_string")]
    pub value: String,
    /// Units, e.g. "mg/dL".
    #[serde(rename = "UNITS", alias = "units", default, deserialize_with = "lenient_string")]
    pub units: String,
    /// Observation timestamp as exported.
    #[serde(rename = "DATE", alias = "date", default, deserialize_with = "lenient_string")]
    pub date: String,
}

impl ObservationRow {
    /// `Observation: {description} value: {value} {units} on date {date}`;
    /// empty trailing parts are dropped.
    pub fn render(&self) -> Result<String, MalformedInput> {
        if self.patient.trim().is_empty() {
            return Err(MalformedInput::new("observation", "PATIENT is empty"));
        }
        if self.description.trim().is_empty() {
            return Err(MalformedInput::new(
                "observation",
                format!("DESCRIPTION is empty for patient {}", self.patient),
            ));
        }
        let mut text = format!("Observation: {}", self.description.trim());
        let value = [self.value.trim(), self.units.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !value.is_empty() {
            text.push_str(" value: ");
            text.push_str(&value);
        }
        if !self.date.trim().is_empty() {
            text.push_str(" on date ");
            text.push_str(self.date.trim());
        }
        Ok(text)
    }
}

/// Finding labels for one radiograph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLabelRow {
    /// Image file name.
    #[serde(rename = "Image Index", alias = "image")]
    pub image: String,
    /// Pipe-separated findings, e.g. `Effusion|Infiltration`.
    #[serde(rename = "Finding Labels", alias = "finding_labels", default)]
    pub finding_labels: Option<String>,
}

/// Finding labels keyed by image file name.
///
/// The first row for a file name wins; later rows for it are counted in
/// `duplicates` and ignored. Unparseable rows are kept in `errors` so the
/// caller can report them as failed input.
#[derive(Debug, Default)]
pub struct LabelIndex {
    labels: HashMap<String, Option<String>>,
    /// Label rows that could not be parsed.
    pub errors: Vec<MalformedInput>,
    /// Rows ignored because their file name was already indexed.
    pub duplicates: usize,
}

impl LabelIndex {
    /// Indexes `rows` in order.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = Result<ImageLabelRow, MalformedInput>>,
    {
        let mut index = Self::default();
        for row in rows {
            match row {
                Ok(row) => match index.labels.entry(row.image) {
                    Entry::Vacant(slot) => {
                        slot.insert(row.finding_labels);
                    }
                    Entry::Occupied(_) => index.duplicates += 1,
                },
                Err(err) => index.errors.push(err),
            }
        }
        index
    }

    /// Number of distinct file names.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether no file name is indexed.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels recorded for `filename`, if any.
    pub fn get(&self, filename: &str) -> Option<&str> {
        self.labels.get(filename).and_then(|labels| labels.as_deref())
    }

    /// Removes and returns the labels for `filename`.
    pub fn take(&mut self, filename: &str) -> Option<String> {
        self.labels.remove(filename).flatten()
    }
}

/// Raw radiograph plus its (optional) finding labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    /// File name; also used as the record subject.
    pub filename: String,
    /// Raw file bytes.
    pub bytes: Vec<u8>,
    /// Pipe-separated findings as exported, if any.
    pub finding_labels: Option<String>,
}

impl ImageSource {
    /// Findings with `|` separators turned into `, `; `None` when blank.
    pub fn findings(&self) -> Option<String> {
        self.finding_labels.as_deref().and_then(clean_findings)
    }

    /// Text embedded alongside the image.
    pub fn label_prompt(&self) -> Option<String> {
        self.findings()
            .map(|findings| format!("A chest X-ray showing {findings}"))
    }

    /// Stored description.
    pub fn render(&self) -> String {
        match self.findings() {
            Some(findings) => format!(
                "Chest X-ray findings: {findings}. Filename: {}",
                self.filename
            ),
            None => format!(
                "Chest X-ray findings: none recorded. Filename: {}",
                self.filename
            ),
        }
    }
}

/// Input row handed to [`super::Ingestor::ingest`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Lab observation, embedded as text.
    Observation(ObservationRow),
    /// Radiograph, embedded through fusion.
    Image(ImageSource),
}

/// `A|B | C` -> `A, B, C`.
pub fn clean_findings(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw
        .split('|')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

/// Lazily parses JSONL rows, skipping blank lines. Bad lines surface as
/// [`MalformedInput`] items so callers can count them.
pub fn read_jsonl<T, R>(
    reader: R,
    source_kind: &'static str,
) -> impl Iterator<Item = Result<T, MalformedInput>>
where
    T: DeserializeOwned,
    R: BufRead,
{
    reader
        .lines()
        .enumerate()
        .filter_map(move |(line_no, line)| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(serde_json::from_str::<T>(&line).map_err(|err| {
                MalformedInput::new(source_kind, format!("line {}: {err}", line_no + 1))
            })),
            Err(err) => Some(Err(MalformedInput::new(
                source_kind,
                format!("failed to read line {}: {err}", line_no + 1),
            ))),
        })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}
