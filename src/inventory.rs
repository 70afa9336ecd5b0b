//! Image and container records, point-in-time snapshots of them, and the
//! deltas between two snapshots.
//!
//! The engine output is read one line at a time. A line starting with `{` is
//! treated as the output of the `{{json .}}` template, anything else as the
//! tab separated template. Lines that cannot be turned into a record are
//! reported as [ParseError]s and skipped, they never abort the rest.

use std::{collections::BTreeMap, time::SystemTime};

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ParseError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub repository: String,
    pub tag: String,
    /// Short content addressed ID, the identity key
    pub id: String,
    /// Human readable size such as "120MB"
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// The identity key
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub ports: String,
}

/// Which inventory an ID belongs to
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordId {
    Image(String),
    Container(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Image(ImageRecord),
    Container(ContainerRecord),
}

impl Record {
    pub fn id(&self) -> RecordId {
        match self {
            Record::Image(image) => RecordId::Image(image.id.clone()),
            Record::Container(container) => RecordId::Container(container.id.clone()),
        }
    }
}

/// One change between two snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    Added(Record),
    Removed(RecordId),
    Changed(RecordId, Record),
}

impl Delta {
    /// The identity key this delta is about, selection preserving consumers
    /// use this to decide whether a selected row still exists
    pub fn id(&self) -> RecordId {
        match self {
            Delta::Added(record) => record.id(),
            Delta::Removed(id) | Delta::Changed(id, _) => id.clone(),
        }
    }
}

/// An immutable point-in-time copy of both inventories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventorySnapshot {
    pub images: BTreeMap<String, ImageRecord>,
    pub containers: BTreeMap<String, ContainerRecord>,
    pub taken_at: SystemTime,
}

impl Default for InventorySnapshot {
    fn default() -> Self {
        Self {
            images: BTreeMap::new(),
            containers: BTreeMap::new(),
            taken_at: SystemTime::UNIX_EPOCH,
        }
    }
}

impl InventorySnapshot {
    pub fn new(images: Vec<ImageRecord>, containers: Vec<ContainerRecord>) -> Self {
        let mut snapshot = Self {
            taken_at: SystemTime::now(),
            ..Default::default()
        };
        for image in images {
            // several tags of one image share an ID, the first line listed wins
            snapshot.images.entry(image.id.clone()).or_insert(image);
        }
        for container in containers {
            snapshot
                .containers
                .entry(container.id.clone())
                .or_insert(container);
        }
        snapshot
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        match id {
            RecordId::Image(id) => self.images.contains_key(id),
            RecordId::Container(id) => self.containers.contains_key(id),
        }
    }

    /// Returns the deltas that turn `self` into `next`. Images come before
    /// containers, and each group is ordered by ID.
    pub fn diff(&self, next: &InventorySnapshot) -> Vec<Delta> {
        let mut deltas = diff_maps(&self.images, &next.images, RecordId::Image, Record::Image);
        deltas.extend(diff_maps(
            &self.containers,
            &next.containers,
            RecordId::Container,
            Record::Container,
        ));
        deltas
    }
}

fn diff_maps<T: Clone + PartialEq>(
    prev: &BTreeMap<String, T>,
    next: &BTreeMap<String, T>,
    to_id: fn(String) -> RecordId,
    to_record: fn(T) -> Record,
) -> Vec<Delta> {
    let mut deltas = vec![];
    for (id, record) in next {
        match prev.get(id) {
            None => deltas.push(Delta::Added(to_record(record.clone()))),
            Some(old) if old != record => {
                deltas.push(Delta::Changed(to_id(id.clone()), to_record(record.clone())))
            }
            Some(_) => (),
        }
    }
    for id in prev.keys() {
        if !next.contains_key(id) {
            deltas.push(Delta::Removed(to_id(id.clone())));
        }
    }
    // `Removed` were pushed after the others, keep the whole group ordered by ID
    deltas.sort_by(|a, b| a.id().cmp(&b.id()));
    deltas
}

/// Records from one listing together with the lines that were skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed<T> {
    pub records: Vec<T>,
    pub errors: Vec<ParseError>,
}

/// Parses the output of the images listing
pub fn parse_images(output: impl AsRef<[u8]>) -> Parsed<ImageRecord> {
    parse_lines(output.as_ref(), &["Repository", "Tag", "ID", "Size"], |fields| {
        ImageRecord {
            repository: fields[0].clone(),
            tag: fields[1].clone(),
            id: fields[2].clone(),
            size: fields[3].clone(),
        }
    })
}

/// Parses the output of the containers listing
pub fn parse_containers(output: impl AsRef<[u8]>) -> Parsed<ContainerRecord> {
    parse_lines(
        output.as_ref(),
        &["ID", "Names", "Image", "Status", "Ports"],
        |fields| ContainerRecord {
            id: fields[0].clone(),
            name: fields[1].clone(),
            image: fields[2].clone(),
            status: fields[3].clone(),
            ports: fields[4].clone(),
        },
    )
}

/// `keys` doubles as the JSON key names and the tab separated field order
fn parse_lines<T>(output: &[u8], keys: &[&str], build: impl Fn(&[String]) -> T) -> Parsed<T> {
    let mut parsed = Parsed {
        records: vec![],
        errors: vec![],
    };
    for line in output.lines() {
        let line = line.to_str_lossy();
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue
        }
        let fields = if line.trim_start().starts_with('{') {
            json_fields(line, keys)
        } else {
            tab_fields(line, keys.len())
        };
        match fields {
            Ok(fields) => parsed.records.push(build(&fields)),
            Err(e) => parsed.errors.push(e),
        }
    }
    parsed
}

fn tab_fields(line: &str, expected: usize) -> Result<Vec<String>, ParseError> {
    let fields: Vec<String> = line.split('\t').map(|f| f.trim().to_owned()).collect();
    if fields.len() != expected {
        return Err(ParseError::FieldCount {
            expected,
            found: fields.len(),
            line: line.to_owned(),
        })
    }
    if fields.iter().all(|f| f.is_empty()) {
        return Err(ParseError::FieldCount {
            expected,
            found: 0,
            line: line.to_owned(),
        })
    }
    Ok(fields)
}

fn json_fields(line: &str, keys: &[&str]) -> Result<Vec<String>, ParseError> {
    let err = |reason: String| ParseError::Json {
        line: line.to_owned(),
        reason,
    };
    let object: Map<String, Value> = serde_json::from_str(line).map_err(|e| err(e.to_string()))?;
    keys.iter()
        .map(|key| match object.get(*key) {
            Some(Value::String(s)) => Ok(s.trim().to_owned()),
            // some engines emit numbers or lists for a few of these
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Array(items)) => Ok(items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",")),
            Some(Value::Null) => Ok(String::new()),
            Some(other) => Err(err(format!("key {key:?} has unexpected value {other}"))),
            None => Err(err(format!("missing key {key:?}"))),
        })
        .collect()
}
