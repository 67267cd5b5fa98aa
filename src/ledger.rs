//! Retention ledger: the bounded, oldest-first list of uploaded archives
//!
//! The ledger lives under one item key in the attribute store as a JSON array
//! of `{archiveId, createdAt}` records. Attribute values are limited to 1024
//! bytes, so the array text is stored in ordered segments `json.000`,
//! `json.001`, ... and concatenated on load. `json.count` is written in the
//! same put and bounds which segments are read, so a stale tail left by an
//! interrupted shrink is ignored. The older layout (one attribute named
//! `json` per record) is still read.

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, ServiceError};
use crate::logger::Logger;
use crate::service::{ArchiveService, Attribute, AttributeStore};

/// Item key holding the ledger
pub const LEDGER_KEY: &str = "backupstate";

/// Largest attribute value the store accepts, in bytes
pub const MAX_VALUE_BYTES: usize = 1024;

const SEGMENT_PREFIX: &str = "json.";
const COUNT_NAME: &str = "json.count";
const LEGACY_NAME: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub archive_id: String,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

impl ArchiveRecord {
    pub fn new(archive_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            archive_id: archive_id.into(),
            created_at: created_at.timestamp_millis(),
        }
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }

    /// Creation time in the local time zone, for operator messages
    pub fn created_local(&self) -> String {
        match self.created() {
            Some(t) => t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
            None => format!("{}ms", self.created_at),
        }
    }
}

/// Split the serialized ledger into store-sized attributes
pub fn encode(records: &[ArchiveRecord]) -> Result<Vec<Attribute>, LedgerError> {
    let json = serde_json::to_string(records)?;
    let mut attributes = Vec::new();
    let mut rest = json.as_str();
    while !rest.is_empty() {
        let mut end = rest.len().min(MAX_VALUE_BYTES);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        attributes.push(Attribute::new(
            format!("{SEGMENT_PREFIX}{:03}", attributes.len()),
            &rest[..end],
        ));
        rest = &rest[end..];
    }
    let count = attributes.len();
    attributes.push(Attribute::new(COUNT_NAME, count.to_string()));
    Ok(attributes)
}

/// Rebuild the ledger from whatever layout the attributes use
pub fn decode(attributes: &[Attribute]) -> Result<Vec<ArchiveRecord>, LedgerError> {
    let mut segments: Vec<(usize, &str)> = attributes
        .iter()
        .filter_map(|a| {
            let n = a.name.strip_prefix(SEGMENT_PREFIX)?.parse::<usize>().ok()?;
            Some((n, a.value.as_str()))
        })
        .collect();

    let count = attributes
        .iter()
        .find(|a| a.name == COUNT_NAME)
        .map(|a| {
            a.value
                .trim()
                .parse::<usize>()
                .map_err(|_| LedgerError::BadSegmentCount(a.value.clone()))
        })
        .transpose()?;

    if !segments.is_empty() || count.is_some() {
        if let Some(count) = count {
            segments.retain(|&(n, _)| n < count);
        }
        segments.sort_by_key(|&(n, _)| n);
        let wanted = count.unwrap_or(segments.len());
        let mut json = String::new();
        for expected in 0..wanted {
            match segments.get(expected) {
                Some(&(n, value)) if n == expected => json.push_str(value),
                _ => {
                    return Err(LedgerError::MissingSegment(format!(
                        "{SEGMENT_PREFIX}{expected:03}"
                    )))
                }
            }
        }
        return Ok(serde_json::from_str(&json)?);
    }

    let mut records = Vec::new();
    for attr in attributes.iter().filter(|a| a.name == LEGACY_NAME) {
        let value = attr.value.trim();
        if value.starts_with('[') {
            records.extend(serde_json::from_str::<Vec<ArchiveRecord>>(value)?);
        } else {
            records.push(serde_json::from_str::<ArchiveRecord>(value)?);
        }
    }
    // Multi-valued attributes come back unordered
    records.sort_by_key(|r| r.created_at);
    Ok(records)
}

pub struct RetentionLedger<'a> {
    store: &'a dyn AttributeStore,
    records: Vec<ArchiveRecord>,
}

impl<'a> RetentionLedger<'a> {
    pub fn load(store: &'a dyn AttributeStore) -> Result<Self, LedgerError> {
        let records = decode(&store.get(LEDGER_KEY)?)?;
        Ok(Self { store, records })
    }

    /// Ledger of a domain that does not exist yet
    pub fn empty(store: &'a dyn AttributeStore) -> Self {
        Self {
            store,
            records: Vec::new(),
        }
    }

    pub fn reload(&mut self) -> Result<(), LedgerError> {
        self.records = decode(&self.store.get(LEDGER_KEY)?)?;
        Ok(())
    }

    pub fn save(&self) -> Result<(), LedgerError> {
        self.store.set(LEDGER_KEY, &encode(&self.records)?)?;
        Ok(())
    }

    /// Oldest first
    pub fn records(&self) -> &[ArchiveRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Make room for one more record: while at least `max_count` records are
    /// kept, delete the oldest archive, persist, and re-read the ledger.
    ///
    /// Returns the removed records, oldest first. Does nothing on a dry run.
    pub fn enforce_retention(
        &mut self,
        archives: &dyn ArchiveService,
        max_count: usize,
        dry_run: bool,
        logger: &dyn Logger,
    ) -> Result<Vec<ArchiveRecord>, LedgerError> {
        if max_count == 0 {
            return Err(LedgerError::InvalidRetention);
        }
        let mut removed = Vec::new();
        if dry_run {
            return Ok(removed);
        }
        while self.records.len() >= max_count {
            let oldest = self.records.remove(0);
            match archives.delete_archive(&oldest.archive_id) {
                Ok(()) => {}
                // Already gone remotely; dropping the record is all that is left to do
                Err(ServiceError::NotFound(msg)) => {
                    logger.error("delete archive", &msg);
                }
                Err(source) => {
                    return Err(LedgerError::Delete {
                        archive_id: oldest.archive_id,
                        source,
                    })
                }
            }
            logger.archive_deleted(&oldest.archive_id);
            self.save()?;
            removed.push(oldest);
            self.reload()?;
        }
        Ok(removed)
    }

    pub fn append(&mut self, record: ArchiveRecord) -> Result<(), LedgerError> {
        self.records.push(record);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::service::memory::{MemoryArchiveService, MemoryAttributeStore};

    fn record(id: &str, at: i64) -> ArchiveRecord {
        ArchiveRecord {
            archive_id: id.to_string(),
            created_at: at,
        }
    }

    fn seeded(records: &[ArchiveRecord]) -> MemoryAttributeStore {
        let store = MemoryAttributeStore::new("d");
        store.insert(LEDGER_KEY, encode(records).unwrap());
        store
    }

    #[test]
    fn serializes_camel_case_array() {
        let attrs = encode(&[record("a", 1)]).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].name, "json.000");
        assert_eq!(attrs[0].value, r#"[{"archiveId":"a","createdAt":1}]"#);
        assert_eq!(attrs[1], Attribute::new("json.count", "1"));
        assert_eq!(encode(&[]).unwrap()[0].value, "[]");
    }

    #[test]
    fn long_ledgers_are_split_into_bounded_segments() {
        let records: Vec<ArchiveRecord> = (0..20)
            .map(|i| record(&format!("{}-{}", "x".repeat(130), i), 1_600_000_000_000 + i))
            .collect();
        let attrs = encode(&records).unwrap();
        assert!(attrs.len() > 1);
        assert!(attrs.iter().all(|a| a.value.len() <= MAX_VALUE_BYTES));
        let mut shuffled = attrs.clone();
        shuffled.reverse();
        assert_eq!(decode(&shuffled).unwrap(), records);
    }

    #[test]
    fn missing_segment_is_an_error() {
        let records: Vec<ArchiveRecord> =
            (0..20).map(|i| record(&"y".repeat(200), i)).collect();
        let mut attrs = encode(&records).unwrap();
        attrs.remove(1);
        assert!(matches!(decode(&attrs), Err(LedgerError::MissingSegment(_))));

        // Last segment gone: only the count notices
        let mut attrs = encode(&records).unwrap();
        let last = attrs.len() - 2;
        attrs.remove(last);
        assert!(matches!(decode(&attrs), Err(LedgerError::MissingSegment(_))));
    }

    #[test]
    fn stale_segments_past_the_count_are_ignored() {
        // A shrink that wrote the new segments but never deleted the old tail
        let mut attrs = encode(&[record("a", 1)]).unwrap();
        attrs.push(Attribute::new("json.001", r#",{"archiveId":"old","createdAt":0}]"#));
        attrs.push(Attribute::new("json.002", "garbage"));
        assert_eq!(decode(&attrs).unwrap(), vec![record("a", 1)]);
    }

    #[test]
    fn unreadable_segment_count_is_an_error() {
        let attrs = vec![
            Attribute::new("json.000", "[]"),
            Attribute::new("json.count", "two"),
        ];
        assert!(matches!(decode(&attrs), Err(LedgerError::BadSegmentCount(_))));
    }

    #[test]
    fn reads_legacy_per_record_layout() {
        let attrs = vec![
            Attribute::new("json", r#"{"archiveId":"b","createdAt":20}"#),
            Attribute::new("json", r#"{"archiveId":"a","createdAt":10}"#),
        ];
        let records = decode(&attrs).unwrap();
        assert_eq!(records, vec![record("a", 10), record("b", 20)]);
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn corrupt_ledger_is_fatal() {
        let store = MemoryAttributeStore::new("d");
        store.insert(LEDGER_KEY, vec![Attribute::new("json.000", "[{not json")]);
        assert!(matches!(
            RetentionLedger::load(&store),
            Err(LedgerError::Parse(_))
        ));
    }

    #[test]
    fn enforce_removes_oldest_until_below_limit() {
        let existing = [record("a", 1), record("b", 2), record("c", 3), record("d", 4)];
        let store = seeded(&existing);
        let archives = MemoryArchiveService::with_archives("v", &["a", "b", "c", "d"]);
        let mut ledger = RetentionLedger::load(&store).unwrap();

        let removed = ledger.enforce_retention(&archives, 3, false, &NoopLogger).unwrap();

        // L - M + 1 oldest records go
        assert_eq!(removed, vec![record("a", 1), record("b", 2)]);
        assert_eq!(ledger.records(), &[record("c", 3), record("d", 4)]);
        assert_eq!(archives.archive_ids(), vec!["c".to_string(), "d".to_string()]);
        assert_eq!(archives.calls().delete, 2);
        // Persisted after each deletion
        assert_eq!(store.set_count(), 2);
        assert_eq!(decode(&store.item(LEDGER_KEY)).unwrap(), ledger.records());
    }

    #[test]
    fn enforce_rechecks_after_reloading() {
        let store = seeded(&[record("a", 1), record("b", 2), record("c", 3)]);
        let archives = MemoryArchiveService::with_archives("v", &["a", "b", "c", "x"]);
        // Another writer appends "x" right after the first prune is saved
        store.overwrite_after_next_set(
            LEDGER_KEY,
            encode(&[record("b", 2), record("c", 3), record("x", 4)]).unwrap(),
        );
        let mut ledger = RetentionLedger::load(&store).unwrap();

        let removed = ledger.enforce_retention(&archives, 3, false, &NoopLogger).unwrap();

        assert_eq!(removed, vec![record("a", 1), record("b", 2)]);
        assert_eq!(ledger.records(), &[record("c", 3), record("x", 4)]);
        assert_eq!(archives.calls().delete, 2);
        assert_eq!(store.set_count(), 2);
        assert_eq!(decode(&store.item(LEDGER_KEY)).unwrap(), ledger.records());
    }

    #[test]
    fn enforce_below_limit_is_a_no_op() {
        let store = seeded(&[record("a", 1)]);
        let archives = MemoryArchiveService::with_archives("v", &["a"]);
        let mut ledger = RetentionLedger::load(&store).unwrap();
        assert!(ledger
            .enforce_retention(&archives, 3, false, &NoopLogger)
            .unwrap()
            .is_empty());
        assert_eq!(archives.calls().delete, 0);
        assert_eq!(store.set_count(), 0);
    }

    #[test]
    fn dry_run_leaves_everything_untouched() {
        let store = seeded(&[record("a", 1), record("b", 2), record("c", 3)]);
        let archives = MemoryArchiveService::with_archives("v", &["a", "b", "c"]);
        let mut ledger = RetentionLedger::load(&store).unwrap();
        assert!(ledger
            .enforce_retention(&archives, 3, true, &NoopLogger)
            .unwrap()
            .is_empty());
        assert_eq!(ledger.len(), 3);
        assert_eq!(archives.calls().mutating(), 0);
        assert_eq!(store.set_count(), 0);
    }

    #[test]
    fn archive_missing_remotely_is_still_pruned() {
        let store = seeded(&[record("gone", 1), record("b", 2)]);
        let archives = MemoryArchiveService::with_archives("v", &["b"]);
        let mut ledger = RetentionLedger::load(&store).unwrap();
        let removed = ledger.enforce_retention(&archives, 2, false, &NoopLogger).unwrap();
        assert_eq!(removed, vec![record("gone", 1)]);
        assert_eq!(ledger.records(), &[record("b", 2)]);
    }

    #[test]
    fn zero_retention_is_rejected() {
        let store = MemoryAttributeStore::new("d");
        let archives = MemoryArchiveService::new("v");
        let mut ledger = RetentionLedger::load(&store).unwrap();
        assert!(matches!(
            ledger.enforce_retention(&archives, 0, false, &NoopLogger),
            Err(LedgerError::InvalidRetention)
        ));
    }

    #[test]
    fn append_persists_new_record_last() {
        let store = seeded(&[record("a", 1)]);
        let mut ledger = RetentionLedger::load(&store).unwrap();
        ledger.append(record("b", 2)).unwrap();
        let reloaded = RetentionLedger::load(&store).unwrap();
        assert_eq!(reloaded.records(), &[record("a", 1), record("b", 2)]);
    }

    #[test]
    fn legacy_layout_is_rewritten_as_segments() {
        let store = MemoryAttributeStore::new("d");
        store.insert(
            LEDGER_KEY,
            vec![Attribute::new("json", r#"{"archiveId":"a","createdAt":10}"#)],
        );
        let mut ledger = RetentionLedger::load(&store).unwrap();
        ledger.append(record("b", 20)).unwrap();
        let item = store.item(LEDGER_KEY);
        assert!(item.iter().all(|a| a.name.starts_with(SEGMENT_PREFIX)));
        assert_eq!(decode(&item).unwrap(), vec![record("a", 10), record("b", 20)]);
    }

    #[test]
    fn record_timestamps_convert() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let r = ArchiveRecord::new("x", at);
        assert_eq!(r.created(), Some(at));
        assert_eq!(r.created_at, at.timestamp_millis());
    }
}
