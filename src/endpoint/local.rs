use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{EndpointHandler, SendContext};
use crate::error::MetricsError;
use crate::reading::{MetricDefinition, MetricReading};
use crate::writer::{write_json_reading, TimestampCache, WireFormat};

struct Shared {
    readings: Mutex<IndexMap<String, MetricReading>>,
    definitions: Mutex<IndexMap<Arc<str>, MetricDefinition>>,
}

/// An in-process sink: keeps the most recent reading per `name + suffix` and
/// deduplicates metadata by name. No I/O ever happens; "flushing" to the
/// local sink succeeds trivially.
///
/// Useful for tests and for applications that want to expose their current
/// metric values on their own surface (health endpoints, admin pages).
#[derive(Clone)]
pub struct LocalSink {
    shared: Arc<Shared>,
}

impl LocalSink {
    /// Creates an empty sink.
    pub fn new() -> LocalSink {
        LocalSink {
            shared: Arc::new(Shared {
                readings: Mutex::new(IndexMap::new()),
                definitions: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// Creates the endpoint handler feeding this sink.
    ///
    /// Several handlers may feed one sink; last write still wins.
    pub fn handler(&self) -> LocalSinkHandler {
        LocalSinkHandler {
            shared: Arc::clone(&self.shared),
            format: LocalFormat { shared: Arc::clone(&self.shared) },
        }
    }

    /// The most recent reading for `name + suffix`, if any.
    pub fn reading(&self, name_with_suffix: &str) -> Option<MetricReading> {
        self.shared.readings.lock().get(name_with_suffix).cloned()
    }

    /// Every retained reading, in first-seen order.
    pub fn readings(&self) -> Vec<MetricReading> {
        self.shared.readings.lock().values().cloned().collect()
    }

    /// Metadata definitions seen so far, deduplicated by name.
    pub fn definitions(&self) -> Vec<MetricDefinition> {
        self.shared.definitions.lock().values().cloned().collect()
    }

    /// Clears retained readings and definitions.
    pub fn clear(&self) {
        self.shared.readings.lock().clear();
        self.shared.definitions.lock().clear();
    }
}

impl Default for LocalSink {
    fn default() -> LocalSink {
        LocalSink::new()
    }
}

/// Captures each reading into the sink as it is encoded. The bytes written
/// are the canonical JSON array form, so payload accounting behaves exactly
/// like a remote endpoint's.
struct LocalFormat {
    shared: Arc<Shared>,
}

impl WireFormat for LocalFormat {
    fn open(&self, _section: usize, buf: &mut Vec<u8>) {
        buf.push(b'[');
    }

    fn separator(&self) -> &'static [u8] {
        b","
    }

    fn close(&self, _section: usize, buf: &mut Vec<u8>) {
        buf.push(b']');
    }

    fn encode_reading(
        &self,
        reading: &MetricReading,
        timestamps: &mut TimestampCache,
        buf: &mut Vec<u8>,
    ) {
        let key = format!("{}{}", reading.name(), reading.suffix());
        self.shared.readings.lock().insert(key, reading.clone());
        write_json_reading(reading, timestamps, buf);
    }
}

/// Endpoint handler feeding a [`LocalSink`].
pub struct LocalSinkHandler {
    shared: Arc<Shared>,
    format: LocalFormat,
}

impl EndpointHandler for LocalSinkHandler {
    fn wire_format(&self) -> &dyn WireFormat {
        &self.format
    }

    fn send_payload(&mut self, _payload: &[u8], _cx: &SendContext<'_>) -> Result<(), MetricsError> {
        Ok(())
    }

    fn send_metadata(
        &mut self,
        definitions: &[MetricDefinition],
        _cx: &SendContext<'_>,
    ) -> Result<(), MetricsError> {
        let mut known = self.shared.definitions.lock();
        for definition in definitions {
            known.entry(definition.name.clone()).or_insert_with(|| definition.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use super::LocalSink;
    use crate::endpoint::EndpointHandler as _;
    use crate::payload::PayloadQueue;
    use crate::reading::{MetricReading, RateKind};
    use crate::tags::{default_name_transformer, resolve_tags, TagSet};
    use crate::writer::MetricWriter;

    fn reading(name: &str, suffix: &'static str, value: f64, millis: u64) -> MetricReading {
        let tags =
            resolve_tags(&TagSet::new(), &TagSet::new(), &default_name_transformer()).unwrap();
        MetricReading::new(
            Arc::from(name),
            suffix,
            RateKind::Gauge,
            value,
            tags,
            UNIX_EPOCH + Duration::from_millis(millis),
        )
        .unwrap()
    }

    #[test]
    fn keeps_most_recent_reading_per_name_and_suffix() {
        let sink = LocalSink::new();
        let handler = sink.handler();

        let queue = PayloadQueue::new(4096, 4);
        let mut writer = MetricWriter::new(&queue, handler.wire_format());
        writer.write_reading(&reading("cpu.load", "", 0.25, 1_600_000_000_000));
        writer.write_reading(&reading("cpu.load", "_max", 0.9, 1_600_000_000_000));
        writer.write_reading(&reading("cpu.load", "", 0.75, 1_600_000_030_000));
        writer.finish();

        assert_eq!(sink.readings().len(), 2);
        let latest = sink.reading("cpu.load").unwrap();
        assert_eq!(latest.value(), 0.75);
        assert_eq!(latest.timestamp_millis(), 1_600_000_030_000);
        assert_eq!(sink.reading("cpu.load_max").unwrap().value(), 0.9);
    }
}
