use tracing::debug;

use crate::payload::{Payload, PayloadQueue};
use crate::reading::MetricReading;

/// Finalize the current payload once fewer than this many bytes of budget
/// remain, instead of waiting for an overflow and paying the partial copy.
const FINALIZE_SLACK: usize = 150;

/// Endpoint-specific framing of readings into payload bytes.
///
/// A format decides the opening/closing bytes of a payload, the separator
/// written between readings, and the encoding of a single reading. Formats
/// that split readings across differently-framed bodies (SignalFx) route each
/// reading to a numbered section; the writer keeps one section per payload.
pub trait WireFormat: Send {
    /// Section this reading belongs to. Single-framing formats return 0.
    fn section_of(&self, reading: &MetricReading) -> usize {
        let _ = reading;
        0
    }

    /// Writes the payload opening bytes for a section.
    fn open(&self, section: usize, buf: &mut Vec<u8>);

    /// Separator written after every reading.
    fn separator(&self) -> &'static [u8];

    /// Writes the payload closing bytes for a section.
    fn close(&self, section: usize, buf: &mut Vec<u8>);

    /// Appends one encoded reading to `buf`.
    fn encode_reading(
        &self,
        reading: &MetricReading,
        timestamps: &mut TimestampCache,
        buf: &mut Vec<u8>,
    );

    /// Whether cumulative counters should emit per-window deltas rather than
    /// their absolute value.
    fn prefers_deltas(&self) -> bool {
        false
    }
}

/// Caches the formatting of the most recent timestamp.
///
/// Snapshots stamp every reading of a window with the same instant, so one
/// cached 13-digit string covers nearly every lookup.
pub struct TimestampCache {
    millis: u64,
    text: String,
}

impl TimestampCache {
    fn new() -> TimestampCache {
        TimestampCache { millis: 0, text: String::new() }
    }

    /// The decimal form of `millis`, reformatted only when it changes.
    pub fn millis_str(&mut self, millis: u64) -> &str {
        if self.millis != millis || self.text.is_empty() {
            let mut buf = itoa::Buffer::new();
            self.text.clear();
            self.text.push_str(buf.format(millis));
            self.millis = millis;
        }
        &self.text
    }
}

/// Appends a value in shortest-round-trip form.
///
/// Integral values within the exactly-representable range are written as
/// integers, which is both shorter and what counter consumers expect.
pub(crate) fn write_value(value: f64, buf: &mut Vec<u8>) {
    const EXACT_INT: f64 = 9_007_199_254_740_992.0; // 2^53

    if value.fract() == 0.0 && value.abs() < EXACT_INT {
        let mut writer = itoa::Buffer::new();
        buf.extend_from_slice(writer.format(value as i64).as_bytes());
    } else {
        let mut writer = ryu::Buffer::new();
        buf.extend_from_slice(writer.format(value).as_bytes());
    }
}

/// Appends a JSON string literal, escaping quotes, backslashes, and control
/// characters. Tag canonical forms never need this; metric names might.
pub(crate) fn write_json_string(s: &str, buf: &mut Vec<u8>) {
    buf.push(b'"');
    for c in s.chars() {
        match c {
            '"' => buf.extend_from_slice(b"\\\""),
            '\\' => buf.extend_from_slice(b"\\\\"),
            '\n' => buf.extend_from_slice(b"\\n"),
            '\r' => buf.extend_from_slice(b"\\r"),
            '\t' => buf.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                const HEX: &[u8; 16] = b"0123456789abcdef";
                let value = c as u32;
                buf.extend_from_slice(b"\\u00");
                buf.push(HEX[(value >> 4) as usize]);
                buf.push(HEX[(value & 0xf) as usize]);
            }
            c => {
                let mut utf8 = [0u8; 4];
                buf.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
    buf.push(b'"');
}

/// Appends the canonical reading object:
/// `{"metric":"<name><suffix>","value":V,"tags":{...},"timestamp":MS}`.
pub(crate) fn write_json_reading(
    reading: &MetricReading,
    timestamps: &mut TimestampCache,
    buf: &mut Vec<u8>,
) {
    buf.extend_from_slice(b"{\"metric\":");
    let mut name = String::with_capacity(reading.name().len() + reading.suffix().len());
    name.push_str(reading.name());
    name.push_str(reading.suffix());
    write_json_string(&name, buf);
    buf.extend_from_slice(b",\"value\":");
    write_value(reading.value(), buf);
    buf.extend_from_slice(b",\"tags\":");
    buf.extend_from_slice(reading.tags().canonical().as_bytes());
    buf.extend_from_slice(b",\"timestamp\":");
    buf.extend_from_slice(timestamps.millis_str(reading.timestamp_millis()).as_bytes());
    buf.push(b'}');
}

/// Serializes readings into pooled payloads for one endpoint.
///
/// The writer owns one checked-out payload at a time. Readings are appended
/// followed by the separator; when a reading overflows the payload budget the
/// in-flight bytes are rewritten into a fresh payload and the full one is
/// finalized (trailing separator replaced by the closing bytes) and queued
/// pending.
pub struct MetricWriter<'a> {
    queue: &'a PayloadQueue,
    format: &'a dyn WireFormat,
    timestamps: TimestampCache,
    current: Option<Payload>,
    section: usize,
    open_len: usize,
    readings_written: u64,
    readings_dropped: u64,
}

impl<'a> MetricWriter<'a> {
    pub(crate) fn new(queue: &'a PayloadQueue, format: &'a dyn WireFormat) -> MetricWriter<'a> {
        MetricWriter {
            queue,
            format,
            timestamps: TimestampCache::new(),
            current: None,
            section: 0,
            open_len: 0,
            readings_written: 0,
            readings_dropped: 0,
        }
    }

    /// Whether this writer's format wants cumulative counters as deltas.
    pub fn prefers_deltas(&self) -> bool {
        self.format.prefers_deltas()
    }

    /// Readings successfully framed so far.
    pub fn readings_written(&self) -> u64 {
        self.readings_written
    }

    /// Readings dropped for being non-finite or oversized.
    pub fn readings_dropped(&self) -> u64 {
        self.readings_dropped
    }

    /// Appends one reading, chunking into a fresh payload on overflow.
    pub fn write_reading(&mut self, reading: &MetricReading) {
        if !reading.value().is_finite() {
            debug!(metric_name = reading.name(), "Dropping non-finite reading.");
            self.readings_dropped += 1;
            return;
        }

        let section = self.format.section_of(reading);
        if self.current.is_some() && self.section != section {
            self.finalize_current();
        }

        if self.current.is_none() {
            self.start_payload(section);
        }

        let budget = self.queue.payload_size();
        let separator = self.format.separator();

        let payload = self.current.as_mut().expect("payload checked out above");
        let start_of_write = payload.data.len();
        self.format.encode_reading(reading, &mut self.timestamps, &mut payload.data);
        payload.data.extend_from_slice(separator);

        if payload.data.len() > budget {
            if start_of_write == self.open_len {
                // Lone reading bigger than a whole payload: nothing to chunk,
                // drop it and reuse the still-empty payload.
                payload.data.truncate(start_of_write);
                debug!(
                    metric_name = reading.name(),
                    "Dropping reading larger than the maximum payload size."
                );
                self.readings_dropped += 1;
                return;
            }

            // Move the in-flight bytes into a fresh payload, then finalize
            // the full one behind them.
            let mut fresh = self.queue.get_free();
            self.format.open(section, &mut fresh.data);
            let fresh_open_len = fresh.data.len();
            fresh.data.extend_from_slice(&payload.data[start_of_write..]);

            let mut full = std::mem::replace(payload, fresh);
            full.data.truncate(start_of_write);
            self.open_len = fresh_open_len;
            self.finalize(full);

            let payload = self.current.as_mut().expect("fresh payload installed above");
            if payload.data.len() > budget {
                payload.data.truncate(self.open_len);
                debug!(
                    metric_name = reading.name(),
                    "Dropping reading larger than the maximum payload size."
                );
                self.readings_dropped += 1;
                return;
            }
            payload.metrics_count = 1;
        } else {
            payload.metrics_count += 1;
        }

        self.readings_written += 1;

        // Nearly-full payloads get finalized now rather than paying the
        // partial copy on the next reading. Scaled down for small budgets.
        let slack = FINALIZE_SLACK.min(budget / 4);
        let used = self.current.as_ref().map(|p| p.data.len()).unwrap_or(0);
        if budget.saturating_sub(used) < slack {
            self.finalize_current();
        }
    }

    /// Finalizes and queues whatever payload is still open.
    pub fn finish(&mut self) {
        self.finalize_current();
    }

    fn start_payload(&mut self, section: usize) {
        let mut payload = self.queue.get_free();
        self.format.open(section, &mut payload.data);
        self.section = section;
        self.open_len = payload.data.len();
        self.current = Some(payload);
    }

    fn finalize_current(&mut self) {
        if let Some(payload) = self.current.take() {
            self.finalize(payload);
        }
    }

    fn finalize(&self, mut payload: Payload) {
        if payload.metrics_count == 0 {
            self.queue.release(payload);
            return;
        }

        let separator_len = self.format.separator().len();
        payload.data.truncate(payload.data.len() - separator_len);
        self.format.close(self.section, &mut payload.data);
        self.queue.add_pending(payload);
    }
}

impl Drop for MetricWriter<'_> {
    fn drop(&mut self) {
        self.finalize_current();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use super::{MetricWriter, TimestampCache, WireFormat};
    use crate::payload::PayloadQueue;
    use crate::reading::{MetricReading, RateKind, MIN_TIMESTAMP_MS};
    use crate::tags::{default_name_transformer, resolve_tags, TagSet};

    /// Minimal JSON-array framing, enough to exercise the chunking logic.
    struct ArrayFormat;

    impl WireFormat for ArrayFormat {
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
            _timestamps: &mut TimestampCache,
            buf: &mut Vec<u8>,
        ) {
            buf.push(b'"');
            buf.extend_from_slice(reading.name().as_bytes());
            buf.push(b'"');
        }
    }

    fn reading(name: &str) -> MetricReading {
        let tags =
            resolve_tags(&TagSet::new(), &TagSet::new(), &default_name_transformer()).unwrap();
        MetricReading::new(
            Arc::from(name),
            "",
            RateKind::Gauge,
            1.0,
            tags,
            UNIX_EPOCH + Duration::from_millis(MIN_TIMESTAMP_MS),
        )
        .unwrap()
    }

    fn payload_strings(queue: &PayloadQueue) -> Vec<String> {
        queue
            .take_for_flush()
            .into_iter()
            .map(|p| String::from_utf8(p.data.clone()).unwrap())
            .collect()
    }

    #[test]
    fn single_payload_framing() {
        let queue = PayloadQueue::new(4096, 8);
        let format = ArrayFormat;
        let mut writer = MetricWriter::new(&queue, &format);

        writer.write_reading(&reading("a"));
        writer.write_reading(&reading("b"));
        writer.write_reading(&reading("c"));
        writer.finish();

        assert_eq!(writer.readings_written(), 3);
        assert_eq!(payload_strings(&queue), vec![r#"["a","b","c"]"#.to_string()]);
    }

    #[test]
    fn overflow_moves_partial_bytes_into_fresh_payload() {
        // A short reading followed by one that fits a payload on its own but
        // not alongside the first: the second must be rewritten into a fresh
        // payload and the first finalized behind it.
        let queue = PayloadQueue::new(160, 8);
        let format = ArrayFormat;
        let mut writer = MetricWriter::new(&queue, &format);

        writer.write_reading(&reading(&"a".repeat(8)));
        writer.write_reading(&reading(&"b".repeat(156)));
        writer.finish();

        let payloads = payload_strings(&queue);
        assert_eq!(payloads.len(), 2);
        for payload in &payloads {
            let parsed: serde_json::Value = serde_json::from_str(payload).unwrap();
            let entries = parsed.as_array().unwrap();
            assert_eq!(entries.len(), 1);
        }
        assert!(payloads[0].contains("aaa"));
        assert!(payloads[1].contains("bbb"));
        assert_eq!(writer.readings_written(), 2);
    }

    #[test]
    fn oversized_reading_is_dropped_others_survive() {
        let queue = PayloadQueue::new(64, 8);
        let format = ArrayFormat;
        let mut writer = MetricWriter::new(&queue, &format);

        writer.write_reading(&reading("ok"));
        writer.write_reading(&reading(&"y".repeat(200)));
        writer.write_reading(&reading("ok2"));
        writer.finish();

        assert_eq!(writer.readings_dropped(), 1);
        assert_eq!(writer.readings_written(), 2);

        let joined = payload_strings(&queue).join("");
        assert!(joined.contains("ok"));
        assert!(joined.contains("ok2"));
        assert!(!joined.contains("yyy"));
    }

    #[test]
    fn non_finite_values_are_dropped() {
        let queue = PayloadQueue::new(4096, 8);
        let format = ArrayFormat;
        let mut writer = MetricWriter::new(&queue, &format);

        let tags =
            resolve_tags(&TagSet::new(), &TagSet::new(), &default_name_transformer()).unwrap();
        let nan = MetricReading::new(
            Arc::from("bad"),
            "",
            RateKind::Gauge,
            f64::NAN,
            tags,
            UNIX_EPOCH + Duration::from_millis(MIN_TIMESTAMP_MS),
        )
        .unwrap();

        writer.write_reading(&nan);
        writer.finish();

        assert_eq!(writer.readings_dropped(), 1);
        assert!(payload_strings(&queue).is_empty());
    }

    #[test]
    fn timestamp_cache_reuses_formatting() {
        let mut cache = TimestampCache::new();
        assert_eq!(cache.millis_str(946_684_800_000), "946684800000");
        assert_eq!(cache.millis_str(946_684_800_000), "946684800000");
        assert_eq!(cache.millis_str(946_684_800_001), "946684800001");
    }
}
