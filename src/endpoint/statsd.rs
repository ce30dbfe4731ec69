use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs as _, UdpSocket};

use tracing::debug;

use super::{EndpointHandler, SendContext};
use crate::collector::BuildError;
use crate::error::MetricsError;
use crate::reading::{MetricReading, RateKind};
use crate::writer::{write_value, TimestampCache, WireFormat};

/// statsd line framing: `name:value|c` / `|g` with `|#key:value,...` tags, one
/// line per reading, newline-terminated. Payloads map one-to-one onto
/// datagrams, so the payload size cap is the datagram size cap.
pub(crate) struct StatsdFormat;

impl WireFormat for StatsdFormat {
    fn open(&self, _section: usize, _buf: &mut Vec<u8>) {}

    fn separator(&self) -> &'static [u8] {
        b""
    }

    fn close(&self, _section: usize, _buf: &mut Vec<u8>) {}

    fn encode_reading(
        &self,
        reading: &MetricReading,
        _timestamps: &mut TimestampCache,
        buf: &mut Vec<u8>,
    ) {
        buf.extend_from_slice(reading.name().as_bytes());
        buf.extend_from_slice(reading.suffix().as_bytes());
        buf.push(b':');
        write_value(reading.value(), buf);
        buf.extend_from_slice(match reading.kind() {
            RateKind::Gauge => b"|g",
            _ => b"|c",
        });

        let mut wrote_tag = false;
        for (key, value) in reading.tags().pairs() {
            if wrote_tag {
                buf.push(b',');
            } else {
                buf.extend_from_slice(b"|#");
                wrote_tag = true;
            }
            buf.extend_from_slice(key.as_bytes());
            buf.push(b':');
            buf.extend_from_slice(value.as_bytes());
        }

        buf.push(b'\n');
    }

    fn prefers_deltas(&self) -> bool {
        true
    }
}

enum SocketState {
    Disconnected,
    Ready(UdpSocket),
}

/// Ships readings to a statsd server over UDP, one datagram per payload.
///
/// The socket reconnects lazily after a failed send; send failures are
/// transient and leave retry decisions to the collector.
pub struct StatsdHandler {
    addrs: Vec<SocketAddr>,
    socket: SocketState,
    format: StatsdFormat,
}

impl StatsdHandler {
    /// Creates a handler sending to `addr`, e.g. `"127.0.0.1:8125"`.
    pub fn new(addr: &str) -> Result<StatsdHandler, BuildError> {
        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidEndpointAddress { reason: format!("{addr}: {e}") })?
            .collect();
        if addrs.is_empty() {
            return Err(BuildError::InvalidEndpointAddress {
                reason: format!("{addr}: no addresses resolved"),
            });
        }

        Ok(StatsdHandler { addrs, socket: SocketState::Disconnected, format: StatsdFormat })
    }

    fn try_send(&mut self, payload: &[u8], cx: &SendContext<'_>) -> io::Result<usize> {
        if matches!(self.socket, SocketState::Disconnected) {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            socket.connect(&self.addrs[..])?;
            socket.set_write_timeout(Some(cx.timeout()))?;
            self.socket = SocketState::Ready(socket);
        }

        let SocketState::Ready(socket) = &self.socket else { unreachable!("connected above") };
        let result = socket.send(payload);
        if result.is_err() {
            self.socket = SocketState::Disconnected;
        }
        result
    }
}

impl EndpointHandler for StatsdHandler {
    fn wire_format(&self) -> &dyn WireFormat {
        &self.format
    }

    fn send_payload(&mut self, payload: &[u8], cx: &SendContext<'_>) -> Result<(), MetricsError> {
        self.try_send(payload, cx).map(|_| ()).map_err(|e| {
            debug!(error = %e, endpoint = cx.endpoint(), "Failed to send statsd datagram.");
            MetricsError::TransportTransient {
                endpoint: cx.endpoint().to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn dispose(&mut self) {
        self.socket = SocketState::Disconnected;
    }
}
