//! Vehicle telemetry packet and UDP link

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info, warn};

use crate::error::TelemetryError;
use crate::utils::Worker;
use crate::TelemetryConfig;

/// Wire size of one telemetry datagram
pub const TELEMETRY_PACKET_LEN: usize = 44;

/// Vehicle state as reported over the telemetry link.
///
/// Layout, little-endian: `u64 flags` followed by nine `f32` values in field
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetryPacket {
    pub flags: u64,
    /// Degrees
    pub roll: f32,
    pub pitch: f32,
    /// Heading in degrees, 0..360
    pub yaw: f32,
    /// Meters
    pub depth: f32,
    pub battery_voltage: f32,
    /// Percent
    pub battery_charge: f32,
    pub camera_angle: f32,
    pub roll_setpoint: f32,
    pub pitch_setpoint: f32,
}

impl TelemetryPacket {
    /// Parse a datagram. Anything but exactly 44 bytes is rejected whole.
    pub fn parse(data: &[u8]) -> Result<Self, TelemetryError> {
        if data.len() != TELEMETRY_PACKET_LEN {
            return Err(TelemetryError::BadLength {
                expected: TELEMETRY_PACKET_LEN,
                actual: data.len(),
            });
        }
        let mut buf = data;
        Ok(Self {
            flags: buf.get_u64_le(),
            roll: buf.get_f32_le(),
            pitch: buf.get_f32_le(),
            yaw: buf.get_f32_le(),
            depth: buf.get_f32_le(),
            battery_voltage: buf.get_f32_le(),
            battery_charge: buf.get_f32_le(),
            camera_angle: buf.get_f32_le(),
            roll_setpoint: buf.get_f32_le(),
            pitch_setpoint: buf.get_f32_le(),
        })
    }

    pub fn pack(&self) -> [u8; TELEMETRY_PACKET_LEN] {
        let mut buf = BytesMut::with_capacity(TELEMETRY_PACKET_LEN);
        buf.put_u64_le(self.flags);
        for value in [
            self.roll,
            self.pitch,
            self.yaw,
            self.depth,
            self.battery_voltage,
            self.battery_charge,
            self.camera_angle,
            self.roll_setpoint,
            self.pitch_setpoint,
        ] {
            buf.put_f32_le(value);
        }
        let mut out = [0u8; TELEMETRY_PACKET_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn flag(&self, bit: u32) -> bool {
        bit < 64 && self.flags & (1 << bit) != 0
    }
}

/// Receives telemetry datagrams into a shared snapshot and sends control
/// datagrams to the vehicle.
pub struct TelemetryLink {
    socket: Arc<UdpSocket>,
    vehicle: SocketAddr,
    latest: Arc<ArcSwap<TelemetryPacket>>,
    _worker: Worker,
}

impl TelemetryLink {
    pub fn bind(config: &TelemetryConfig, latest: Arc<ArcSwap<TelemetryPacket>>) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind)?;
        socket.set_read_timeout(Some(Duration::from_millis(config.read_timeout_ms.max(1))))?;
        let socket = Arc::new(socket);
        info!(bind = %socket.local_addr()?, vehicle = %config.vehicle, "Telemetry link up");

        let rx = socket.clone();
        let target = latest.clone();
        let worker = Worker::spawn("telemetry", move |stop| {
            let mut buf = [0u8; 512];
            while !stop.is_set() {
                match rx.recv_from(&mut buf) {
                    Ok((len, peer)) => match TelemetryPacket::parse(&buf[..len]) {
                        Ok(packet) => target.store(Arc::new(packet)),
                        Err(e) => {
                            debug!(%peer, error = %e, "Malformed telemetry datagram");
                            metrics::counter!("chersonesos_telemetry_malformed").increment(1);
                        }
                    },
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                    Err(e) => {
                        warn!(error = %e, "Telemetry receive failed");
                        stop.sleep(Duration::from_millis(100));
                    }
                }
            }
        })?;

        Ok(Self {
            socket,
            vehicle: config.vehicle,
            latest,
            _worker: worker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Latest valid packet (default values until the first one arrives)
    pub fn latest(&self) -> TelemetryPacket {
        **self.latest.load()
    }

    /// Send a raw control datagram to the vehicle
    pub fn send_control(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, self.vehicle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sample() -> TelemetryPacket {
        TelemetryPacket {
            flags: 0b1010,
            roll: -12.5,
            pitch: 3.25,
            yaw: 271.0,
            depth: 14.75,
            battery_voltage: 15.9,
            battery_charge: 82.0,
            camera_angle: -30.0,
            roll_setpoint: 0.5,
            pitch_setpoint: -1.5,
        }
    }

    #[test]
    fn test_pack_parse_round_trip() {
        let packet = sample();
        let bytes = packet.pack();
        assert_eq!(bytes.len(), TELEMETRY_PACKET_LEN);
        assert_eq!(&bytes[..8], &0b1010u64.to_le_bytes());
        assert_eq!(TelemetryPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let bytes = sample().pack();
        for len in [0, 8, 43] {
            assert_eq!(
                TelemetryPacket::parse(&bytes[..len]),
                Err(TelemetryError::BadLength { expected: 44, actual: len })
            );
        }
        let mut long = bytes.to_vec();
        long.push(0);
        assert!(TelemetryPacket::parse(&long).is_err());
    }

    #[test]
    fn test_flags() {
        let packet = sample();
        assert!(packet.flag(1));
        assert!(!packet.flag(0));
        assert!(!packet.flag(64));
    }

    #[test]
    fn test_link_updates_snapshot() {
        let config = TelemetryConfig {
            enabled: true,
            bind: "127.0.0.1:0".parse().unwrap(),
            vehicle: "127.0.0.1:9".parse().unwrap(),
            read_timeout_ms: 10,
        };
        let latest = Arc::new(ArcSwap::from_pointee(TelemetryPacket::default()));
        let link = TelemetryLink::bind(&config, latest.clone()).unwrap();
        let addr = link.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[1, 2, 3], addr).unwrap();
        sender.send_to(&sample().pack(), addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while link.latest() != sample() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(link.latest(), sample());
    }
}
