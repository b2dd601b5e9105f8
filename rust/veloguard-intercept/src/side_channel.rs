//! Device side channel
//!
//! A small UDP protocol spoken with the capturing device to learn which
//! application owns a flow. The channel is optional: when it cannot be
//! reached every lookup reports [`AppIdentity::Unknown`].
//!
//! Strings use a u16 big-endian length followed by UTF-8 bytes.

use crate::error::{InterceptError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

pub const MSG_QUERY_APPLICATIONS: u8 = 0x02;
pub const MSG_HELLO: u8 = 0x08;

const MAX_REPLY: usize = 1024;

/// Owning application(s) of a flow as reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppIdentity {
    Known(Vec<String>),
    Unknown,
}

impl AppIdentity {
    pub fn is_known(&self) -> bool {
        matches!(self, AppIdentity::Known(_))
    }
}

impl fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppIdentity::Known(apps) => write!(f, "{}", apps.join(",")),
            AppIdentity::Unknown => write!(f, "unknown"),
        }
    }
}

fn short(expected: usize, actual: usize) -> InterceptError {
    InterceptError::PacketTooShort { expected, actual }
}

/// Read one length-prefixed string
pub fn read_string(buf: &mut impl Buf) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(short(2, buf.remaining()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(short(len, buf.remaining()));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw)
        .map_err(|_| InterceptError::SideChannel("string is not UTF-8".into()))
}

pub fn write_string(buf: &mut impl BufMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| InterceptError::SideChannel(format!("string of {} bytes", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Installed package record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub package_name: String,
    pub label: String,
    pub version_code: i64,
}

impl Package {
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let package_name = read_string(buf)?;
        let label = read_string(buf)?;
        if buf.remaining() < 8 {
            return Err(short(8, buf.remaining()));
        }
        let version_code = buf.get_i64();
        Ok(Self {
            package_name,
            label,
            version_code,
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        write_string(buf, &self.package_name)?;
        write_string(buf, &self.label)?;
        buf.put_i64(self.version_code);
        Ok(())
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label, self.package_name)
    }
}

/// Encode an application query for `hash`
pub fn encode_query(hash: i32) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = MSG_QUERY_APPLICATIONS;
    out[1..].copy_from_slice(&hash.to_be_bytes());
    out
}

/// Decode the reply to a query for `hash`
pub fn decode_reply(hash: i32, mut reply: &[u8]) -> Result<Vec<String>> {
    if reply.remaining() < 6 {
        return Err(short(6, reply.remaining()));
    }
    let msg = reply.get_u8();
    let echoed = reply.get_i32();
    if msg != MSG_QUERY_APPLICATIONS || echoed != hash {
        return Err(InterceptError::SideChannel(format!(
            "unexpected reply 0x{:02x} for hash {}",
            msg, echoed
        )));
    }
    let count = reply.get_u8() as usize;
    let mut apps = Vec::with_capacity(count);
    for _ in 0..count {
        apps.push(read_string(&mut reply)?);
    }
    Ok(apps)
}

pub struct DeviceChannel {
    socket: UdpSocket,
    device: SocketAddr,
    timeout: Duration,
    // one request in flight at a time so replies cannot cross
    lock: Mutex<()>,
}

impl DeviceChannel {
    /// Open the channel with a one-byte hello exchange. `None` when the
    /// device does not answer in time.
    pub async fn connect(device: SocketAddr, timeout: Duration) -> Option<Self> {
        match Self::try_connect(device, timeout).await {
            Ok(channel) => {
                debug!("Device side channel to {} ready", device);
                Some(channel)
            }
            Err(e) => {
                debug!("Device side channel to {} unavailable: {}", device, e);
                None
            }
        }
    }

    async fn try_connect(device: SocketAddr, timeout: Duration) -> Result<Self> {
        let bind = match device.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind, 0)).await?;
        socket.send_to(&[MSG_HELLO], device).await?;

        let mut ack = [0u8; 16];
        let (n, _) = tokio::time::timeout(timeout, socket.recv_from(&mut ack))
            .await
            .map_err(|_| InterceptError::Timeout("side channel hello".into()))??;
        if n != 1 || ack[0] != MSG_HELLO {
            return Err(InterceptError::SideChannel(format!(
                "bad hello ack: {:02x?}",
                &ack[..n]
            )));
        }
        Ok(Self {
            socket,
            device,
            timeout,
            lock: Mutex::new(()),
        })
    }

    pub fn device(&self) -> SocketAddr {
        self.device
    }

    /// Ask the device which applications match `hash`
    pub async fn query_applications(&self, hash: i32) -> AppIdentity {
        match self.try_query(hash).await {
            Ok(apps) if !apps.is_empty() => AppIdentity::Known(apps),
            Ok(_) => AppIdentity::Unknown,
            Err(e) => {
                debug!("queryApplications hash={} via {} failed: {}", hash, self.device, e);
                AppIdentity::Unknown
            }
        }
    }

    async fn try_query(&self, hash: i32) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        self.socket.send_to(&encode_query(hash), self.device).await?;

        let mut buf = BytesMut::zeroed(MAX_REPLY);
        let (n, _) = tokio::time::timeout(self.timeout, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| InterceptError::Timeout("side channel query".into()))??;
        decode_reply(hash, &buf[..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake_device;

    #[tokio::test]
    async fn test_query_known_application() {
        let device = fake_device(vec!["com.example.app", "com.example.shared"]).await;
        let channel = DeviceChannel::connect(device, Duration::from_millis(1500))
            .await
            .expect("hello answered");
        assert_eq!(
            channel.query_applications(10123).await,
            AppIdentity::Known(vec![
                "com.example.app".to_string(),
                "com.example.shared".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_empty_reply_is_unknown() {
        let device = fake_device(vec![]).await;
        let channel = DeviceChannel::connect(device, Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(channel.query_applications(1).await, AppIdentity::Unknown);
    }

    #[tokio::test]
    async fn test_silent_device_is_unavailable() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel =
            DeviceChannel::connect(silent.local_addr().unwrap(), Duration::from_millis(100)).await;
        assert!(channel.is_none());
    }

    #[test]
    fn test_reply_hash_must_match() {
        let mut reply = vec![MSG_QUERY_APPLICATIONS];
        reply.extend_from_slice(&7i32.to_be_bytes());
        reply.push(1);
        write_string(&mut reply, "com.example").unwrap();
        assert_eq!(decode_reply(7, &reply).unwrap(), vec!["com.example"]);
        assert!(decode_reply(8, &reply).is_err());
        assert!(decode_reply(7, &reply[..reply.len() - 1]).is_err());
    }

    #[test]
    fn test_package_codec() {
        let pkg = Package {
            package_name: "com.example.app".into(),
            label: "Example".into(),
            version_code: 42,
        };
        let mut buf = BytesMut::new();
        pkg.encode(&mut buf).unwrap();
        let mut frozen = buf.freeze();
        assert_eq!(Package::decode(&mut frozen).unwrap(), pkg);
        assert_eq!(pkg.to_string(), "Example(com.example.app)");
        assert!(Package::decode(&mut &[0u8, 3, b'a'][..]).is_err());
    }

    #[test]
    fn test_query_encoding() {
        assert_eq!(encode_query(-2), [0x02, 0xff, 0xff, 0xff, 0xfe]);
    }
}
