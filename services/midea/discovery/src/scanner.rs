//! UDP probe loop.

use crate::error::DiscoveryError;
use crate::network::broadcast_addresses;
use crate::reply::{device_id_from_info, parse_reply, DiscoveredDevice, Reply};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Ports the probe is sent to
pub const DISCOVERY_PORTS: [u16; 2] = [6445, 20086];

/// Receive buffer for replies
pub const RECV_BUFFER_SIZE: usize = 512;

/// Probe datagram
pub const BROADCAST_MSG: [u8; 72] = [
    0x5A, 0x5A, 0x01, 0x11, 0x48, 0x00, 0x92, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x7F, 0x75, 0xBD, 0x6B, 0x3E, 0x4F, 0x8B, 0x76, //
    0x2E, 0x84, 0x9C, 0x6E, 0x57, 0x8D, 0x65, 0x90, //
    0x03, 0x6E, 0x9D, 0x43, 0x42, 0xA5, 0x0F, 0x1F, //
    0x56, 0x9E, 0xB8, 0xEC, 0x91, 0x8E, 0x92, 0xE5, //
];

/// Device-info request sent over TCP to V1 appliances
pub const DEVICE_INFO_MSG: [u8; 56] = [
    0x5A, 0x5A, 0x15, 0x00, 0x00, 0x38, 0x00, 0x04, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x27, 0x33, 0x05, //
    0x13, 0x06, 0x14, 0x14, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x03, 0xE8, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0xCA, 0x8D, 0x9B, 0xF9, 0xA0, 0x30, 0x1A, 0xE3, //
    0xB7, 0xE4, 0x2D, 0x53, 0x49, 0x47, 0x62, 0xBE, //
];

/// Discovery timing and targets
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Stop after this long without a reply
    pub timeout: Duration,
    /// Limit for the V1 device-info query
    pub device_info_timeout: Duration,
    /// Destination ports of the probe
    pub ports: Vec<u16>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            device_info_timeout: Duration::from_secs(8),
            ports: DISCOVERY_PORTS.to_vec(),
        }
    }
}

/// Broadcasts the probe and collects replies
#[derive(Debug, Clone, Default)]
pub struct Discoverer {
    config: DiscoveryConfig,
}

impl Discoverer {
    /// Discoverer with the given settings
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Probe `address`, or every private broadcast address when `None`.
    ///
    /// Collects replies until none arrives for the configured timeout.
    /// Devices whose family code is not in `filter` are skipped; an empty
    /// filter accepts all.
    pub async fn discover(
        &self,
        filter: &[u8],
        address: Option<Ipv4Addr>,
    ) -> Result<BTreeMap<u64, DiscoveredDevice>, DiscoveryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let targets = match address {
            Some(address) => vec![address],
            None => broadcast_addresses(),
        };
        debug!("All addresses for broadcast: {:?}", targets);

        for target in &targets {
            for port in &self.config.ports {
                if let Err(e) = socket.send_to(&BROADCAST_MSG, (*target, *port)).await {
                    warn!("Can't access network {}:{}: {}", target, port, e);
                }
            }
        }

        let mut found = BTreeMap::new();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let received = timeout(self.config.timeout, socket.recv_from(&mut buf)).await;
            let (len, source) = match received {
                Err(_) => break,
                Ok(Err(e)) => {
                    error!("Socket error: {}", e);
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            let IpAddr::V4(ip) = source.ip() else {
                continue;
            };
            let data = &buf[..len];
            debug!("Received response from {}: {}", source, hex::encode(data));

            let device = match parse_reply(data, ip) {
                Ok(Some(Reply::Device(device))) => {
                    if found.contains_key(&device.device_id) {
                        continue;
                    }
                    device
                }
                Ok(Some(Reply::Legacy(mut device))) => {
                    let response = self.get_device_info(ip, device.port).await;
                    device.device_id = device_id_from_info(&response).unwrap_or_else(|e| {
                        warn!("Invalid device info from {}: {}", ip, e);
                        0
                    });
                    device
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("Invalid discovery reply from {}: {}", source, e);
                    continue;
                }
            };

            if filter.is_empty() || filter.contains(&device.device_type) {
                info!(
                    "Found device {} type {:#04x} at {}:{}",
                    device.device_id, device.device_type, device.ip_address, device.port
                );
                found.insert(device.device_id, device);
            } else {
                debug!("Found an unsupported device: {:?}", device);
            }
        }

        Ok(found)
    }

    /// Ask a V1 appliance for its device info.
    ///
    /// Failures are logged and yield an empty response.
    pub async fn get_device_info(&self, ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let address = SocketAddrV4::new(ip, port);
        match timeout(self.config.device_info_timeout, query_device_info(address)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Can't connect to device {}: {}", address, e);
                Vec::new()
            }
            Err(_) => {
                warn!(
                    "Connect the device {} timed out for {:?}",
                    address, self.config.device_info_timeout
                );
                Vec::new()
            }
        }
    }
}

async fn query_device_info(address: SocketAddrV4) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(address).await?;
    debug!("Sending to {} {}", address, hex::encode(DEVICE_INFO_MSG));
    stream.write_all(&DEVICE_INFO_MSG).await?;

    let mut response = vec![0u8; RECV_BUFFER_SIZE];
    let n = stream.read(&mut response).await?;
    response.truncate(n);
    Ok(response)
}

/// Probe with the default settings
pub async fn discover(
    filter: &[u8],
    address: Option<Ipv4Addr>,
) -> Result<BTreeMap<u64, DiscoveredDevice>, DiscoveryError> {
    Discoverer::default().discover(filter, address).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::tests::V2_REPLY;
    use midea_wire::ProtocolVersion;
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            timeout: Duration::from_millis(300),
            device_info_timeout: Duration::from_secs(2),
            ports: vec![port],
        }
    }

    async fn responder() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[tokio::test]
    async fn test_discover_v2_device() {
        let (device, port) = responder().await;
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &BROADCAST_MSG[..]);
            // duplicate answers are collapsed
            device.send_to(&V2_REPLY, from).await.unwrap();
            device.send_to(&V2_REPLY, from).await.unwrap();
        });

        let found = Discoverer::new(test_config(port))
            .discover(&[], Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        task.await.unwrap();

        assert_eq!(found.len(), 1);
        let device = &found[&151732605161920];
        assert_eq!(device.ip_address, Ipv4Addr::LOCALHOST);
        assert_eq!(device.device_type, 0xAC);
        assert_eq!(device.protocol, ProtocolVersion::V2);
    }

    #[tokio::test]
    async fn test_discover_filters_types() {
        let (device, port) = responder().await;
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(&V2_REPLY, from).await.unwrap();
        });

        let found = Discoverer::new(test_config(port))
            .discover(&[0xA1], Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        task.await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_discover_v1_device() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let tcp_port = listener.local_addr().unwrap().port();
        let info = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 56];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, DEVICE_INFO_MSG);

            let mut response = vec![0u8; 64];
            response.extend_from_slice(
                br#"<?xml version="1.0"?><root><smartDevice devId="c0110800008a"/></root>"#,
            );
            response.extend_from_slice(&[0u8; 16]);
            stream.write_all(&response).await.unwrap();
        });

        let (device, port) = responder().await;
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            let reply = format!(
                r#"<?xml version="1.0"?><root><body><device apc_sn="000000P0000000Q1A0123456789AB000" apc_type="161" port="{}"/></body></root>"#,
                tcp_port
            );
            device.send_to(reply.as_bytes(), from).await.unwrap();
        });

        let found = Discoverer::new(test_config(port))
            .discover(&[], Some(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        task.await.unwrap();
        info.await.unwrap();

        let device = &found[&151732605161920];
        assert_eq!(device.device_type, 0xA1);
        assert_eq!(device.port, tcp_port);
        assert_eq!(device.model, "00000Q1A");
        assert_eq!(device.protocol, ProtocolVersion::V1);
    }

    #[tokio::test]
    async fn test_device_info_unreachable() {
        // bind then drop to get a closed port
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let response = Discoverer::default()
            .get_device_info(Ipv4Addr::LOCALHOST, port)
            .await;
        assert!(response.is_empty());
    }
}
