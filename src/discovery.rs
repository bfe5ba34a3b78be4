//! mDNS discovery glue.
//!
//! Resonate uses two service types: clients advertise themselves under
//! [`CLIENT_SERVICE`] (server-initiated connections) and servers under
//! [`SERVER_SERVICE`] (client-initiated connections); a server supports
//! both modes. This module is a thin adapter over `mdns-sd` (no system
//! daemon dependency): resolved services become `{address, port, path}`
//! records, records become WebSocket URLs, and URLs feed the reconnect
//! driver. Identifier uniqueness stays with the application; duplicate
//! `client_id` conflicts are resolved at handshake time by the server.

use std::net::IpAddr;
use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::{Error, Result};
use crate::reconnect::ReconnectDriver;

/// Service type under which clients advertise themselves.
pub const CLIENT_SERVICE: &str = "_resonate._tcp.local.";

/// Service type under which servers advertise themselves.
pub const SERVER_SERVICE: &str = "_resonate-server._tcp.local.";

/// TXT key carrying the WebSocket path.
const PATH_KEY: &str = "path";

/// One discovered peer.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Record {
    /// Resolved address.
    pub address: IpAddr,
    /// Advertised port.
    pub port: u16,
    /// WebSocket path from the `path` TXT entry.
    pub path: String,
}

impl Record {
    /// Extracts a record from a resolved mDNS service.
    ///
    /// Services without an address are skipped; a missing `path` TXT
    /// entry falls back to the protocol default.
    #[must_use]
    pub fn from_service(info: &ServiceInfo) -> Option<Self> {
        let address = info.get_addresses().iter().next().copied()?;
        let path = info
            .get_property_val_str(PATH_KEY)
            .unwrap_or(crate::config::DEFAULT_PATH)
            .to_string();
        Some(Self {
            address,
            port: info.get_port(),
            path,
        })
    }

    /// The WebSocket URL this record resolves to.
    #[must_use]
    pub fn ws_url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match self.address {
            IpAddr::V4(v4) => format!("ws://{v4}:{}{path}", self.port),
            IpAddr::V6(v6) => format!("ws://[{v6}]:{}{path}", self.port),
        }
    }
}

/// Handle over the mDNS daemon: advertisement plus browse tasks.
pub struct Discovery {
    daemon: ServiceDaemon,
}

impl Discovery {
    /// Starts the mDNS daemon.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the daemon cannot bind its sockets.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::transport(format!("mdns daemon failed: {e}")))?;
        Ok(Self { daemon })
    }

    /// Advertises this endpoint under `service_type`.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when registration fails.
    pub fn advertise(
        &self,
        service_type: &str,
        instance: &str,
        address: IpAddr,
        port: u16,
        path: &str,
    ) -> Result<()> {
        let hostname = format!("{}.local.", instance.replace(' ', "-"));
        let info = ServiceInfo::new(
            service_type,
            instance,
            &hostname,
            address,
            port,
            &[(PATH_KEY, path)][..],
        )
        .map_err(|e| Error::transport(format!("mdns service info: {e}")))?;
        self.daemon
            .register(info)
            .map_err(|e| Error::transport(format!("mdns register: {e}")))?;
        info!("advertising {instance} on {service_type}");
        Ok(())
    }

    /// Browses `service_type` and feeds every resolved record's URL to
    /// the reconnect driver. Runs until the daemon shuts down.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the browse request fails; resolution
    /// failures after that are logged and skipped.
    pub fn browse(&self, service_type: &str, driver: Arc<ReconnectDriver>) -> Result<()> {
        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| Error::transport(format!("mdns browse: {e}")))?;
        let service_type = service_type.to_string();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(record) = Record::from_service(&info) else {
                            debug!("ignoring addressless service {}", info.get_fullname());
                            continue;
                        };
                        let url = record.ws_url();
                        info!("discovered {} at {url}", info.get_fullname());
                        driver.connect(&url);
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        // Peers going away are noticed by the transport;
                        // the retry loop keeps the slot for their return.
                        debug!("{fullname} left {service_type}");
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }

    /// Browses `service_type` until one record resolves, bounded by
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when browsing fails and `NotFound` when
    /// nothing resolves within the timeout.
    pub async fn wait_for(
        &self,
        service_type: &str,
        timeout: std::time::Duration,
    ) -> Result<Record> {
        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| Error::transport(format!("mdns browse: {e}")))?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, receiver.recv_async())
                .await
                .map_err(|_| Error::not_found(format!("no {service_type} service found")))?;
            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if let Some(record) = Record::from_service(&info) {
                        return Ok(record);
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(Error::transport(format!("mdns browse ended: {e}"))),
            }
        }
    }

    /// Stops advertising and browsing.
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("mdns shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn record_builds_ws_urls() {
        let record = Record {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 8927,
            path: "/resonate".to_string(),
        };
        assert_eq!(record.ws_url(), "ws://192.168.1.20:8927/resonate");

        let v6 = Record {
            address: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port: 8927,
            path: "resonate".to_string(),
        };
        assert_eq!(v6.ws_url(), "ws://[::1]:8927/resonate");
    }

    #[test]
    fn service_types_match_the_protocol() {
        assert_eq!(CLIENT_SERVICE, "_resonate._tcp.local.");
        assert_eq!(SERVER_SERVICE, "_resonate-server._tcp.local.");
    }
}
