use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::DiscoveryError;

/// What to announce on the local network for one emulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub instance_name: String,
    pub host_name: String,
    pub port: u16,
    /// Fully qualified service types, e.g. `_http._tcp.local.`.
    pub service_types: Vec<String>,
    pub properties: HashMap<String, String>,
}

impl Advertisement {
    /// One `ServiceInfo` per service type, addresses filled in by the daemon.
    pub fn service_infos(&self) -> Result<Vec<ServiceInfo>, DiscoveryError> {
        self.service_types
            .iter()
            .map(|service_type| {
                let info = ServiceInfo::new(
                    service_type,
                    &self.instance_name,
                    &self.host_name,
                    "",
                    self.port,
                    self.properties.clone(),
                )?
                .enable_addr_auto();
                Ok(info)
            })
            .collect()
    }
}

/// Keeps an mDNS responder alive for as long as the device is served.
pub struct Advertiser {
    daemon: ServiceDaemon,
    registered: Vec<String>,
}

impl Advertiser {
    pub fn start(advertisement: &Advertisement) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        let mut registered = Vec::new();
        for info in advertisement.service_infos()? {
            let fullname = info.get_fullname().to_string();
            info!("mDNS: registering {}", fullname);
            daemon.register(info)?;
            registered.push(fullname);
        }
        info!(
            "mDNS: advertising {} on port {}",
            advertisement.instance_name, advertisement.port
        );
        Ok(Self { daemon, registered })
    }

    pub fn stop(self) {
        for fullname in &self.registered {
            if let Err(e) = self.daemon.unregister(fullname) {
                warn!("mDNS: failed to unregister {fullname}: {e}");
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS: failed to shut down responder: {e}");
        }
        info!("mDNS: unregistered services");
    }
}
