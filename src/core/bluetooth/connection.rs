//! Connection establishment for the cart
//! This module connects to a peripheral and locates the cart service and its
//! inbound/outbound characteristics.

use std::time::Duration;

use log::{info, warn};
use uuid::Uuid;

use crate::config::link_config::LinkConfig;
use crate::core::bluetooth::error::LinkError;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{LinkHandle, PeripheralRef, ServiceInfo};

/// The resolved GATT endpoints of a cart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CartEndpoints {
    pub service: Uuid,
    pub inbound: Uuid,
    pub outbound: Uuid,
}

fn uuid_contains(uuid: &Uuid, fragment: &str) -> bool {
    // Uuid displays as lowercase hyphenated
    uuid.to_string().contains(&fragment.to_ascii_lowercase())
}

/// Locates the cart service and its characteristics by UUID fragment.
pub fn resolve_endpoints(
    services: &[ServiceInfo],
    config: &LinkConfig,
) -> Result<CartEndpoints, LinkError> {
    let service = services
        .iter()
        .find(|s| uuid_contains(&s.uuid, &config.service_fragment))
        .ok_or_else(|| {
            for service in services {
                info!("Available service: {}", service.uuid);
            }
            LinkError::ServiceNotFound(config.service_fragment.clone())
        })?;
    info!("Found cart service: {}", service.uuid);

    let find_characteristic = |fragment: &str| {
        service
            .characteristics
            .iter()
            .copied()
            .find(|uuid| uuid_contains(uuid, fragment))
            .ok_or_else(|| LinkError::CharacteristicNotFound(fragment.to_string()))
    };
    let inbound = find_characteristic(&config.inbound_fragment)?;
    info!("Found inbound characteristic: {}", inbound);
    let outbound = find_characteristic(&config.outbound_fragment)?;
    info!("Found outbound characteristic: {}", outbound);

    Ok(CartEndpoints {
        service: service.uuid,
        inbound,
        outbound,
    })
}

/// Runs the connect and resolve stages against a transport
pub struct ConnectionManager<'a> {
    transport: &'a dyn Transport,
    config: &'a LinkConfig,
}

impl<'a> ConnectionManager<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a LinkConfig) -> Self {
        Self { transport, config }
    }

    /// Opens the connection, bounded by the connect timeout
    pub async fn connect(&self, peripheral: &PeripheralRef) -> Result<(), LinkError> {
        info!(
            "Device details - ID: {}, Name: {:?}",
            peripheral.id, peripheral.name
        );
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, self.transport.connect(&peripheral.id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::connection_failed(&peripheral.id, e)),
            Err(_) => Err(LinkError::connection_failed(
                &peripheral.id,
                format!("timed out after {} ms", self.config.connect_timeout_ms),
            )),
        }
    }

    /// Discovers services and builds the link handle
    pub async fn resolve(&self, peripheral: &PeripheralRef) -> Result<LinkHandle, LinkError> {
        info!("Connection successful, discovering services...");
        let timeout = Duration::from_millis(self.config.resolve_timeout_ms);
        let services =
            match tokio::time::timeout(timeout, self.transport.discover_services(&peripheral.id))
                .await
            {
                Ok(Ok(services)) => services,
                Ok(Err(e)) => return Err(LinkError::connection_failed(&peripheral.id, e)),
                Err(_) => {
                    return Err(LinkError::connection_failed(
                        &peripheral.id,
                        format!(
                            "service discovery timed out after {} ms",
                            self.config.resolve_timeout_ms
                        ),
                    ));
                }
            };

        let endpoints = resolve_endpoints(&services, self.config)?;
        Ok(LinkHandle {
            peripheral: peripheral.clone(),
            service: endpoints.service,
            inbound: endpoints.inbound,
            outbound: endpoints.outbound,
        })
    }

    /// Drops a partially established connection. Failures are only logged.
    pub async fn abandon(&self, peripheral_id: &str) {
        if let Err(e) = self.transport.disconnect(peripheral_id).await {
            warn!("Failed to drop partial connection to {}: {}", peripheral_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid16(short: u16) -> Uuid {
        Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_00805f9b34fb)
    }

    fn cart_service() -> ServiceInfo {
        ServiceInfo {
            uuid: uuid16(0xfff0),
            characteristics: vec![uuid16(0xfff1), uuid16(0xfff2)],
        }
    }

    fn battery_service() -> ServiceInfo {
        ServiceInfo {
            uuid: uuid16(0x180f),
            characteristics: vec![uuid16(0x2a19)],
        }
    }

    #[test]
    fn test_resolve_cart_endpoints() {
        let services = vec![battery_service(), cart_service()];
        let endpoints = resolve_endpoints(&services, &LinkConfig::default()).unwrap();
        assert_eq!(endpoints.service, uuid16(0xfff0));
        assert_eq!(endpoints.inbound, uuid16(0xfff2));
        assert_eq!(endpoints.outbound, uuid16(0xfff1));
    }

    #[test]
    fn test_fragment_match_ignores_case() {
        let config = LinkConfig {
            service_fragment: "FFF0".to_string(),
            ..LinkConfig::default()
        };
        assert!(resolve_endpoints(&[cart_service()], &config).is_ok());
    }

    #[test]
    fn test_missing_service() {
        let err = resolve_endpoints(&[battery_service()], &LinkConfig::default()).unwrap_err();
        assert!(matches!(err, LinkError::ServiceNotFound(ref f) if f == "fff0"));
    }

    #[test]
    fn test_missing_characteristic() {
        let mut service = cart_service();
        service.characteristics.retain(|c| *c != uuid16(0xfff2));
        let err = resolve_endpoints(&[service], &LinkConfig::default()).unwrap_err();
        assert!(matches!(err, LinkError::CharacteristicNotFound(ref f) if f == "fff2"));
    }
}
