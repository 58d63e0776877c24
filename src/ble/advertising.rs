//! Advertisement snapshots and target matching.
//!
//! A [`PeripheralDescriptor`] is what the scanner hands back for each
//! advertisement; a [`DeviceMatcher`] decides whether it is the echo
//! peripheral we are looking for.

use std::fmt;

use uuid::Uuid;

/// Snapshot of one advertising peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralDescriptor {
    /// Backend handle used to reconnect to this peripheral.
    pub identifier: String,
    /// Address for display and de-duplication.
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Advertised service UUIDs, as the backend reported them.
    pub service_uuids: Vec<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl PeripheralDescriptor {
    /// Create a descriptor whose identifier and address are the same string.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            identifier: address.clone(),
            address,
            ..Default::default()
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an advertised service UUID.
    pub fn with_service(mut self, uuid: impl ToString) -> Self {
        self.service_uuids.push(uuid.to_string());
        self
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Name for display, falling back to the address.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.address,
        }
    }
}

impl fmt::Display for PeripheralDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]",
            self.name.as_deref().unwrap_or("(no name)"),
            self.address
        )?;
        if let Some(rssi) = self.rssi {
            write!(f, " rssi: {} dBm", rssi)?;
        }
        if !self.service_uuids.is_empty() {
            write!(f, " services: {}", self.service_uuids.join(", "))?;
        }
        Ok(())
    }
}

/// Predicate selecting the echo peripheral from a stream of advertisements.
///
/// A peripheral matches when its name equals the target name exactly, or when
/// one of its advertised service UUIDs contains the target service UUID,
/// ignoring case. An empty target name disables the name check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatcher {
    target_name: String,
    service_uuid: String,
}

impl DeviceMatcher {
    /// Create a matcher for the given name and service UUID.
    pub fn new(target_name: impl Into<String>, service_uuid: Uuid) -> Self {
        Self {
            target_name: target_name.into(),
            service_uuid: service_uuid.to_string().to_lowercase(),
        }
    }

    /// The name this matcher looks for.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Check a descriptor against the target.
    pub fn matches(&self, descriptor: &PeripheralDescriptor) -> bool {
        self.matches_parts(descriptor.name.as_deref(), &descriptor.service_uuids)
    }

    /// Check raw advertisement fields against the target.
    pub fn matches_parts<S: AsRef<str>>(&self, name: Option<&str>, service_uuids: &[S]) -> bool {
        let name = name.unwrap_or("");
        if !self.target_name.is_empty() && name == self.target_name {
            return true;
        }
        service_uuids
            .iter()
            .any(|uuid| uuid.as_ref().to_lowercase().contains(&self.service_uuid))
    }
}

impl fmt::Display for DeviceMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.target_name.is_empty() {
            write!(f, "service {}", self.service_uuid)
        } else {
            write!(f, "`{}` or service {}", self.target_name, self.service_uuid)
        }
    }
}
