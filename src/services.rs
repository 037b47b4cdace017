//! Service registry for the responder.
//!
//! This module owns the collection of registered services, their derived
//! record sets, and the instance-name bookkeeping the conflict-rename path
//! depends on. Instance names are unique per registry, case-insensitively,
//! at all times.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use multimap::MultiMap;

use crate::error::{Error, Result};
use crate::name::Name;
use crate::proto::{RecordType, MAX_LABEL_LEN, TTL_HOST, TTL_SERVICE};
use crate::wire::{record, RData, ResourceRecord};

/// Thread-safe handle to the registry. The response path takes the read
/// side; register/rename/unregister take the write side.
pub type Services = Arc<RwLock<ServicesInner>>;

/// A service as the caller describes it.
#[derive(Clone, Debug)]
pub struct Service {
    /// Human-readable instance name, one DNS label (1-63 bytes of UTF-8,
    /// no dots).
    pub instance: String,
    /// Service type in `_name._proto` form, proto being `_tcp` or `_udp`.
    pub service_type: String,
    /// Always `"local"`; anything else is rejected.
    pub domain: String,
    /// Port the service listens on; zero is rejected.
    pub port: u16,
    /// TXT key/value pairs, emitted as `key=value` strings.
    pub txt: Vec<(String, String)>,
}

impl Service {
    pub fn new(instance: &str, service_type: &str, port: u16) -> Service {
        Service {
            instance: instance.to_owned(),
            service_type: service_type.to_owned(),
            domain: "local".to_owned(),
            port,
            txt: Vec::new(),
        }
    }

    pub fn with_txt(mut self, key: &str, value: &str) -> Service {
        self.txt.push((key.to_owned(), value.to_owned()));
        self
    }
}

/// A validated service with its derived names and wire-ready TXT strings.
#[derive(Clone, Debug)]
pub struct ServiceData {
    pub instance: String,
    /// `<type>.local`
    pub type_name: Name,
    /// `<instance>.<type>.local`
    pub fqdn: Name,
    pub port: u16,
    pub txt: Vec<Vec<u8>>,
}

impl ServiceData {
    /// Validates caller input into a usable service description.
    pub fn from_service(service: &Service) -> Result<ServiceData> {
        if service.domain != "local" {
            return Err(Error::validation(
                "domain",
                &service.domain,
                "mDNS services live in the \"local\" domain",
            ));
        }
        if service.port == 0 {
            return Err(Error::validation(
                "port",
                service.port,
                "port must be 1-65535",
            ));
        }
        validate_instance(&service.instance)?;

        let type_name = validate_service_type(&service.service_type)?;
        let fqdn = type_name.prefixed(&service.instance)?;

        let mut txt = Vec::with_capacity(service.txt.len());
        for (key, value) in &service.txt {
            if key.is_empty() {
                return Err(Error::validation("txt", key, "TXT key is empty"));
            }
            let entry = format!("{}={}", key, value);
            if entry.len() > 255 {
                return Err(Error::validation(
                    "txt",
                    &entry,
                    "TXT entry exceeds 255 bytes",
                ));
            }
            txt.push(entry.into_bytes());
        }

        Ok(ServiceData {
            instance: service.instance.clone(),
            type_name,
            fqdn,
            port: service.port,
            txt,
        })
    }

    /// This service under a different instance name, for conflict renames.
    pub fn renamed(&self, instance: String) -> Result<ServiceData> {
        validate_instance(&instance)?;
        let fqdn = self.type_name.prefixed(&instance)?;
        Ok(ServiceData {
            instance,
            type_name: self.type_name.clone(),
            fqdn,
            port: self.port,
            txt: self.txt.clone(),
        })
    }

    /// The shared PTR record (`<type>.local` -> fqdn). Never cache-flush:
    /// many responders legitimately hold PTRs under the same type name.
    pub fn ptr_record(&self, ttl: u32) -> ResourceRecord {
        record(
            self.type_name.clone(),
            RecordType::Ptr,
            false,
            ttl,
            RData::Ptr(self.fqdn.clone()),
        )
    }

    pub fn srv_record(&self, hostname: &Name, ttl: u32) -> ResourceRecord {
        record(
            self.fqdn.clone(),
            RecordType::Srv,
            true,
            ttl,
            RData::Srv {
                priority: 0,
                weight: 0,
                port: self.port,
                target: hostname.clone(),
            },
        )
    }

    pub fn txt_record(&self, ttl: u32) -> ResourceRecord {
        record(
            self.fqdn.clone(),
            RecordType::Txt,
            true,
            ttl,
            RData::Txt(self.txt.clone()),
        )
    }

    /// The records probing must defend for this service: SRV and TXT under
    /// the instance name.
    pub fn service_records(&self, hostname: &Name) -> Vec<ResourceRecord> {
        vec![
            self.srv_record(hostname, TTL_HOST),
            self.txt_record(TTL_SERVICE),
        ]
    }

    /// The full authoritative set announced once probing wins.
    pub fn record_set(&self, hostname: &Name, addresses: &[Ipv4Addr]) -> Vec<ResourceRecord> {
        let mut records = vec![self.ptr_record(TTL_SERVICE)];
        records.extend(self.service_records(hostname));
        records.extend(host_records(hostname, addresses, TTL_HOST));
        records
    }

    /// The same set at TTL zero, multicast once when the service goes away.
    pub fn goodbye_set(&self, hostname: &Name) -> Vec<ResourceRecord> {
        vec![
            self.ptr_record(0),
            self.srv_record(hostname, 0),
            self.txt_record(0),
        ]
    }
}

/// One A record per interface address, cache-flush set.
pub fn host_records(hostname: &Name, addresses: &[Ipv4Addr], ttl: u32) -> Vec<ResourceRecord> {
    addresses
        .iter()
        .map(|addr| record(hostname.clone(), RecordType::A, true, ttl, RData::A(*addr)))
        .collect()
}

fn validate_instance(instance: &str) -> Result<()> {
    if instance.is_empty() {
        return Err(Error::validation(
            "instance",
            instance,
            "empty instance name",
        ));
    }
    if instance.len() > MAX_LABEL_LEN {
        return Err(Error::validation(
            "instance",
            instance,
            format!("instance name exceeds {} bytes", MAX_LABEL_LEN),
        ));
    }
    if instance.contains('.') {
        return Err(Error::validation(
            "instance",
            instance,
            "instance name may not contain '.'",
        ));
    }
    Ok(())
}

fn validate_service_type(service_type: &str) -> Result<Name> {
    let mut labels = service_type.split('.');
    let (name_label, proto_label) = match (labels.next(), labels.next(), labels.next()) {
        (Some(name), Some(proto), None) => (name, proto),
        _ => {
            return Err(Error::validation(
                "service type",
                service_type,
                "expected \"_name._proto\"",
            ));
        }
    };
    if !name_label.starts_with('_') || name_label.len() < 2 {
        return Err(Error::validation(
            "service type",
            service_type,
            "service label must begin with '_'",
        ));
    }
    if proto_label != "_tcp" && proto_label != "_udp" {
        return Err(Error::validation(
            "service type",
            service_type,
            "protocol label must be \"_tcp\" or \"_udp\"",
        ));
    }
    Name::from_str(&format!("{}.local", service_type))
}

/// Lifecycle of a registered service, advanced only by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Probing,
    Announcing,
    Established,
}

pub struct ServiceEntry {
    pub data: ServiceData,
    pub phase: Phase,
    /// Naming attempts so far, the original included.
    pub attempts: u32,
}

/// The registry proper.
pub struct ServicesInner {
    hostname: Name,
    addresses: Vec<Ipv4Addr>,
    /// Keyed by case-folded instance name.
    by_instance: HashMap<String, ServiceEntry>,
    /// Type name -> case-folded instance keys.
    by_type: MultiMap<Name, String>,
}

impl ServicesInner {
    pub fn new(hostname: Name, addresses: Vec<Ipv4Addr>) -> ServicesInner {
        ServicesInner {
            hostname,
            addresses,
            by_instance: HashMap::new(),
            by_type: MultiMap::new(),
        }
    }

    pub fn hostname(&self) -> &Name {
        &self.hostname
    }

    /// Replaces the responder hostname after a host-record conflict.
    pub fn set_hostname(&mut self, hostname: Name) {
        self.hostname = hostname;
    }

    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    /// Inserts a new service in [`Phase::Probing`]. Duplicate instance
    /// names are rejected.
    pub fn register(&mut self, data: ServiceData) -> Result<()> {
        let key = instance_key(&data.instance);
        if self.by_instance.contains_key(&key) {
            return Err(Error::validation(
                "instance",
                &data.instance,
                "instance name already registered",
            ));
        }
        self.by_type.insert(data.type_name.clone(), key.clone());
        self.by_instance.insert(
            key,
            ServiceEntry {
                data,
                phase: Phase::Probing,
                attempts: 1,
            },
        );
        Ok(())
    }

    pub fn get(&self, instance: &str) -> Option<&ServiceEntry> {
        self.by_instance.get(&instance_key(instance))
    }

    pub fn set_phase(&mut self, instance: &str, phase: Phase) {
        if let Some(entry) = self.by_instance.get_mut(&instance_key(instance)) {
            entry.phase = phase;
        }
    }

    /// Replaces a probing service's name after a conflict. The entry drops
    /// back to [`Phase::Probing`] with its attempt counter bumped.
    pub fn rename(&mut self, instance: &str, renamed: ServiceData) -> Result<()> {
        let old_key = instance_key(instance);
        let entry = match self.by_instance.remove(&old_key) {
            Some(entry) => entry,
            None => {
                return Err(Error::validation(
                    "instance",
                    instance,
                    "unknown instance name",
                ));
            }
        };
        self.drop_type_index(&entry.data.type_name, &old_key);

        let new_key = instance_key(&renamed.instance);
        if self.by_instance.contains_key(&new_key) {
            // The replacement name is taken locally too; put the old entry
            // back so the caller can pick the next candidate.
            let type_name = entry.data.type_name.clone();
            self.by_type.insert(type_name, old_key.clone());
            let dup = renamed.instance;
            self.by_instance.insert(old_key, entry);
            return Err(Error::validation(
                "instance",
                dup,
                "instance name already registered",
            ));
        }

        self.by_type
            .insert(renamed.type_name.clone(), new_key.clone());
        self.by_instance.insert(
            new_key,
            ServiceEntry {
                data: renamed,
                phase: Phase::Probing,
                attempts: entry.attempts + 1,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, instance: &str) -> Option<ServiceData> {
        let key = instance_key(instance);
        let entry = self.by_instance.remove(&key)?;
        self.drop_type_index(&entry.data.type_name, &key);
        Some(entry.data)
    }

    fn drop_type_index(&mut self, type_name: &Name, key: &str) {
        if let Some(keys) = self.by_type.get_vec_mut(type_name) {
            keys.retain(|k| k != key);
        }
    }

    /// Registered instance names, in no particular order.
    pub fn instances(&self) -> Vec<String> {
        self.by_instance
            .values()
            .map(|entry| entry.data.instance.clone())
            .collect()
    }

    /// Distinct service types with at least one live entry, for the DNS-SD
    /// meta-query.
    pub fn service_types(&self) -> Vec<Name> {
        self.by_type
            .keys()
            .filter(|ty| {
                self.by_type
                    .get_vec(ty)
                    .map(|keys| !keys.is_empty())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Entries of a given service type, in no particular order.
    pub fn find_by_type(&self, type_name: &Name) -> Vec<&ServiceEntry> {
        match self.by_type.get_vec(type_name) {
            Some(keys) => keys
                .iter()
                .filter_map(|key| self.by_instance.get(key))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The entry whose fqdn matches `name`, if any.
    pub fn find_by_fqdn(&self, name: &Name) -> Option<&ServiceEntry> {
        let instance = name.first_label()?;
        let entry = self.get(&instance)?;
        if entry.data.fqdn == *name {
            Some(entry)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.by_instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_instance.is_empty()
    }
}

fn instance_key(instance: &str) -> String {
    instance.to_lowercase()
}

/// The next candidate after a name conflict: `"Printer"` becomes
/// `"Printer (2)"`, `"Printer (2)"` becomes `"Printer (3)"`.
pub fn next_instance_name(current: &str) -> String {
    if let Some(open) = current.rfind(" (") {
        if current.ends_with(')') {
            let digits = &current[open + 2..current.len() - 1];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = digits.parse::<u64>() {
                    return format!("{} ({})", &current[..open], n + 1);
                }
            }
        }
    }
    format!("{} (2)", current)
}
