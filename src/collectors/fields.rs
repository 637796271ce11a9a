//! Vendor JSON field table
//!
//! Firmware versions disagree on where they put the same value. Each field
//! is looked up through an ordered list of JSON pointers; the first pointer
//! that yields a usable value wins and its path is reported alongside the
//! value. Nothing is guessed: if no candidate matches the field is absent.

use serde_json::Value;

use crate::LinkStatus;

/// Outcome of one field lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Found { path: &'static str, value: T },
    Absent,
}

impl<T> Field<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Field::Found { value, .. } => Some(value),
            Field::Absent => None,
        }
    }

    pub fn path(&self) -> Option<&'static str> {
        match self {
            Field::Found { path, .. } => Some(*path),
            Field::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub candidates: &'static [&'static str],
}

pub const HOSTNAME: FieldSpec = FieldSpec {
    name: "hostname",
    candidates: &["/results/hostname", "/results/host_name", "/hostname"],
};

pub const UPTIME: FieldSpec = FieldSpec {
    name: "uptime",
    candidates: &[
        "/results/uptime",
        "/results/system_uptime",
        "/results/uptime/0/current",
        "/uptime",
    ],
};

pub const CPU: FieldSpec = FieldSpec {
    name: "cpu",
    candidates: &[
        "/results/cpu/0/current",
        "/results/cpu/current",
        "/results/cpu",
        "/results/cpu_usage",
        "/cpu",
    ],
};

pub const MEMORY: FieldSpec = FieldSpec {
    name: "memory",
    candidates: &[
        "/results/mem/0/current",
        "/results/mem/current",
        "/results/mem",
        "/results/memory_usage",
        "/mem",
    ],
};

pub const SESSIONS: FieldSpec = FieldSpec {
    name: "sessions",
    candidates: &[
        "/results/session/0/current",
        "/results/session/current",
        "/results/sessions",
        "/results/session_count",
    ],
};

/// Where the interface list lives
pub const INTERFACE_LIST: FieldSpec = FieldSpec {
    name: "interfaces",
    candidates: &["/results/interfaces", "/results", "/interfaces"],
};

pub const IFACE_NAME: FieldSpec = FieldSpec {
    name: "name",
    candidates: &["/name", "/interface", "/id"],
};

pub const IFACE_IP: FieldSpec = FieldSpec {
    name: "ip",
    candidates: &["/ip", "/ipv4", "/ip_address", "/ipv4_addresses/0/ip"],
};

pub const IFACE_LINK: FieldSpec = FieldSpec {
    name: "link",
    candidates: &["/link", "/status", "/link_status", "/state"],
};

fn lookup<T>(doc: &Value, spec: &FieldSpec, convert: impl Fn(&Value) -> Option<T>) -> Field<T> {
    spec.candidates
        .iter()
        .find_map(|&path| {
            doc.pointer(path)
                .and_then(&convert)
                .map(|value| Field::Found { path, value })
        })
        .unwrap_or(Field::Absent)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn as_link(value: &Value) -> Option<LinkStatus> {
    match value {
        Value::Bool(true) => Some(LinkStatus::Up),
        Value::Bool(false) => Some(LinkStatus::Down),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "up" | "connected" | "online" | "1" => Some(LinkStatus::Up),
            "down" | "disconnected" | "offline" | "0" => Some(LinkStatus::Down),
            _ => None,
        },
        _ => None,
    }
}

pub fn number(doc: &Value, spec: &FieldSpec) -> Field<f64> {
    lookup(doc, spec, as_number)
}

pub fn text(doc: &Value, spec: &FieldSpec) -> Field<String> {
    lookup(doc, spec, as_text)
}

pub fn link(doc: &Value, spec: &FieldSpec) -> Field<LinkStatus> {
    lookup(doc, spec, as_link)
}

/// Strip a prefix length or netmask: `203.0.113.5/24` and
/// `203.0.113.5 255.255.255.0` both become `203.0.113.5`.
pub fn normalize_ip(raw: &str) -> Option<String> {
    let ip = raw.split(['/', ' ']).next()?.trim();
    if ip.is_empty() || ip == "0.0.0.0" {
        return None;
    }
    Some(ip.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceRecord {
    pub name: String,
    pub ip: Option<String>,
    pub link: Option<LinkStatus>,
}

/// Flatten the vendor interface payload, which is either an array of
/// records or an object keyed by interface name.
pub fn interface_records(doc: &Value) -> Vec<InterfaceRecord> {
    let container = INTERFACE_LIST
        .candidates
        .iter()
        .filter_map(|path| doc.pointer(path))
        .find(|value| value.is_array() || value.is_object());

    let entries: Vec<(Option<&str>, &Value)> = match container {
        Some(Value::Array(items)) => items.iter().map(|item| (None, item)).collect(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect(),
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter(|(_, record)| record.is_object())
        .filter_map(|(key, record)| {
            let name = text(record, &IFACE_NAME)
                .value()
                .or_else(|| key.map(str::to_string))?;
            Some(InterfaceRecord {
                name,
                ip: text(record, &IFACE_IP)
                    .value()
                    .and_then(|raw| normalize_ip(&raw)),
                link: link(record, &IFACE_LINK).value(),
            })
        })
        .collect()
}
