use std::fmt::{Display, Formatter};
use std::sync::RwLock;
use log::{debug, error};
use crate::error::*;

/// Stable identifier of a device instance within a running process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:X}]", self.0)
    }
}

#[derive(Clone, Default)]
struct Entry {
    /// Primary hash of the stored string, 0 when unused.
    used: u32,
    value: Option<String>,
}

/// Open addressing table mapping device instance ids to [SessionId]s.
///
/// The table never grows. Entries are never removed, so an index handed out
/// once identifies the same string for the life of the table.
pub struct IdentityTable {
    size: usize,
    entries: RwLock<Vec<Entry>>,
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

fn djb2(text: &str) -> u32 {
    let mut r: u32 = 5381;
    for c in text.bytes() {
        r = r.wrapping_mul(33).wrapping_add(c as u32);
    }
    if r == 0 { 1 } else { r }
}

enum Probe {
    Found(usize),
    Free(usize),
    Full,
}

impl IdentityTable {
    /// `capacity` is rounded up to the next odd prime.
    pub fn new(capacity: usize) -> Self {
        let mut size = capacity.max(5) | 1;
        while !is_prime(size) {
            size += 2;
        }
        debug!("identity table created with {} entries", size);
        Self {
            size,
            entries: RwLock::new(vec![Entry::default(); size + 1]),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn probe(&self, entries: &[Entry], text: &str) -> Probe {
        let r = djb2(text);
        let size = self.size as u32;
        let mut hval = r % size;
        if hval == 0 {
            hval = 1;
        }
        let matches = |i: u32| {
            let e = &entries[i as usize];
            e.used == hval && e.value.as_deref() == Some(text)
        };

        if entries[hval as usize].used == 0 {
            return Probe::Free(hval as usize);
        }
        if matches(hval) {
            return Probe::Found(hval as usize);
        }

        let step = 1 + hval % (size - 2);
        let mut idx = hval;
        loop {
            if idx <= step {
                idx = size + idx - step;
            } else {
                idx -= step;
            }
            if idx == hval {
                return Probe::Full;
            }
            if entries[idx as usize].used == 0 {
                return Probe::Free(idx as usize);
            }
            if matches(idx) {
                return Probe::Found(idx as usize);
            }
        }
    }

    /// Identifier of `text`, inserting it on first sight.
    pub fn hash(&self, text: &str) -> Result<SessionId> {
        {
            let entries = self.entries.read()?;
            if let Probe::Found(i) = self.probe(&entries, text) {
                return Ok(SessionId(i as u32));
            }
        }

        let mut entries = self.entries.write()?;
        match self.probe(&entries, text) {
            Probe::Found(i) => Ok(SessionId(i as u32)),
            Probe::Free(i) => {
                let r = djb2(text) % self.size as u32;
                entries[i].used = if r == 0 { 1 } else { r };
                entries[i].value = Some(text.to_string());
                Ok(SessionId(i as u32))
            }
            Probe::Full => {
                error!("identity table is full, cannot register '{}'", text);
                Err(Error::CapacityExhausted(self.size))
            }
        }
    }

    /// Identifier of `text` if it was ever hashed.
    pub fn lookup(&self, text: &str) -> Option<SessionId> {
        let entries = self.entries.read().ok()?;
        match self.probe(&entries, text) {
            Probe::Found(i) => Some(SessionId(i as u32)),
            _ => None,
        }
    }
}

/// Turn a device interface path into the instance id of the device exposing it.
///
/// `\\?\USB#VID_1234&PID_5678#0001#{guid}` becomes `USB\VID_1234&PID_5678\0001`.
pub fn parse_device_interface_path(interface_path: &str) -> Option<String> {
    let mut path = interface_path;
    for prefix in ["\\\\?\\", "\\\\.\\", "##?#", "##.#"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            path = rest;
            break;
        }
    }
    if let Some(pos) = path.find('{') {
        path = path[..pos].trim_end_matches('#');
    }
    if path.is_empty() {
        return None;
    }
    Some(path.to_uppercase().replace('#', "\\"))
}

/// Normalize an interface path so it can be compared and opened.
pub fn sanitize_path(path: &str) -> String {
    const ROOT: &str = "\\\\.\\";
    let body = if path.len() >= ROOT.len()
        && path.as_bytes()[0] == b'\\' && path.as_bytes()[1] == b'\\' && path.as_bytes()[3] == b'\\' {
        &path[ROOT.len()..]
    } else {
        path
    };
    format!("{}{}", ROOT, body.to_uppercase().replace('\\', "#"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let table = IdentityTable::new(1021);
        let a = table.hash("USB\\VID_1234&PID_5678\\0001").unwrap();
        let b = table.hash("USB\\ROOT_HUB30\\4&1234&0&0").unwrap();
        assert_ne!(a, b);
        assert_eq!(table.hash("USB\\VID_1234&PID_5678\\0001").unwrap(), a);
        assert_eq!(table.lookup("USB\\VID_1234&PID_5678\\0001"), Some(a));
        assert_eq!(table.lookup("USB\\VID_FFFF&PID_FFFF\\9"), None);
        assert_ne!(a.0, 0);
    }

    #[test]
    fn full_table_fails_explicitly() {
        let table = IdentityTable::new(5);
        assert_eq!(table.size(), 5);
        let mut ids = vec![];
        let mut err = None;
        for i in 0..10 {
            match table.hash(&format!("DEV{}", i)) {
                Ok(id) => ids.push((i, id)),
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert_eq!(err, Some(Error::CapacityExhausted(5)));
        for (i, id) in ids {
            assert_eq!(table.hash(&format!("DEV{}", i)).unwrap(), id);
        }
    }

    #[test]
    fn interface_paths() {
        let id = parse_device_interface_path(
            "\\\\?\\usb#vid_1234&pid_5678&mi_01#7&2f0d&0&0001#{a5dcbf10-6530-11d2-901f-00c04fb951ed}");
        assert_eq!(id.as_deref(), Some("USB\\VID_1234&PID_5678&MI_01\\7&2F0D&0&0001"));
        assert_eq!(parse_device_interface_path("\\\\?\\USB#VID_1&PID_2#sé#{a5dcbf10-6530-11d2-901f-00c04fb951ed}").as_deref(),
                   Some("USB\\VID_1&PID_2\\SÉ"));
        assert_eq!(parse_device_interface_path("\\\\?\\{a5dcbf10-6530-11d2-901f-00c04fb951ed}"), None);
        assert_eq!(sanitize_path("\\\\?\\hid#vid_1&pid_2\\x"), "\\\\.\\HID#VID_1&PID_2#X");
        assert_eq!(sanitize_path("usb#a"), "\\\\.\\USB#A");
    }
}
