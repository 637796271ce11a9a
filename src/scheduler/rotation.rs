use crate::tasks::DeviceTask;

type RotationKey = (String, String, String);

fn key_of(device: &DeviceTask) -> RotationKey {
    let (site, hostname, id) = device.rotation_key();
    (site.to_string(), hostname.to_string(), id.to_string())
}

/// Round-robin cursor over devices ordered by `(site, hostname, id)`.
///
/// The cursor remembers the key of the last device handed out rather than
/// an index, so it survives devices being added or removed between pulls.
#[derive(Debug, Default)]
pub struct Rotation {
    last: Option<RotationKey>,
}

impl Rotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// `devices` must already be sorted by rotation key
    pub fn advance<'a>(&mut self, devices: &'a [DeviceTask]) -> Option<&'a DeviceTask> {
        let next = match &self.last {
            None => devices.first(),
            Some(last) => devices
                .iter()
                .find(|device| {
                    let (site, hostname, id) = device.rotation_key();
                    (site, hostname, id) > (last.0.as_str(), last.1.as_str(), last.2.as_str())
                })
                .or_else(|| devices.first()),
        }?;

        self.last = Some(key_of(next));
        Some(next)
    }
}

pub fn sort_for_rotation(devices: &mut [DeviceTask]) {
    devices.sort_by(|a, b| a.rotation_key().cmp(&b.rotation_key()));
}
